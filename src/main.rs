#[tokio::main]
async fn main() {
    let exit_code = kube_fleet_reset::run().await;
    std::process::exit(exit_code);
}

mod cli;
mod executor;
mod hosts;
mod job;
mod models;
mod orchestrator;
mod procedure;
mod report;
mod ssh_client;

use std::sync::Arc;

use clap::Parser;

use cli::Cli;
use executor::SshResetExecutor;
use report::{ConsoleReporter, Reporter};

/// Parse the command line, dispatch the fleet reset and return the process
/// exit code: 0 when every host succeeded, 1 when any failed. Configuration
/// errors exit through clap before this returns.
pub async fn run() -> i32 {
    let cli = Cli::parse();
    let targets = cli.resolve_targets_or_exit();
    let options = cli.run_options();
    let dry_run = options.dry_run;

    let reporter: Arc<dyn Reporter> = Arc::new(ConsoleReporter::new(options.verbose));
    let plan = orchestrator::build_execution_plan(targets, options);
    let executor = Arc::new(SshResetExecutor);

    let fleet_report = orchestrator::run_fleet_reset(executor, plan, reporter).await;

    if let Some(path) = &cli.report {
        if let Err(message) = report::write_text_report(path, &fleet_report) {
            eprintln!("{message}");
        }
    }
    if let Some(path) = &cli.json_report {
        if let Err(message) = report::write_json_report(path, &fleet_report) {
            eprintln!("{message}");
        }
    }

    if !dry_run {
        let summary = &fleet_report.summary;
        println!(
            "{} host(s): {} succeeded, {} failed",
            summary.total, summary.succeeded, summary.failed
        );
    }

    orchestrator::exit_code_for(&fleet_report.summary)
}

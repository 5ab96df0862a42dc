use std::path::PathBuf;

use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};

use crate::hosts;
use crate::models::{DispatchMode, HostTarget, RunOptions};
use crate::orchestrator::DEFAULT_PARALLEL_LIMIT;

#[derive(Parser, Debug)]
#[command(
    name = "kube-fleet-reset",
    version,
    about = "Reset Kubernetes nodes to a clean pre-kubeadm-init state over SSH"
)]
pub struct Cli {
    /// Space-separated list of targets: `host`, `user@host`, `host:port`
    #[arg(long, value_name = "HOSTS")]
    pub hosts: Option<String>,

    /// File with one target per line; blank lines and `#` comments ignored
    #[arg(long, value_name = "PATH")]
    pub hosts_file: Option<PathBuf>,

    /// Stream remote progress and command traces
    #[arg(short, long)]
    pub verbose: bool,

    /// Report intended targets without any remote action
    #[arg(long)]
    pub dry_run: bool,

    /// Reset hosts one at a time, in resolution order (default)
    #[arg(long, conflicts_with = "parallel")]
    pub serial: bool,

    /// Reset hosts concurrently
    #[arg(long)]
    pub parallel: bool,

    /// Maximum concurrent host sessions in parallel mode
    #[arg(long, value_name = "N", default_value_t = DEFAULT_PARALLEL_LIMIT)]
    pub max_concurrent: usize,

    /// Write a plain-text fleet report to this path
    #[arg(long, value_name = "PATH")]
    pub report: Option<PathBuf>,

    /// Write a JSON fleet report to this path
    #[arg(long, value_name = "PATH")]
    pub json_report: Option<PathBuf>,
}

impl Cli {
    /// Resolve the target set, exiting through clap's usage error path when
    /// the input is invalid or empty.
    pub fn resolve_targets_or_exit(&self) -> Vec<HostTarget> {
        match hosts::resolve_targets(self.hosts.as_deref(), self.hosts_file.as_deref()) {
            Ok(targets) if targets.is_empty() => Cli::command()
                .error(
                    ErrorKind::MissingRequiredArgument,
                    "No hosts provided; use --hosts or --hosts-file",
                )
                .exit(),
            Ok(targets) => targets,
            Err(message) => Cli::command()
                .error(ErrorKind::ValueValidation, message)
                .exit(),
        }
    }

    pub fn run_options(&self) -> RunOptions {
        RunOptions {
            dry_run: self.dry_run,
            verbose: self.verbose,
            dispatch: if self.parallel {
                DispatchMode::Parallel
            } else {
                DispatchMode::Serial
            },
            max_concurrent: self.max_concurrent.max(1),
        }
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::Cli;
    use crate::models::DispatchMode;
    use crate::orchestrator::DEFAULT_PARALLEL_LIMIT;

    #[test]
    fn defaults_to_serial_quiet_live_mode() {
        let cli = Cli::try_parse_from(["kube-fleet-reset", "--hosts", "a b"]).unwrap();
        let options = cli.run_options();

        assert_eq!(options.dispatch, DispatchMode::Serial);
        assert!(!options.dry_run);
        assert!(!options.verbose);
        assert_eq!(options.max_concurrent, DEFAULT_PARALLEL_LIMIT);
    }

    #[test]
    fn parallel_flag_selects_parallel_dispatch() {
        let cli = Cli::try_parse_from([
            "kube-fleet-reset",
            "--hosts",
            "a",
            "--parallel",
            "--max-concurrent",
            "3",
        ])
        .unwrap();
        let options = cli.run_options();

        assert_eq!(options.dispatch, DispatchMode::Parallel);
        assert_eq!(options.max_concurrent, 3);
    }

    #[test]
    fn serial_and_parallel_flags_conflict() {
        let error =
            Cli::try_parse_from(["kube-fleet-reset", "--hosts", "a", "--serial", "--parallel"])
                .unwrap_err();
        assert_eq!(error.kind(), clap::error::ErrorKind::ArgumentConflict);
    }

    #[test]
    fn unknown_flag_is_a_usage_error() {
        let error = Cli::try_parse_from(["kube-fleet-reset", "--bogus"]).unwrap_err();
        assert_eq!(error.kind(), clap::error::ErrorKind::UnknownArgument);
    }

    #[test]
    fn verbose_and_dry_run_flags_parse() {
        let cli =
            Cli::try_parse_from(["kube-fleet-reset", "--hosts", "a", "-v", "--dry-run"]).unwrap();
        let options = cli.run_options();

        assert!(options.verbose);
        assert!(options.dry_run);
    }

    #[test]
    fn zero_max_concurrent_is_clamped_to_one() {
        let cli = Cli::try_parse_from([
            "kube-fleet-reset",
            "--hosts",
            "a",
            "--parallel",
            "--max-concurrent",
            "0",
        ])
        .unwrap();
        assert_eq!(cli.run_options().max_concurrent, 1);
    }
}

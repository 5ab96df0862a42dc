use std::path::Path;

use chrono::Utc;
use tokio::sync::mpsc;

use crate::job::HostResetOutcome;
use crate::models::{FleetReport, HostResetStatus, PhaseStatus, ProgressEvent};
use crate::ssh_client::CommandResult;

pub type ProgressSender = mpsc::UnboundedSender<ProgressEvent>;
pub type ProgressReceiver = mpsc::UnboundedReceiver<ProgressEvent>;

pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

pub fn push_progress(
    sender: &ProgressSender,
    host: Option<&str>,
    phase: &str,
    message: impl Into<String>,
) {
    let _ = sender.send(ProgressEvent {
        host: host.map(str::to_string),
        phase: phase.to_string(),
        message: message.into(),
        timestamp: Utc::now(),
    });
}

pub fn append_command_log(log: &mut String, result: &CommandResult) {
    log.push_str(&format!(
        "\n$ {}\n[exit={}]\n[stdout]\n{}\n[stderr]\n{}\n",
        result.command, result.exit_status, result.stdout, result.stderr
    ));
}

pub fn status_label(status: &HostResetStatus) -> &'static str {
    match status {
        HostResetStatus::Success => "SUCCESS",
        HostResetStatus::Failed => "FAILED",
    }
}

pub fn phase_status_label(status: &PhaseStatus) -> &'static str {
    match status {
        PhaseStatus::Ok => "ok",
        PhaseStatus::SkippedAbsent => "skipped (absent)",
        PhaseStatus::FailedNonFatal => "failed (non-fatal)",
        PhaseStatus::FailedFatal => "failed (fatal)",
    }
}

/// Where run output goes. The console implementation is the live surface;
/// tests substitute a recording implementation to assert on emitted lines.
pub trait Reporter: Send + Sync {
    fn progress(&self, event: &ProgressEvent);
    fn would_reset(&self, host: &str);
    fn completion(&self, host: &str, outcome: &HostResetOutcome);
}

pub struct ConsoleReporter {
    verbose: bool,
}

impl ConsoleReporter {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl Reporter for ConsoleReporter {
    fn progress(&self, event: &ProgressEvent) {
        if !self.verbose {
            return;
        }
        let host = event.host.as_deref().unwrap_or("fleet");
        println!("[{host}] {}: {}", event.phase, event.message);
    }

    fn would_reset(&self, host: &str) {
        println!("would reset {host}");
    }

    fn completion(&self, host: &str, outcome: &HostResetOutcome) {
        match outcome {
            HostResetOutcome::Success(_) => println!("{host}: reset complete"),
            HostResetOutcome::Failure(failure) => println!(
                "{host}: reset failed in phase `{}` [{}] {}",
                failure.phase, failure.code, failure.message
            ),
        }
    }
}

pub fn render_text_report(report: &FleetReport) -> String {
    let summary = &report.summary;
    let mut text = String::new();
    text.push_str(&format!("run {}\n", summary.run_id));
    text.push_str(&format!(
        "started {}\n",
        summary.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    if let Some(finished_at) = summary.finished_at {
        text.push_str(&format!(
            "finished {}\n",
            finished_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));
    }
    text.push_str(&format!(
        "total={} succeeded={} failed={}\n",
        summary.total, summary.succeeded, summary.failed
    ));

    for result in &report.results {
        text.push('\n');
        text.push_str(&format!(
            "{}  {}  {}",
            result.host,
            status_label(&result.status),
            result.phase
        ));
        if let (Some(code), Some(message)) = (&result.error_code, &result.error_message) {
            text.push_str(&format!("  [{code}] {message}"));
        }
        text.push('\n');
        for phase in &result.phases {
            text.push_str(&format!(
                "  phase {} {}: {}",
                phase.index,
                phase.name,
                phase_status_label(&phase.status)
            ));
            if let Some(detail) = &phase.detail {
                text.push_str(&format!(" ({detail})"));
            }
            text.push('\n');
        }
    }

    text
}

pub fn write_text_report(path: &Path, report: &FleetReport) -> Result<(), String> {
    std::fs::write(path, render_text_report(report)).map_err(|error| {
        format!(
            "Failed to write text report to `{}`: {error}",
            path.display()
        )
    })
}

pub fn write_json_report(path: &Path, report: &FleetReport) -> Result<(), String> {
    let json = serde_json::to_string_pretty(report)
        .map_err(|error| format!("Failed to serialize fleet report: {error}"))?;
    std::fs::write(path, json).map_err(|error| {
        format!(
            "Failed to write JSON report to `{}`: {error}",
            path.display()
        )
    })
}

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_SSH_USER: &str = "root";
pub const DEFAULT_SSH_PORT: u16 = 22;

/// One target node, addressed as `host`, `user@host`, `host:port` or
/// `user@host:port`. Credentials are ambient (SSH agent or system ssh).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostTarget {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl HostTarget {
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port,
        }
    }

    /// The identity prefix used in progress lines and result keys.
    pub fn label(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for HostTarget {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.user != DEFAULT_SSH_USER {
            write!(formatter, "{}@", self.user)?;
        }
        write!(formatter, "{}", self.host)?;
        if self.port != DEFAULT_SSH_PORT {
            write!(formatter, ":{}", self.port)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    Serial,
    Parallel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunOptions {
    pub dry_run: bool,
    pub verbose: bool,
    pub dispatch: DispatchMode,
    pub max_concurrent: usize,
}

/// The full set of reset jobs for one run. Immutable once dispatch begins:
/// every job shares this configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionPlan {
    pub run_id: String,
    pub targets: Vec<HostTarget>,
    pub options: RunOptions,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Ok,
    SkippedAbsent,
    FailedNonFatal,
    FailedFatal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseReport {
    pub index: usize,
    pub name: String,
    pub status: PhaseStatus,
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostResetStatus {
    Success,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostResetResult {
    pub host: String,
    pub status: HostResetStatus,
    pub phase: String,
    pub phases: Vec<PhaseReport>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetSummary {
    pub run_id: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FleetReport {
    pub summary: FleetSummary,
    pub results: Vec<HostResetResult>,
    pub raw_logs: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub host: Option<String>,
    pub phase: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

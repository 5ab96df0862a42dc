use crate::models::{HostResetResult, HostResetStatus, PhaseReport};

pub const CODE_SSH_CONNECT_FAILED: &str = "SSH_CONNECT_FAILED";
pub const CODE_SSH_COMMAND_FAILED: &str = "SSH_COMMAND_FAILED";
pub const CODE_PRIVILEGE_CHECK_FAILED: &str = "PRIVILEGE_CHECK_FAILED";
pub const CODE_PORT_RELEASE_TIMEOUT: &str = "PORT_RELEASE_TIMEOUT";
pub const CODE_JOB_JOIN_FAILED: &str = "JOB_JOIN_FAILED";

#[derive(Debug)]
pub struct HostResetSuccess {
    pub phases: Vec<PhaseReport>,
    pub raw_log: String,
}

#[derive(Debug)]
pub struct HostResetFailure {
    pub phase: String,
    pub code: String,
    pub message: String,
    pub phases: Vec<PhaseReport>,
    pub raw_log: String,
}

/// Terminal state of one reset job. Session-level failures (unreachable
/// host, auth rejection, dropped connection) and the procedure's one fatal
/// condition carry distinct codes so the report can tell them apart.
#[derive(Debug)]
pub enum HostResetOutcome {
    Success(HostResetSuccess),
    Failure(HostResetFailure),
}

impl HostResetOutcome {
    pub fn failure(
        phase: impl Into<String>,
        code: &str,
        message: impl Into<String>,
        raw_log: String,
    ) -> Self {
        Self::Failure(HostResetFailure {
            phase: phase.into(),
            code: code.to_string(),
            message: message.into(),
            phases: Vec::new(),
            raw_log,
        })
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    pub fn into_result(self, host: &str) -> (HostResetResult, String) {
        match self {
            Self::Success(success) => (
                HostResetResult {
                    host: host.to_string(),
                    status: HostResetStatus::Success,
                    phase: "done".to_string(),
                    phases: success.phases,
                    error_code: None,
                    error_message: None,
                },
                success.raw_log,
            ),
            Self::Failure(failure) => (
                HostResetResult {
                    host: host.to_string(),
                    status: HostResetStatus::Failed,
                    phase: failure.phase,
                    phases: failure.phases,
                    error_code: Some(failure.code),
                    error_message: Some(failure.message),
                },
                failure.raw_log,
            ),
        }
    }
}

use crate::job::{
    HostResetFailure, HostResetOutcome, HostResetSuccess, CODE_PRIVILEGE_CHECK_FAILED,
    CODE_SSH_COMMAND_FAILED, CODE_SSH_CONNECT_FAILED,
};
use crate::models::HostTarget;
use crate::procedure::run_reset_procedure;
use crate::report::{push_progress, ProgressSender};
use crate::ssh_client::{connect_ssh, run_preflight_checks, PreflightFacts, PrivilegedRunner};

/// Executes one reset job against one host. Blocking; the orchestrator
/// drives implementations from `spawn_blocking`. Tests substitute fakes to
/// exercise dispatch behavior without sessions.
pub trait ResetExecutor: Send + Sync {
    fn reset_host(&self, target: &HostTarget, progress: &ProgressSender) -> HostResetOutcome;
}

/// The live policy: connect, verify privilege, then run the reset phases
/// over the session.
pub struct SshResetExecutor;

impl ResetExecutor for SshResetExecutor {
    fn reset_host(&self, target: &HostTarget, progress: &ProgressSender) -> HostResetOutcome {
        let label = target.label();
        let mut collected_log = String::new();

        push_progress(
            progress,
            Some(&label),
            "connecting",
            format!("Connecting {}:{}", target.host, target.port),
        );
        let connected = match connect_ssh(target) {
            Ok(value) => value,
            Err(message) => {
                return HostResetOutcome::failure(
                    "connecting",
                    CODE_SSH_CONNECT_FAILED,
                    message,
                    collected_log,
                );
            }
        };
        push_progress(
            progress,
            Some(&label),
            "preflight",
            format!("SSH connected. fingerprint={}", connected.fingerprint),
        );

        let preflight = match run_preflight_checks(&connected) {
            Ok(value) => value,
            Err(message) => {
                return HostResetOutcome::failure(
                    "preflight",
                    CODE_SSH_COMMAND_FAILED,
                    message,
                    collected_log,
                );
            }
        };
        if let Some(reason) = privilege_fail_reason(&preflight) {
            return HostResetOutcome::failure(
                "preflight",
                CODE_PRIVILEGE_CHECK_FAILED,
                reason,
                collected_log,
            );
        }
        push_progress(
            progress,
            Some(&label),
            "preflight",
            "Privilege preflight passed, starting reset phases",
        );

        let runner = PrivilegedRunner::new(&connected, preflight.is_root);
        match run_reset_procedure(&runner, &label, progress, &mut collected_log) {
            Ok(phases) => HostResetOutcome::Success(HostResetSuccess {
                phases,
                raw_log: collected_log,
            }),
            Err(failure) => HostResetOutcome::Failure(HostResetFailure {
                phase: failure.phase,
                code: failure.code,
                message: failure.message,
                phases: failure.phases,
                raw_log: collected_log,
            }),
        }
    }
}

pub fn privilege_fail_reason(preflight: &PreflightFacts) -> Option<String> {
    if !preflight.has_bash {
        return Some("Remote system is missing bash".to_string());
    }
    if !preflight.is_root && !preflight.can_sudo {
        return Some("Remote user is not root and passwordless sudo is unavailable".to_string());
    }
    None
}

#[cfg(test)]
mod tests {
    use super::privilege_fail_reason;
    use crate::ssh_client::PreflightFacts;

    #[test]
    fn privilege_preflight_accepts_root_and_sudo_capable_users() {
        assert!(privilege_fail_reason(&PreflightFacts {
            is_root: true,
            has_bash: true,
            can_sudo: false,
        })
        .is_none());
        assert!(privilege_fail_reason(&PreflightFacts {
            is_root: false,
            has_bash: true,
            can_sudo: true,
        })
        .is_none());
    }

    #[test]
    fn privilege_preflight_rejects_unprivileged_or_bashless_hosts() {
        let no_privilege = privilege_fail_reason(&PreflightFacts {
            is_root: false,
            has_bash: true,
            can_sudo: false,
        });
        assert!(no_privilege.unwrap().contains("sudo"));

        let no_bash = privilege_fail_reason(&PreflightFacts {
            is_root: true,
            has_bash: false,
            can_sudo: true,
        });
        assert!(no_bash.unwrap().contains("bash"));
    }
}

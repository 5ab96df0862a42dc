use crate::job::{CODE_PORT_RELEASE_TIMEOUT, CODE_SSH_COMMAND_FAILED};
use crate::models::{PhaseReport, PhaseStatus};
use crate::report::{append_command_log, phase_status_label, push_progress, ProgressSender};
use crate::ssh_client::{CommandResult, RemoteRunner};

pub const API_SERVER_PORT: u16 = 6443;
pub const PORT_RELEASE_ATTEMPTS: u32 = 20;

pub const CONTROL_PLANE_CONTAINERS: [&str; 4] = [
    "kube-apiserver",
    "kube-controller-manager",
    "kube-scheduler",
    "etcd",
];

pub const CLUSTER_STATE_DIRECTORIES: [&str; 6] = [
    "/etc/kubernetes",
    "/var/lib/kubelet",
    "/var/lib/etcd",
    "/etc/cni/net.d",
    "/opt/cni/bin",
    "$HOME/.kube",
];

pub const RUNTIME_STATE_DIRECTORIES: [&str; 3] =
    ["/var/lib/containerd", "/var/lib/docker", "/etc/docker"];

pub const CNI_INTERFACES: [&str; 2] = ["cni0", "flannel.1"];

/// A fatal stop inside the procedure: either the port-release gate expired
/// or the session died mid-phase. Carries the phases completed so far.
#[derive(Debug)]
pub struct PhaseFailure {
    pub phase: String,
    pub code: String,
    pub message: String,
    pub phases: Vec<PhaseReport>,
}

enum PhaseOutcome {
    Completed(PhaseStatus, Option<String>),
    Fatal { code: &'static str, message: String },
}

struct PhaseContext<'a> {
    runner: &'a dyn RemoteRunner,
    host: &'a str,
    progress: &'a ProgressSender,
    log: &'a mut String,
}

impl PhaseContext<'_> {
    fn note(&self, phase: &str, message: impl Into<String>) {
        push_progress(self.progress, Some(self.host), phase, message);
    }

    fn run(&mut self, command: &str) -> Result<CommandResult, String> {
        let result = self.runner.run(command)?;
        append_command_log(self.log, &result);
        Ok(result)
    }

    fn run_suppressed(&mut self, command: &str, failures: &mut Vec<String>) -> Result<(), String> {
        let result = self.run(command)?;
        if result.exit_status != 0 {
            failures.push(format!("`{command}` exit={}", result.exit_status));
        }
        Ok(())
    }
}

fn suppressed_outcome(failures: Vec<String>) -> PhaseOutcome {
    if failures.is_empty() {
        PhaseOutcome::Completed(PhaseStatus::Ok, None)
    } else {
        PhaseOutcome::Completed(PhaseStatus::FailedNonFatal, Some(failures.join("; ")))
    }
}

type PhaseFn = fn(&mut PhaseContext) -> Result<PhaseOutcome, String>;

const PHASE_PLAN: [(&str, PhaseFn); 9] = [
    ("stop-kubelet", phase_stop_supervisor),
    ("runtime-up", phase_runtime_up),
    ("container-cleanup", phase_container_cleanup),
    ("kill-apiserver-port", phase_kill_port),
    ("port-release", phase_port_release_gate),
    ("kubeadm-reset", phase_cluster_purge),
    ("runtime-purge", phase_runtime_purge),
    ("network-teardown", phase_network_teardown),
    ("runtime-restart", phase_runtime_restart),
];

/// Drive the full teardown sequence over one connected host. Every phase is
/// best-effort except the port-release gate; a session-level command error
/// aborts with the phases completed so far.
pub fn run_reset_procedure(
    runner: &dyn RemoteRunner,
    host: &str,
    progress: &ProgressSender,
    collected_log: &mut String,
) -> Result<Vec<PhaseReport>, PhaseFailure> {
    let mut phases: Vec<PhaseReport> = Vec::new();
    let mut context = PhaseContext {
        runner,
        host,
        progress,
        log: collected_log,
    };

    for (index, (name, phase_fn)) in PHASE_PLAN.iter().enumerate() {
        context.note(name, format!("phase {index}: starting"));
        match phase_fn(&mut context) {
            Ok(PhaseOutcome::Completed(status, detail)) => {
                context.note(
                    name,
                    format!("phase {index}: {}", phase_status_label(&status)),
                );
                phases.push(PhaseReport {
                    index,
                    name: name.to_string(),
                    status,
                    detail,
                });
            }
            Ok(PhaseOutcome::Fatal { code, message }) => {
                context.note(name, format!("phase {index}: {message}"));
                phases.push(PhaseReport {
                    index,
                    name: name.to_string(),
                    status: PhaseStatus::FailedFatal,
                    detail: Some(message.clone()),
                });
                return Err(PhaseFailure {
                    phase: name.to_string(),
                    code: code.to_string(),
                    message,
                    phases,
                });
            }
            Err(session_error) => {
                return Err(PhaseFailure {
                    phase: name.to_string(),
                    code: CODE_SSH_COMMAND_FAILED.to_string(),
                    message: format!("phase {index} session failure: {session_error}"),
                    phases,
                });
            }
        }
    }

    Ok(phases)
}

fn phase_stop_supervisor(context: &mut PhaseContext) -> Result<PhaseOutcome, String> {
    let mut failures = Vec::new();
    for command in [
        "systemctl stop kubelet",
        "rm -f /var/run/kubelet.lock",
        "rm -f /etc/kubernetes/manifests/*.yaml",
    ] {
        context.run_suppressed(command, &mut failures)?;
    }
    Ok(suppressed_outcome(failures))
}

fn phase_runtime_up(context: &mut PhaseContext) -> Result<PhaseOutcome, String> {
    let mut failures = Vec::new();
    context.run_suppressed("systemctl start containerd", &mut failures)?;
    context.run_suppressed("sleep 2", &mut failures)?;
    Ok(suppressed_outcome(failures))
}

fn phase_container_cleanup(context: &mut PhaseContext) -> Result<PhaseOutcome, String> {
    let mut details = Vec::new();
    let mut any_available = false;
    let mut any_failure = false;

    for tool in &CONTAINER_TOOLS {
        if !tool.is_available(context)? {
            details.push(format!("{}: absent", tool.binary));
            continue;
        }
        any_available = true;

        let ids = tool.list_matching(context, &CONTROL_PLANE_CONTAINERS)?;
        if ids.is_empty() {
            details.push(format!("{}: no matches", tool.binary));
            continue;
        }

        let stopped_clean = tool.stop(context, &ids)?;
        let removed_clean = tool.remove(context, &ids)?;
        if !stopped_clean || !removed_clean {
            any_failure = true;
        }
        details.push(format!("{}: {} container(s)", tool.binary, ids.len()));
    }

    let status = if !any_available {
        PhaseStatus::SkippedAbsent
    } else if any_failure {
        PhaseStatus::FailedNonFatal
    } else {
        PhaseStatus::Ok
    };
    Ok(PhaseOutcome::Completed(status, Some(details.join("; "))))
}

fn phase_kill_port(context: &mut PhaseContext) -> Result<PhaseOutcome, String> {
    let mut failures = Vec::new();
    let kill_command = format!("fuser -k {API_SERVER_PORT}/tcp");
    context.run_suppressed(&kill_command, &mut failures)?;
    context.run_suppressed("systemctl stop containerd", &mut failures)?;
    Ok(suppressed_outcome(failures))
}

fn phase_port_release_gate(context: &mut PhaseContext) -> Result<PhaseOutcome, String> {
    let probe_command = format!("ss -ltn | grep -q ':{API_SERVER_PORT} '");

    for attempt in 1..=PORT_RELEASE_ATTEMPTS {
        let probe = context.run(&probe_command)?;
        if probe.exit_status != 0 {
            return Ok(PhaseOutcome::Completed(
                PhaseStatus::Ok,
                Some(format!(
                    "port {API_SERVER_PORT} released after {attempt} attempt(s)"
                )),
            ));
        }
        if attempt == PORT_RELEASE_ATTEMPTS {
            break;
        }
        context.note(
            "port-release",
            format!("port {API_SERVER_PORT} still bound (attempt {attempt}/{PORT_RELEASE_ATTEMPTS})"),
        );
        context.run("sleep 1")?;
    }

    Ok(PhaseOutcome::Fatal {
        code: CODE_PORT_RELEASE_TIMEOUT,
        message: format!(
            "port {API_SERVER_PORT} still bound after {PORT_RELEASE_ATTEMPTS} attempts"
        ),
    })
}

fn phase_cluster_purge(context: &mut PhaseContext) -> Result<PhaseOutcome, String> {
    let mut failures = Vec::new();
    context.run_suppressed("kubeadm reset --force", &mut failures)?;
    context.run_suppressed("crictl rm --force --all", &mut failures)?;
    context.run_suppressed(
        "docker ps -aq --filter name=k8s_ | xargs -r docker rm --force",
        &mut failures,
    )?;
    let purge_command = format!("rm -rf {}", CLUSTER_STATE_DIRECTORIES.join(" "));
    context.run_suppressed(&purge_command, &mut failures)?;
    Ok(suppressed_outcome(failures))
}

fn phase_runtime_purge(context: &mut PhaseContext) -> Result<PhaseOutcome, String> {
    let mut failures = Vec::new();
    let purge_command = format!("rm -rf {}", RUNTIME_STATE_DIRECTORIES.join(" "));
    context.run_suppressed(&purge_command, &mut failures)?;
    Ok(suppressed_outcome(failures))
}

fn phase_network_teardown(context: &mut PhaseContext) -> Result<PhaseOutcome, String> {
    let mut failures = Vec::new();

    for interface in CNI_INTERFACES {
        let delete_command = format!("ip link delete {interface}");
        context.run_suppressed(&delete_command, &mut failures)?;
    }

    for firewall_binary in ["iptables", "iptables-legacy"] {
        for flush_args in ["-F", "-X", "-t nat -F", "-t mangle -F"] {
            let flush_command = format!("{firewall_binary} {flush_args}");
            context.run_suppressed(&flush_command, &mut failures)?;
        }
    }
    context.run_suppressed("nft flush ruleset", &mut failures)?;

    for action in ["stop", "disable", "mask"] {
        let service_command = format!("systemctl {action} firewalld");
        context.run_suppressed(&service_command, &mut failures)?;
    }

    Ok(suppressed_outcome(failures))
}

fn phase_runtime_restart(context: &mut PhaseContext) -> Result<PhaseOutcome, String> {
    let mut failures = Vec::new();
    context.run_suppressed("systemctl start containerd", &mut failures)?;
    context.note("runtime-restart", "reset procedure finished");
    Ok(suppressed_outcome(failures))
}

#[derive(Clone, Copy)]
enum ToolFlavor {
    CriShim,
    LowLevel,
    HighLevel,
    DockerCompatible,
}

/// One container CLI surface the cleanup phase can drive. Different nodes
/// in a fleet carry different runtimes, so each tool is probed rather than
/// assumed.
pub struct ContainerTool {
    pub binary: &'static str,
    flavor: ToolFlavor,
}

pub const CONTAINER_TOOLS: [ContainerTool; 4] = [
    ContainerTool {
        binary: "crictl",
        flavor: ToolFlavor::CriShim,
    },
    ContainerTool {
        binary: "ctr",
        flavor: ToolFlavor::LowLevel,
    },
    ContainerTool {
        binary: "nerdctl",
        flavor: ToolFlavor::HighLevel,
    },
    ContainerTool {
        binary: "docker",
        flavor: ToolFlavor::DockerCompatible,
    },
];

impl ContainerTool {
    fn is_available(&self, context: &mut PhaseContext) -> Result<bool, String> {
        let probe = format!("command -v {}", self.binary);
        Ok(context.run(&probe)?.exit_status == 0)
    }

    fn list_matching(
        &self,
        context: &mut PhaseContext,
        names: &[&str],
    ) -> Result<Vec<String>, String> {
        let mut ids = Vec::new();
        for name in names {
            let list_command = match self.flavor {
                ToolFlavor::CriShim => format!("crictl ps -a --name {name} -q"),
                ToolFlavor::LowLevel => format!(
                    "ctr --namespace k8s.io containers list | grep {name} | awk '{{print $1}}'"
                ),
                ToolFlavor::HighLevel => {
                    format!("nerdctl --namespace k8s.io ps -a --filter name={name} -q")
                }
                ToolFlavor::DockerCompatible => format!("docker ps -a --filter name={name} -q"),
            };
            let result = context.run(&list_command)?;
            if result.exit_status != 0 {
                continue;
            }
            for line in result.stdout.lines() {
                let id = line.trim();
                if !id.is_empty() {
                    ids.push(id.to_string());
                }
            }
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    fn stop(&self, context: &mut PhaseContext, ids: &[String]) -> Result<bool, String> {
        self.run_batch(context, self.stop_commands(ids))
    }

    fn remove(&self, context: &mut PhaseContext, ids: &[String]) -> Result<bool, String> {
        self.run_batch(context, self.remove_commands(ids))
    }

    fn run_batch(&self, context: &mut PhaseContext, commands: Vec<String>) -> Result<bool, String> {
        let mut clean = true;
        for command in commands {
            if context.run(&command)?.exit_status != 0 {
                clean = false;
            }
        }
        Ok(clean)
    }

    fn stop_commands(&self, ids: &[String]) -> Vec<String> {
        match self.flavor {
            ToolFlavor::CriShim => vec![format!("crictl stop {}", ids.join(" "))],
            // ctr drives tasks one at a time
            ToolFlavor::LowLevel => ids
                .iter()
                .map(|id| format!("ctr --namespace k8s.io tasks kill {id}"))
                .collect(),
            ToolFlavor::HighLevel => {
                vec![format!("nerdctl --namespace k8s.io stop {}", ids.join(" "))]
            }
            ToolFlavor::DockerCompatible => vec![format!("docker stop {}", ids.join(" "))],
        }
    }

    fn remove_commands(&self, ids: &[String]) -> Vec<String> {
        match self.flavor {
            ToolFlavor::CriShim => vec![format!("crictl rm {}", ids.join(" "))],
            ToolFlavor::LowLevel => ids
                .iter()
                .map(|id| format!("ctr --namespace k8s.io containers delete {id}"))
                .collect(),
            ToolFlavor::HighLevel => {
                vec![format!("nerdctl --namespace k8s.io rm -f {}", ids.join(" "))]
            }
            ToolFlavor::DockerCompatible => vec![format!("docker rm -f {}", ids.join(" "))],
        }
    }
}

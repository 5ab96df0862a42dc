use std::io::Read;
use std::net::{TcpStream, ToSocketAddrs};
use std::process::{Command, Stdio};
use std::time::Duration;

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};
use ssh2::Session;

use crate::models::HostTarget;

pub const SSH_TIMEOUT_SECONDS: u64 = 30;
pub const REMOTE_COMMAND_TIMEOUT_SECONDS: u64 = 15 * 60;

const SSH_CHECK_MARKER: &str = "__KUBE_FLEET_RESET_SSH_OK__";

#[derive(Debug, Clone)]
pub struct CommandResult {
    pub command: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_status: i32,
}

#[derive(Debug, Clone)]
pub struct PreflightFacts {
    pub is_root: bool,
    pub has_bash: bool,
    pub can_sudo: bool,
}

/// Anything the reset procedure can issue remote commands through. The live
/// implementation is a privileged SSH session; tests substitute scripted
/// fakes.
pub trait RemoteRunner {
    fn run(&self, command: &str) -> Result<CommandResult, String>;
}

pub struct ConnectedSession {
    backend: SessionBackend,
    pub fingerprint: String,
}

enum SessionBackend {
    LibSsh2(Session),
    SystemSsh(SystemSshContext),
}

struct SystemSshContext {
    host: String,
    port: u16,
    username: String,
}

pub fn connect_ssh(target: &HostTarget) -> Result<ConnectedSession, String> {
    let socket_address = format!("{}:{}", target.host, target.port);
    let resolved_socket = socket_address
        .to_socket_addrs()
        .map_err(|error| format!("Failed to resolve target host `{socket_address}`: {error}"))?
        .next()
        .ok_or_else(|| format!("No resolved socket address for `{socket_address}`"))?;

    let tcp_stream =
        TcpStream::connect_timeout(&resolved_socket, Duration::from_secs(SSH_TIMEOUT_SECONDS))
            .map_err(|error| {
                format!("Failed to establish TCP connection to `{socket_address}`: {error}")
            })?;
    tcp_stream
        .set_read_timeout(Some(Duration::from_secs(REMOTE_COMMAND_TIMEOUT_SECONDS)))
        .map_err(|error| format!("Failed to configure TCP read timeout: {error}"))?;
    tcp_stream
        .set_write_timeout(Some(Duration::from_secs(REMOTE_COMMAND_TIMEOUT_SECONDS)))
        .map_err(|error| format!("Failed to configure TCP write timeout: {error}"))?;

    let mut session =
        Session::new().map_err(|error| format!("Failed to initialize SSH session: {error}"))?;
    session.set_tcp_stream(tcp_stream);
    session
        .handshake()
        .map_err(|error| format!("SSH handshake failed for `{socket_address}`: {error}"))?;

    let fingerprint = host_key_fingerprint(&session)?;

    // Identity is ambient: the agent holds the key material. On any agent
    // failure fall through to the system ssh binary, which resolves keys
    // and config the way the operator's shell would.
    let agent_result = authenticate_via_agent(&session, &target.user);
    if agent_result.is_err() || !session.authenticated() {
        let agent_error = agent_result
            .err()
            .unwrap_or_else(|| "authentication rejected".to_string());

        return match try_connect_with_system_ssh(target) {
            Ok(context) => Ok(ConnectedSession {
                backend: SessionBackend::SystemSsh(context),
                fingerprint,
            }),
            Err(system_error) => Err(format!(
                "SSH authentication failed for `{}`. agent={agent_error}; system ssh fallback={system_error}",
                target.label()
            )),
        };
    }

    Ok(ConnectedSession {
        backend: SessionBackend::LibSsh2(session),
        fingerprint,
    })
}

fn authenticate_via_agent(session: &Session, username: &str) -> Result<(), String> {
    let mut agent = session
        .agent()
        .map_err(|error| format!("Failed to open SSH agent handle: {error}"))?;
    agent
        .connect()
        .map_err(|error| format!("Failed to connect to SSH agent: {error}"))?;
    agent
        .list_identities()
        .map_err(|error| format!("Failed to list SSH agent identities: {error}"))?;

    let identities = agent
        .identities()
        .map_err(|error| format!("Failed to read SSH agent identities: {error}"))?;
    if identities.is_empty() {
        return Err("SSH agent holds no identities".to_string());
    }

    let mut last_error = String::new();
    for identity in identities {
        match agent.userauth(username, &identity) {
            Ok(()) if session.authenticated() => return Ok(()),
            Ok(()) => {}
            Err(error) => last_error = error.to_string(),
        }
    }

    if last_error.is_empty() {
        Err("No SSH agent identity was accepted".to_string())
    } else {
        Err(format!("No SSH agent identity was accepted: {last_error}"))
    }
}

/// Run the tool's privilege preflight: `whoami`, and `sudo -n true` when the
/// session user is not root. The reset procedure refuses to start without
/// root or passwordless sudo.
pub fn run_preflight_checks(connection: &ConnectedSession) -> Result<PreflightFacts, String> {
    let whoami = run_command(connection, "whoami", false)?;
    let is_root = whoami.stdout.trim() == "root";

    let has_bash = run_command(
        connection,
        "command -v bash >/dev/null && echo ok || echo missing",
        false,
    )?
    .stdout
    .trim()
        == "ok";

    let can_sudo = if is_root {
        true
    } else {
        run_raw_command(connection, "sudo -n true")?.exit_status == 0
    };

    Ok(PreflightFacts {
        is_root,
        has_bash,
        can_sudo,
    })
}

pub fn run_command(
    connection: &ConnectedSession,
    command: &str,
    use_sudo: bool,
) -> Result<CommandResult, String> {
    let wrapped_command = if use_sudo {
        format!("sudo -n bash -lc '{}'", single_quote_escape(command))
    } else {
        format!("bash -lc '{}'", single_quote_escape(command))
    };

    run_raw_command(connection, &wrapped_command).map(|result| CommandResult {
        command: command.to_string(),
        ..result
    })
}

fn run_raw_command(connection: &ConnectedSession, command: &str) -> Result<CommandResult, String> {
    match &connection.backend {
        SessionBackend::LibSsh2(session) => run_raw_command_via_libssh2(session, command),
        SessionBackend::SystemSsh(context) => run_raw_command_via_system_ssh(context, command),
    }
}

fn run_raw_command_via_libssh2(session: &Session, command: &str) -> Result<CommandResult, String> {
    let mut channel = session
        .channel_session()
        .map_err(|error| format!("Failed to open SSH channel: {error}"))?;
    channel
        .request_pty("xterm", None, None)
        .map_err(|error| format!("Failed to request PTY: {error}"))?;
    channel
        .exec(command)
        .map_err(|error| format!("Failed to execute remote command: {error}"))?;

    let mut stdout = String::new();
    let mut stderr = String::new();

    channel
        .read_to_string(&mut stdout)
        .map_err(|error| format!("Failed to read SSH stdout: {error}"))?;
    channel
        .stderr()
        .read_to_string(&mut stderr)
        .map_err(|error| format!("Failed to read SSH stderr: {error}"))?;

    channel
        .wait_close()
        .map_err(|error| format!("Failed while waiting for SSH command close: {error}"))?;

    let exit_status = channel
        .exit_status()
        .map_err(|error| format!("Failed to obtain SSH exit status: {error}"))?;

    Ok(CommandResult {
        command: command.to_string(),
        stdout,
        stderr,
        exit_status,
    })
}

fn run_raw_command_via_system_ssh(
    context: &SystemSshContext,
    command: &str,
) -> Result<CommandResult, String> {
    let mut ssh = Command::new("ssh");
    ssh.arg("-tt");

    for arg in build_system_ssh_args(context) {
        ssh.arg(arg);
    }
    ssh.arg(command);

    ssh.stdout(Stdio::piped());
    ssh.stderr(Stdio::piped());
    ssh.stdin(Stdio::null());

    let child = ssh
        .spawn()
        .map_err(|error| format!("Failed to launch system ssh process: {error}"))?;

    let output = child
        .wait_with_output()
        .map_err(|error| format!("Failed to collect system ssh output: {error}"))?;

    Ok(CommandResult {
        command: command.to_string(),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_status: output.status.code().unwrap_or(255),
    })
}

fn try_connect_with_system_ssh(target: &HostTarget) -> Result<SystemSshContext, String> {
    Command::new("ssh")
        .arg("-V")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map_err(|error| format!("ssh is not available in PATH: {error}"))?;

    let context = SystemSshContext {
        host: target.host.clone(),
        port: target.port,
        username: target.user.clone(),
    };

    let verification = run_raw_command_via_system_ssh(
        &context,
        &format!("bash -lc 'echo {SSH_CHECK_MARKER}'"),
    )?;

    if verification.exit_status != 0
        || (!verification.stdout.contains(SSH_CHECK_MARKER)
            && !verification.stderr.contains(SSH_CHECK_MARKER))
    {
        return Err(format!(
            "system ssh auth check failed (exit={}). stdout=`{}` stderr=`{}`",
            verification.exit_status,
            truncate_for_log(&verification.stdout),
            truncate_for_log(&verification.stderr)
        ));
    }

    Ok(context)
}

// These trust trade-offs are deliberate for a fleet the operator already
// controls: no prompts, no host-key pinning, forced PTY, quiet banner.
fn build_system_ssh_args(context: &SystemSshContext) -> Vec<String> {
    let mut args = Vec::new();
    args.push("-p".to_string());
    args.push(context.port.to_string());
    args.push("-o".to_string());
    args.push("BatchMode=yes".to_string());
    args.push("-o".to_string());
    args.push(format!("ConnectTimeout={SSH_TIMEOUT_SECONDS}"));
    args.push("-o".to_string());
    args.push("StrictHostKeyChecking=no".to_string());
    args.push("-o".to_string());
    args.push("UserKnownHostsFile=/dev/null".to_string());
    args.push("-o".to_string());
    args.push("LogLevel=ERROR".to_string());
    args.push(format!("{}@{}", context.username, context.host));
    args
}

fn host_key_fingerprint(session: &Session) -> Result<String, String> {
    let (host_key, _host_key_type) = session
        .host_key()
        .ok_or_else(|| "SSH session did not provide host key bytes".to_string())?;
    let digest = Sha256::digest(host_key);
    let encoded = STANDARD_NO_PAD.encode(digest);
    Ok(format!("SHA256:{encoded}"))
}

fn single_quote_escape(value: &str) -> String {
    value.replace('\'', "'\"'\"'")
}

pub fn truncate_for_log(value: &str) -> String {
    const LIMIT: usize = 500;
    if value.len() <= LIMIT {
        value.to_string()
    } else {
        format!("{}...(truncated)", &value[..LIMIT])
    }
}

/// A connected session bound to its privilege facts: issues every command
/// through `bash -lc`, under `sudo -n` when the session user is not root.
pub struct PrivilegedRunner<'a> {
    connection: &'a ConnectedSession,
    is_root: bool,
}

impl<'a> PrivilegedRunner<'a> {
    pub fn new(connection: &'a ConnectedSession, is_root: bool) -> Self {
        Self {
            connection,
            is_root,
        }
    }
}

impl RemoteRunner for PrivilegedRunner<'_> {
    fn run(&self, command: &str) -> Result<CommandResult, String> {
        run_command(self.connection, command, !self.is_root)
    }
}

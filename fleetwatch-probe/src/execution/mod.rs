//! Remote probe execution
//!
//! Handles running probe scripts on target hosts:
//! - One SSH session per invocation, no reuse across cycles
//! - Local script piped to the remote shell (`bash -s -- args`)
//! - Password auth through `sshpass -e`, keys and ssh-agent through `ssh`
//! - Connect and execution timeouts, child killed when abandoned
//! - Typed failure classification from the client exit status

use crate::target::{Auth, CredentialError, ProbeId, Session};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::process::Command as AsyncCommand;
use tracing::debug;

/// Exit status the OpenSSH client uses for its own failures
const SSH_CLIENT_ERROR: i32 = 255;
/// sshpass: wrong password
const SSHPASS_BAD_PASSWORD: i32 = 5;
/// sshpass: host key unknown or changed
const SSHPASS_HOST_KEY: i32 = 6;
/// Longest stderr excerpt kept in an error
const STDERR_EXCERPT: usize = 512;

/// Typed outcome of a failed probe invocation
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProbeError {
    #[error("{host}: connection failed: {reason}")]
    ConnectFailed { host: String, reason: String },
    #[error("{host}: authentication failed: {reason}")]
    AuthFailed { host: String, reason: String },
    #[error("{host}: probe timed out after {after:?}")]
    Timeout { host: String, after: Duration },
    #[error("{host}: probe exited with status {code}: {stderr}")]
    NonZeroExit {
        host: String,
        code: i32,
        stderr: String,
    },
    #[error("{host}: invalid credentials: {source}")]
    CredentialInvalid {
        host: String,
        #[source]
        source: CredentialError,
    },
    #[error("probe script {path:?} unavailable: {reason}")]
    ScriptUnavailable { path: PathBuf, reason: String },
}

impl ProbeError {
    /// Short label for logs and reports
    pub fn kind(&self) -> &'static str {
        match self {
            ProbeError::ConnectFailed { .. } => "connect_failed",
            ProbeError::AuthFailed { .. } => "auth_failed",
            ProbeError::Timeout { .. } => "timeout",
            ProbeError::NonZeroExit { .. } => "non_zero_exit",
            ProbeError::CredentialInvalid { .. } => "credential_invalid",
            ProbeError::ScriptUnavailable { .. } => "script_unavailable",
        }
    }

    /// Only network-level failures are worth another attempt
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ProbeError::ConnectFailed { .. } | ProbeError::Timeout { .. }
        )
    }
}

/// Which script to run on the host and with which arguments
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeInvocation {
    pub probe: ProbeId,
    pub script: PathBuf,
    pub args: Vec<String>,
}

/// Runs one probe on one host, returning raw stdout or one typed failure
#[async_trait]
pub trait ProbeRunner: Send + Sync {
    async fn run_probe(
        &self,
        session: &Session,
        invocation: &ProbeInvocation,
    ) -> Result<String, ProbeError>;
}

/// Client settings shared by every invocation
#[derive(Debug, Clone)]
pub struct SshOptions {
    /// Program plus leading arguments used in place of `ssh`
    pub ssh_command: Vec<String>,
    /// Program plus leading arguments wrapping ssh for password auth
    pub sshpass_command: Vec<String>,
    pub connect_timeout: Duration,
    pub exec_timeout: Duration,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self {
            ssh_command: vec!["ssh".to_string()],
            sshpass_command: vec!["sshpass".to_string(), "-e".to_string()],
            connect_timeout: Duration::from_secs(10),
            exec_timeout: Duration::from_secs(60),
        }
    }
}

/// Probe runner backed by the system OpenSSH client
pub struct SshProbeExecutor {
    options: SshOptions,
}

impl SshProbeExecutor {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }

    fn command(
        &self,
        session: &Session,
        invocation: &ProbeInvocation,
    ) -> Result<AsyncCommand, ProbeError> {
        let mut argv: Vec<String> = Vec::new();
        if let Auth::Password(_) = session.auth {
            argv.extend(self.options.sshpass_command.iter().cloned());
        }
        argv.extend(self.options.ssh_command.iter().cloned());
        argv.extend(ssh_args(session, invocation, self.options.connect_timeout));

        let (program, rest) = argv.split_first().ok_or_else(|| ProbeError::ConnectFailed {
            host: session.host.clone(),
            reason: "no ssh client configured".to_string(),
        })?;
        let mut cmd = AsyncCommand::new(program);
        cmd.args(rest)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Auth::Password(secret) = &session.auth {
            cmd.env("SSHPASS", secret.expose());
        }
        Ok(cmd)
    }
}

#[async_trait]
impl ProbeRunner for SshProbeExecutor {
    async fn run_probe(
        &self,
        session: &Session,
        invocation: &ProbeInvocation,
    ) -> Result<String, ProbeError> {
        let script = tokio::fs::read(&invocation.script)
            .await
            .map_err(|e| ProbeError::ScriptUnavailable {
                path: invocation.script.clone(),
                reason: e.to_string(),
            })?;

        let start_time = Instant::now();
        debug!(host = %session.host, probe = %invocation.probe, "Running probe");

        let mut child = self
            .command(session, invocation)?
            .spawn()
            .map_err(|e| ProbeError::ConnectFailed {
                host: session.host.clone(),
                reason: format!("cannot start ssh client: {}", e),
            })?;
        let stdin = child.stdin.take();
        let host = session.host.clone();

        let feed = async move {
            if let Some(mut stdin) = stdin {
                // the client may exit before reading, e.g. on auth failure
                if let Err(e) = stdin.write_all(&script).await {
                    debug!(host = %host, error = %e, "Probe stdin closed early");
                }
            }
        };
        let run = async move {
            let ((), output) = tokio::join!(feed, child.wait_with_output());
            output
        };

        let output = match tokio::time::timeout(self.options.exec_timeout, run).await {
            Err(_) => {
                return Err(ProbeError::Timeout {
                    host: session.host.clone(),
                    after: self.options.exec_timeout,
                })
            }
            Ok(Err(e)) => {
                return Err(ProbeError::ConnectFailed {
                    host: session.host.clone(),
                    reason: e.to_string(),
                })
            }
            Ok(Ok(output)) => output,
        };

        debug!(
            host = %session.host,
            probe = %invocation.probe,
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            "Probe finished"
        );

        let stderr = String::from_utf8_lossy(&output.stderr);
        check_status(&session.host, output.status, &stderr, is_password(session))?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn is_password(session: &Session) -> bool {
    matches!(session.auth, Auth::Password(_))
}

fn check_status(
    host: &str,
    status: ExitStatus,
    stderr: &str,
    via_sshpass: bool,
) -> Result<(), ProbeError> {
    if status.success() {
        return Ok(());
    }
    // killed by a signal
    let code = status.code().unwrap_or(-1);
    Err(classify_exit(host, code, stderr, via_sshpass))
}

/// Map a failed client exit to a probe error
pub fn classify_exit(host: &str, code: i32, stderr: &str, via_sshpass: bool) -> ProbeError {
    let reason = excerpt(stderr);
    let host = host.to_string();

    if via_sshpass && (code == SSHPASS_BAD_PASSWORD || code == SSHPASS_HOST_KEY) {
        return ProbeError::AuthFailed { host, reason };
    }
    if code == SSH_CLIENT_ERROR {
        if stderr.contains("Permission denied") || stderr.contains("Authentication failed") {
            return ProbeError::AuthFailed { host, reason };
        }
        return ProbeError::ConnectFailed { host, reason };
    }
    ProbeError::NonZeroExit {
        host,
        code,
        stderr: reason,
    }
}

fn excerpt(stderr: &str) -> String {
    let trimmed = stderr.trim();
    match trimmed.char_indices().nth(STDERR_EXCERPT) {
        Some((idx, _)) => format!("{}...", &trimmed[..idx]),
        None => trimmed.to_string(),
    }
}

/// ssh arguments after the program name: options, destination, remote command
pub fn ssh_args(
    session: &Session,
    invocation: &ProbeInvocation,
    connect_timeout: Duration,
) -> Vec<String> {
    let mut args = vec![
        "-o".to_string(),
        format!("ConnectTimeout={}", connect_timeout.as_secs().max(1)),
        "-o".to_string(),
        "StrictHostKeyChecking=accept-new".to_string(),
        "-p".to_string(),
        session.port.to_string(),
    ];
    match &session.auth {
        Auth::Password(_) => {
            args.extend(
                [
                    "-o",
                    "PreferredAuthentications=password,keyboard-interactive",
                    "-o",
                    "PubkeyAuthentication=no",
                ]
                .map(String::from),
            );
        }
        Auth::KeyFile(path) => {
            args.extend(["-o", "BatchMode=yes", "-o", "IdentitiesOnly=yes", "-i"].map(String::from));
            args.push(path.display().to_string());
        }
        Auth::Agent => {
            args.extend(["-o", "BatchMode=yes"].map(String::from));
        }
    }
    args.push(session.destination());
    args.extend(["bash", "-s", "--"].map(String::from));
    args.extend(invocation.args.iter().cloned());
    args
}

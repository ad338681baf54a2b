//! Remote execution over SSH, plus the child-process plumbing shared with
//! local fallback execution.
//!
//! The outer command is always spawned from an argument vector, never through
//! a local shell. Only the remote side re-tokenizes its input, so forwarded
//! arguments are quoted for a POSIX shell when they need it.

use std::borrow::Cow;
use std::os::unix::fs::DirBuilderExt;
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::unistd::{access, AccessFlags};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::{RelayError, Result};
use crate::ledger::Host;
use crate::selector::HostProbe;

/// How long a child gets to exit after SIGTERM before it is killed.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Characters that make the remote shell split or expand an argument.
const SHELL_UNSAFE: &[char] = &[
    '\'', '"', '(', ')', '[', ']', '{', '}', '|', '*', '?', '$', ';', '&', '<', '>', '`', '\\',
    '!', '#', '~',
];

/// Quote an argument for the remote shell if it contains anything the shell
/// would interpret; safe arguments are returned unchanged.
pub fn quote_arg(arg: &str) -> Cow<'_, str> {
    if arg.is_empty() {
        return Cow::Borrowed("''");
    }
    let unsafe_arg = arg
        .chars()
        .any(|c| c.is_whitespace() || SHELL_UNSAFE.contains(&c));
    if !unsafe_arg {
        return Cow::Borrowed(arg);
    }
    // Single quotes suppress every expansion; an embedded single quote closes
    // the quoted run, emits an escaped quote and reopens.
    Cow::Owned(format!("'{}'", arg.replace('\'', r"'\''")))
}

/// A program and its argument vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<PathBuf>, args: &[String]) -> Self {
        Self {
            program: program.into(),
            args: args.to_vec(),
        }
    }

    fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).kill_on_drop(true);
        cmd
    }
}

impl std::fmt::Display for CommandLine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Stdio wiring for a job's child process.
#[derive(Debug)]
pub struct JobStdio {
    pub stdin: Stdio,
    pub stdout: Stdio,
    pub stderr: Stdio,
}

impl JobStdio {
    pub fn inherit() -> Self {
        Self {
            stdin: Stdio::inherit(),
            stdout: Stdio::inherit(),
            stderr: Stdio::inherit(),
        }
    }

    pub fn null() -> Self {
        Self {
            stdin: Stdio::null(),
            stdout: Stdio::null(),
            stderr: Stdio::null(),
        }
    }
}

/// How a child run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Exited(ExitStatus),
    /// The cancellation token fired; the child was terminated and reaped.
    Cancelled,
}

/// Exit code a shell would report for this status: the code itself, or
/// `128 + signal` when the child was killed by a signal.
pub fn exit_code(status: ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => 1,
    }
}

/// Spawn `cmd` and block until it exits or `cancel` fires.
///
/// No deadline is applied; a transcode may legitimately run for hours.
pub async fn execute(
    cmd: &CommandLine,
    stdio: JobStdio,
    cancel: &CancellationToken,
) -> Result<Completion> {
    let mut child = cmd
        .to_command()
        .stdin(stdio.stdin)
        .stdout(stdio.stdout)
        .stderr(stdio.stderr)
        .spawn()
        .map_err(|source| RelayError::Spawn {
            program: cmd.program.display().to_string(),
            source,
        })?;

    tracing::debug!(pid = ?child.id(), command = %cmd, "Child spawned");

    let finished = tokio::select! {
        status = child.wait() => Some(status),
        _ = cancel.cancelled() => None,
    };

    match finished {
        Some(status) => Ok(Completion::Exited(status?)),
        None => {
            terminate(&mut child, TERMINATE_GRACE).await;
            Ok(Completion::Cancelled)
        }
    }
}

/// SIGTERM the child, give it `grace` to exit, then SIGKILL and reap.
async fn terminate(child: &mut Child, grace: Duration) {
    use nix::sys::signal::{self, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        return;
    };

    if let Err(e) = signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
        if e != nix::errno::Errno::ESRCH {
            tracing::warn!(pid, error = ?e, "SIGTERM to child failed");
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => {}
        Err(_) => {
            tracing::warn!(pid, "Child ignored SIGTERM, killing");
            if let Err(e) = child.kill().await {
                tracing::warn!(pid, error = %e, "Failed to kill child");
            }
        }
    }
}

/// Builds SSH command lines with fast-fail connection options and
/// connection multiplexing.
#[derive(Debug, Clone)]
pub struct SshTransport {
    ssh: PathBuf,
    user: String,
    persist_secs: u64,
    persist_dir: PathBuf,
    extra_args: Vec<String>,
    pre: Vec<String>,
}

impl SshTransport {
    pub fn from_config(config: &Config) -> Self {
        Self {
            ssh: config.commands.ssh.clone(),
            user: config.remote.user.clone(),
            persist_secs: config.remote.persist,
            persist_dir: config.directories.persist.clone(),
            extra_args: config.remote.args.clone(),
            pre: config.commands.pre.clone(),
        }
    }

    /// Create the control socket directory if needed and check that it is
    /// writable. ssh exits 255 when it cannot bind the control socket, so an
    /// unusable directory disables multiplexing for this dispatcher.
    pub fn ensure_persist_dir(mut self) -> Self {
        if self.persist_secs == 0 {
            return self;
        }

        let usable = std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.persist_dir)
            .map_err(RelayError::from)
            .and_then(|()| {
                access(&self.persist_dir, AccessFlags::W_OK | AccessFlags::X_OK)?;
                Ok(())
            });

        if let Err(e) = usable {
            tracing::warn!(
                dir = %self.persist_dir.display(),
                error = %e,
                "Control socket directory unusable, disabling SSH multiplexing"
            );
            self.persist_secs = 0;
        }
        self
    }

    pub fn multiplexed(&self) -> bool {
        self.persist_secs > 0
    }

    fn destination(&self, address: &str) -> String {
        if self.user.is_empty() {
            address.to_string()
        } else {
            format!("{}@{}", self.user, address)
        }
    }

    fn ssh_args(&self, address: &str) -> Vec<String> {
        let mut args: Vec<String> = [
            "-q",
            "-o",
            "ConnectTimeout=1",
            "-o",
            "ConnectionAttempts=1",
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        // One control socket per user+host+port, reused by concurrent jobs
        if self.multiplexed() {
            args.push("-o".to_string());
            args.push("ControlMaster=auto".to_string());
            args.push("-o".to_string());
            args.push(format!(
                "ControlPath={}/ssh-%r@%h:%p",
                self.persist_dir.display()
            ));
            args.push("-o".to_string());
            args.push(format!("ControlPersist={}", self.persist_secs));
        }

        args.extend(self.extra_args.iter().cloned());
        args.push(self.destination(address));
        args
    }

    /// Full command line running `binary args...` on `address`.
    pub fn build_command(&self, address: &str, binary: &str, args: &[String]) -> CommandLine {
        let mut argv = self.ssh_args(address);
        argv.extend(self.pre.iter().filter(|p| !p.is_empty()).cloned());
        argv.push(binary.to_string());
        argv.extend(args.iter().map(|a| quote_arg(a).into_owned()));
        CommandLine {
            program: self.ssh.clone(),
            args: argv,
        }
    }
}

/// Liveness probe: run `<binary> -version` on the host over SSH.
#[derive(Debug, Clone)]
pub struct SshProbe<'a> {
    transport: &'a SshTransport,
    binary: &'a str,
}

impl<'a> SshProbe<'a> {
    pub fn new(transport: &'a SshTransport, binary: &'a str) -> Self {
        Self { transport, binary }
    }
}

impl HostProbe for SshProbe<'_> {
    async fn probe(&self, host: &Host) -> bool {
        let cmd = self
            .transport
            .build_command(&host.address, self.binary, &["-version".to_string()]);
        let mut command = cmd.to_command();
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        match command.status().await {
            Ok(status) if status.success() => true,
            Ok(status) => {
                tracing::warn!(
                    host_id = %host.id,
                    address = %host.address,
                    exit_code = exit_code(status),
                    "Host probe failed"
                );
                false
            }
            Err(e) => {
                tracing::warn!(
                    host_id = %host.id,
                    address = %host.address,
                    error = %e,
                    "Host probe could not run"
                );
                false
            }
        }
    }
}

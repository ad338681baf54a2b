//! Job runner: one dispatcher process, one job.
//!
//! # Execution Flow
//!
//! 1. [`HostSelector`] picks a remote host, or none
//! 2. A [`Registration`] records the job in the ledger (and marks a remote
//!    host `active`)
//! 3. The job runs over SSH or as the local fallback binary, with stdio
//!    relayed and no deadline
//! 4. The registration is released and the child's exit code returned
//!
//! A shutdown signal during step 3 terminates the child; cleanup and exit
//! then proceed exactly as on normal completion.

pub mod mode;

use tracing::Instrument;

use crate::config::Config;
use crate::error::Result;
use crate::ledger::{HostState, Ledger, Target};
use crate::selector::HostSelector;
use crate::shutdown::ShutdownGuard;
use crate::transport::{self, CommandLine, Completion, JobStdio, SshProbe, SshTransport};

pub use mode::{InvocationMode, OutputStream};

/// Exit code for failures inside the dispatcher itself.
pub const INTERNAL_FAILURE: i32 = 1;

/// Everything a dispatcher invocation needs, built once at startup.
#[derive(Debug)]
pub struct Context {
    pub config: Config,
    pub ledger: Ledger,
    pub mode: InvocationMode,
    /// Identifies this job's ledger rows; the dispatcher's own pid in production.
    pub pid: u32,
    pub shutdown: ShutdownGuard,
}

impl Context {
    /// Open the configured ledger. Fails if it has not been initialized.
    pub fn new(config: Config, mode: InvocationMode, shutdown: ShutdownGuard) -> Result<Self> {
        let ledger = Ledger::open_with_timeout(
            config.ledger_path(),
            std::time::Duration::from_millis(config.ledger.busy_timeout_ms),
        )?;
        Ok(Self {
            config,
            ledger,
            mode,
            pid: std::process::id(),
            shutdown,
        })
    }

    pub fn with_pid(mut self, pid: u32) -> Self {
        self.pid = pid;
        self
    }
}

/// A job's ledger bookkeeping, released exactly once.
///
/// Dropping an unreleased registration releases it, so an early return or a
/// panic unwinding through the runner still clears the row.
#[derive(Debug)]
pub struct Registration<'a> {
    ledger: &'a Ledger,
    pid: u32,
    released: bool,
}

impl<'a> Registration<'a> {
    /// Record the job. Ledger failures are logged, not returned: a lost
    /// bookkeeping row must not stop the job from running.
    pub fn acquire(ledger: &'a Ledger, target: Target, pid: u32, command: &str) -> Self {
        if let Err(e) = ledger.register_process(target, pid, command) {
            tracing::error!(pid, host = %target, error = %e, "Failed to register process");
        }
        if let Target::Host(host_id) = target {
            if let Err(e) = ledger.record_state(host_id, pid, HostState::Active) {
                tracing::error!(
                    pid,
                    host_id = %host_id,
                    error = %e,
                    "Failed to record active state"
                );
            }
        }
        Self {
            ledger,
            pid,
            released: false,
        }
    }

    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match self.ledger.clear_process(self.pid) {
            Ok(removed) => tracing::debug!(pid = self.pid, removed, "Process cleared"),
            Err(e) => tracing::error!(pid = self.pid, error = %e, "Failed to clear process"),
        }
    }
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

pub struct JobRunner<'a> {
    ctx: &'a Context,
    transport: SshTransport,
}

impl<'a> JobRunner<'a> {
    pub fn new(ctx: &'a Context) -> Self {
        Self {
            transport: SshTransport::from_config(&ctx.config).ensure_persist_dir(),
            ctx,
        }
    }

    /// Run one job to completion and return the exit code to report.
    pub async fn run(&self, args: &[String]) -> i32 {
        let span = tracing::info_span!(
            "job",
            pid = self.ctx.pid,
            mode = self.ctx.mode.binary_name()
        );
        self.run_inner(args).instrument(span).await
    }

    async fn run_inner(&self, args: &[String]) -> i32 {
        let ctx = self.ctx;
        let commands = &ctx.config.commands;

        let probe = SshProbe::new(&self.transport, &commands.ffmpeg);
        let selector = HostSelector::new(&ctx.ledger, &probe, ctx.pid);
        let host = match selector.select_target().await {
            Ok(host) => host,
            Err(e) => {
                tracing::error!(error = %e, "Host selection failed, running locally");
                None
            }
        };

        let (target, command) = match host {
            Some(host) if !host.is_local() => {
                let command = self.transport.build_command(
                    &host.address,
                    ctx.mode.remote_binary(commands),
                    args,
                );
                (Target::Host(host.id), command)
            }
            _ => (
                Target::Local,
                CommandLine::new(ctx.mode.local_binary(commands), args),
            ),
        };

        let summary = format!("{} {}", ctx.mode.binary_name(), args.join(" "));
        tracing::info!(host = %target, command = %command, "Dispatching job");

        let mut registration = Registration::acquire(&ctx.ledger, target, ctx.pid, &summary);
        let code = self.execute(&command, args).await;
        registration.release();

        tracing::info!(host = %target, exit_code = code, "Job finished");
        code
    }

    async fn execute(&self, command: &CommandLine, args: &[String]) -> i32 {
        let ctx = self.ctx;
        if ctx.shutdown.is_triggered() {
            return ctx.shutdown.exit_code();
        }

        let stream = ctx.mode.output_stream(args, &ctx.config.special_flags);
        let stdio = match stream.child_stdout() {
            Ok(stdout) => JobStdio {
                stdout,
                ..JobStdio::inherit()
            },
            Err(e) => {
                tracing::error!(error = %e, "Failed to set up child stdio");
                return INTERNAL_FAILURE;
            }
        };

        match transport::execute(command, stdio, ctx.shutdown.token()).await {
            Ok(Completion::Exited(status)) => transport::exit_code(status),
            Ok(Completion::Cancelled) => {
                tracing::warn!(signal = ?ctx.shutdown.signal(), "Job interrupted");
                ctx.shutdown.exit_code()
            }
            Err(e) => {
                tracing::error!(error = %e, "Job execution failed");
                INTERNAL_FAILURE
            }
        }
    }
}

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use nix::sys::signal::Signal;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Cancellation handle shared between the signal listener and the job runner.
///
/// The first signal received wins: it is recorded, the token is cancelled and
/// the runner terminates its child, clears its ledger rows and exits with
/// `128 + signal`.
#[derive(Debug, Clone, Default)]
pub struct ShutdownGuard {
    token: CancellationToken,
    signal: Arc<AtomicI32>,
}

impl ShutdownGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_triggered(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Record `signal` (if none was recorded yet) and cancel.
    pub fn trigger(&self, signal: Signal) {
        let _ = self
            .signal
            .compare_exchange(0, signal as i32, Ordering::SeqCst, Ordering::SeqCst);
        self.token.cancel();
    }

    pub fn signal(&self) -> Option<Signal> {
        match self.signal.load(Ordering::SeqCst) {
            0 => None,
            raw => Signal::try_from(raw).ok(),
        }
    }

    /// Exit code to report after a shutdown: `128 + signal`, or 1 if the
    /// token was cancelled without a signal.
    pub fn exit_code(&self) -> i32 {
        self.signal().map_or(1, |s| 128 + s as i32)
    }
}

/// Install a shutdown handler that listens for SIGTERM, SIGINT, SIGQUIT and
/// SIGHUP.
///
/// Must be called from within a tokio runtime. Once installed, these signals
/// no longer terminate the process directly; the job runner observes the
/// guard and performs cleanup before exiting.
pub fn install_shutdown_handler() -> std::io::Result<ShutdownGuard> {
    let guard = ShutdownGuard::new();
    let listener = guard.clone();

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigquit = signal(SignalKind::quit())?;
    let mut sighup = signal(SignalKind::hangup())?;

    tokio::spawn(async move {
        let received = tokio::select! {
            _ = sigterm.recv() => Signal::SIGTERM,
            _ = sigint.recv() => Signal::SIGINT,
            _ = sigquit.recv() => Signal::SIGQUIT,
            _ = sighup.recv() => Signal::SIGHUP,
        };

        tracing::info!(signal = ?received, "Received signal, cleaning up");
        listener.trigger(received);
    });

    Ok(guard)
}

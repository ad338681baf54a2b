//! Test harness for dispatcher integration tests.
//!
//! Provides a throwaway ledger plus shell-script stand-ins for `ssh` and the
//! local fallback binaries, so whole jobs can run without a real host pool.

#![allow(dead_code)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tempfile::TempDir;
use transcode_relay::config::Config;
use transcode_relay::ledger::Ledger;
use transcode_relay::runner::{Context, InvocationMode};
use transcode_relay::shutdown::ShutdownGuard;

/// Isolated dispatcher environment rooted in a temp directory.
pub struct TestEnv {
    pub dir: TempDir,
    pub config: Config,
}

impl TestEnv {
    /// Fresh, initialized ledger and a config pointing at it. `ssh` and the
    /// fallback binaries default to scripts that fail loudly if invoked.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp dir");
        let ledger_path = dir.path().join("relay.db");
        Ledger::initialize(&ledger_path).expect("Failed to initialize ledger");

        let mut config = Config::default().with_ledger_path(&ledger_path);
        config.logging.log_to_file = false;
        config.directories.state = dir.path().to_path_buf();
        config.directories.persist = dir.path().join("persist");
        config.remote.user = "media".to_string();
        config.remote.persist = 0;
        config.commands.ffmpeg = "/opt/ffmpeg/bin/ffmpeg".to_string();
        config.commands.ffprobe = "/opt/ffmpeg/bin/ffprobe".to_string();

        let mut env = Self { dir, config };
        let unexpected = "echo unexpected >&2\nexit 99\n";
        env.config.commands.ssh = env.script("ssh", unexpected);
        env.config.commands.fallback_ffmpeg = Some(env.script("ffmpeg", unexpected));
        env.config.commands.fallback_ffprobe = Some(env.script("ffprobe", unexpected));
        env
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    /// Write an executable `/bin/sh` script. `$DIR` inside `body` expands to
    /// the environment's temp directory.
    pub fn script(&self, name: &str, body: &str) -> PathBuf {
        let path = self.path(name);
        let content = format!(
            "#!/bin/sh\nDIR='{}'\n{}",
            self.dir.path().display(),
            body
        );
        std::fs::write(&path, content).expect("Failed to write script");
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
            .expect("Failed to chmod script");
        path
    }

    pub fn set_ssh(&mut self, body: &str) {
        self.config.commands.ssh = self.script("ssh", body);
    }

    pub fn set_fallback_ffmpeg(&mut self, body: &str) {
        self.config.commands.fallback_ffmpeg = Some(self.script("ffmpeg", body));
    }

    pub fn set_fallback_ffprobe(&mut self, body: &str) {
        self.config.commands.fallback_ffprobe = Some(self.script("ffprobe", body));
    }

    /// Separate connection to the ledger, as another process would have.
    pub fn ledger(&self) -> Ledger {
        Ledger::open(self.config.ledger_path()).expect("Failed to open ledger")
    }

    pub fn context(&self, mode: InvocationMode, pid: u32) -> Context {
        self.context_with_guard(mode, pid, ShutdownGuard::new())
    }

    pub fn context_with_guard(
        &self,
        mode: InvocationMode,
        pid: u32,
        guard: ShutdownGuard,
    ) -> Context {
        Context::new(self.config.clone(), mode, guard)
            .expect("Failed to build context")
            .with_pid(pid)
    }

    pub fn read_lines(&self, name: &str) -> Vec<String> {
        read_lines(&self.path(name))
    }
}

pub fn read_lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(|s| s.to_string())
        .collect()
}

pub fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

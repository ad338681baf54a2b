use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{RelayError, Result};

/// Environment variable that overrides the configuration file location.
pub const CONFIG_ENV_VAR: &str = "TRANSCODE_RELAY_CONFIG";

/// Configuration file used when [`CONFIG_ENV_VAR`] is not set.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/transcode-relay/relay.yml";

/// Logging destination for dispatcher invocations.
///
/// Dispatch mode never writes log lines to stdout or stderr, since both
/// streams belong to the wrapped binary and are parsed by the media server.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Write log lines to `logfile`. When false, dispatch mode is silent.
    pub log_to_file: bool,
    pub logfile: PathBuf,
    /// Raise the default filter from `info` to `debug`.
    pub debug: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_to_file: true,
            logfile: PathBuf::from("/var/log/transcode-relay/relay.log"),
            debug: false,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DirectoryConfig {
    /// Holds the ledger when `ledger.path` is not set.
    pub state: PathBuf,
    /// Holds the SSH control sockets used for connection multiplexing.
    /// Created on demand by each dispatcher, so it may live on a tmpfs.
    pub persist: PathBuf,
    /// User (name or uid) that `init` hands the state and persist
    /// directories to; the media server's user. Empty leaves them as created.
    pub owner: String,
    /// Group (name or gid) for the same directories.
    pub group: String,
}

impl Default for DirectoryConfig {
    fn default() -> Self {
        Self {
            state: PathBuf::from("/var/lib/transcode-relay"),
            persist: PathBuf::from("/tmp/transcode-relay"),
            owner: "jellyfin".to_string(),
            group: "jellyfin".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Ledger database file. Defaults to `<directories.state>/relay.db`.
    pub path: Option<PathBuf>,
    /// How long a writer waits for another process's lock before failing.
    pub busy_timeout_ms: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            path: None,
            busy_timeout_ms: 5000,
        }
    }
}

/// Remote login settings passed to the SSH client.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Login user; empty means the SSH client's own default.
    pub user: String,
    /// Seconds a multiplexed control connection stays open after the last
    /// job ends. Zero disables multiplexing.
    pub persist: u64,
    /// Extra SSH arguments, e.g. `["-i", "/var/lib/jellyfin/.ssh/id_rsa"]`.
    pub args: Vec<String>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            user: "jellyfin".to_string(),
            persist: 300,
            args: Vec::new(),
        }
    }
}

/// Binary paths on the remote side and for local fallback.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    pub ssh: PathBuf,
    /// Commands run on the remote host before the binary, e.g. `["nice", "-n", "5"]`.
    pub pre: Vec<String>,
    pub ffmpeg: String,
    pub ffprobe: String,
    pub fallback_ffmpeg: Option<PathBuf>,
    pub fallback_ffprobe: Option<PathBuf>,
}

impl Default for CommandConfig {
    fn default() -> Self {
        Self {
            ssh: PathBuf::from("/usr/bin/ssh"),
            pre: Vec::new(),
            ffmpeg: "/usr/lib/jellyfin-ffmpeg/ffmpeg".to_string(),
            ffprobe: "/usr/lib/jellyfin-ffmpeg/ffprobe".to_string(),
            fallback_ffmpeg: None,
            fallback_ffprobe: None,
        }
    }
}

impl CommandConfig {
    /// Local fallback binary for transcodes; the remote path when unset.
    pub fn local_ffmpeg(&self) -> PathBuf {
        self.fallback_ffmpeg
            .clone()
            .unwrap_or_else(|| PathBuf::from(&self.ffmpeg))
    }

    pub fn local_ffprobe(&self) -> PathBuf {
        self.fallback_ffprobe
            .clone()
            .unwrap_or_else(|| PathBuf::from(&self.ffprobe))
    }
}

fn default_special_flags() -> Vec<String> {
    [
        "-version",
        "-encoders",
        "-decoders",
        "-hwaccels",
        "-filters",
        "-h",
        "-muxers",
        "-fp_format",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub directories: DirectoryConfig,
    pub ledger: LedgerConfig,
    pub remote: RemoteConfig,
    pub commands: CommandConfig,
    /// Arguments that send the transcoder's stdout to our stdout instead of stderr.
    pub special_flags: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            logging: LoggingConfig::default(),
            directories: DirectoryConfig::default(),
            ledger: LedgerConfig::default(),
            remote: RemoteConfig::default(),
            commands: CommandConfig::default(),
            special_flags: default_special_flags(),
        }
    }
}

impl Config {
    /// Load from `$TRANSCODE_RELAY_CONFIG`, or the default path.
    pub fn load() -> Result<Self> {
        let path = std::env::var(CONFIG_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::from_file(&path)
    }

    /// Load a YAML configuration file. A missing file yields the defaults;
    /// a malformed one is an error.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        Self::from_yaml(&content).map_err(|e| match e {
            RelayError::Config { source, .. } => RelayError::Config {
                path: path.to_path_buf(),
                source,
            },
            other => other,
        })
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        // An empty document deserializes as unit, not as an empty mapping.
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Config = serde_yaml::from_str(content).map_err(|source| RelayError::Config {
            path: PathBuf::from("<inline>"),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.commands.ffmpeg.is_empty() || self.commands.ffprobe.is_empty() {
            return Err(RelayError::InvalidConfig(
                "commands.ffmpeg and commands.ffprobe must not be empty".to_string(),
            ));
        }
        if self.commands.ssh.as_os_str().is_empty() {
            return Err(RelayError::InvalidConfig(
                "commands.ssh must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.ledger
            .path
            .clone()
            .unwrap_or_else(|| self.directories.state.join("relay.db"))
    }

    pub fn with_ledger_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.ledger.path = Some(path.into());
        self
    }
}

use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RelayError {
    #[error("Configuration error in {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Ledger not found at {0}; run `transcode-relay init` first")]
    LedgerUnavailable(PathBuf),

    #[error("Ledger error: {0}")]
    Ledger(#[from] rusqlite::Error),

    #[error("Host not found: {0}")]
    HostNotFound(String),

    #[error("Invalid host weight {0}, must be at least 1")]
    InvalidWeight(i64),

    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("System error: {0}")]
    Os(#[from] nix::errno::Errno),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Aborted: {0}")]
    Aborted(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;

//! Error types for devrack.
//!
//! Every failure the lifecycle operations can surface is a variant of
//! [`DevError`]. Stale state is not an error: dead records are reconciled
//! silently and reported through lifecycle events instead.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DevError {
    /// `.dev/servers.json` does not exist yet.
    #[error("{} not found (run `devrack init` to create it)", path.display())]
    ConfigMissing { path: PathBuf },

    /// The server config exists but is not valid JSON of the expected shape.
    #[error("failed to parse {}: {source}", path.display())]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// `init` refuses to overwrite an existing config.
    #[error("{} already exists; remove it first to reinitialize", path.display())]
    ConfigExists { path: PathBuf },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("no servers configured in .dev/servers.json")]
    NoServersConfigured,

    #[error("server '{0}' not found in .dev/servers.json")]
    UnknownServer(String),

    /// Every port in the scan window already has a listener.
    #[error("no free port found in {start}..{end}")]
    NoFreePort { start: u16, end: u32 },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("{name} (pid {pid}) exited during startup; check its log file")]
    ExitedDuringStartup { name: String, pid: u32 },

    #[error("{name} failed health check at {url}")]
    HealthCheckFailed { name: String, url: String },

    /// The state snapshot exists but cannot be parsed.
    #[error("state file {} is corrupt: {source}", path.display())]
    CorruptState {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid port announcement pattern: {0}")]
    InvalidPattern(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, DevError>;

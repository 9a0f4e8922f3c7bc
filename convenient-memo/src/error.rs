//! Error types for memoized command execution

use std::path::PathBuf;
use std::process::ExitStatus;
use thiserror::Error;

/// Errors raised while deciding, running, or recording a command
#[derive(Debug, Error)]
pub enum MemoError {
    /// A file could not be fingerprinted (permission denied, vanished, not a file)
    #[error("cannot fingerprint {}: {source}", path.display())]
    Access {
        /// Path that could not be read
        path: PathBuf,
        /// Underlying OS error
        source: std::io::Error,
    },

    /// The external process could not be started
    #[error("failed to launch `{command}`: {source}")]
    Launch {
        /// Command identity, rendered for humans
        command: String,
        /// Underlying OS error
        source: std::io::Error,
    },

    /// The launched process could not be waited on
    #[error("lost track of `{command}`: {source}")]
    Wait {
        /// Command identity, rendered for humans
        command: String,
        /// Underlying OS error
        source: std::io::Error,
    },

    /// The external process exited unsuccessfully
    #[error("`{command}` failed with {status}")]
    Execution {
        /// Command identity, rendered for humans
        command: String,
        /// Exit status reported by the OS
        status: ExitStatus,
    },

    /// The persisted dependency store could not be parsed
    #[error("dependency store {} is unreadable: {reason}", path.display())]
    StoreCorruption {
        /// Store file
        path: PathBuf,
        /// Parser or schema complaint
        reason: String,
    },

    /// The persisted dependency store could not be read or replaced
    #[error("dependency store {}: {source}", path.display())]
    Store {
        /// Store file
        path: PathBuf,
        /// Underlying OS error
        source: std::io::Error,
    },

    /// File-access tracing failed
    #[error("trace error: {0}")]
    Trace(String),

    /// The configuration cannot be honoured on this host
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Other I/O failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MemoError {
    /// Build an [`MemoError::Access`] for `path`
    pub fn access(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Access {
            path: path.into(),
            source,
        }
    }

    /// Whether this error means the path does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Access { source, .. } if source.kind() == std::io::ErrorKind::NotFound)
    }
}

/// Result alias used throughout the crate
pub type MemoResult<T> = Result<T, MemoError>;

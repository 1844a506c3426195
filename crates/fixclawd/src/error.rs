//! Error types for the orchestrator core.
//!
//! Everything that is expected during recovery (non-zero exits, timeouts,
//! a busy lock, rate limiting) is an outcome, not an error. What remains here
//! is fatal to the current invocation.

use fixclaw_common::{ConfigError, StoreError};
use std::path::PathBuf;
use thiserror::Error;

/// Evidence could not be persisted
#[derive(Error, Debug)]
pub enum EvidenceError {
    #[error("failed to create {path}: {source}")]
    Create {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write evidence {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no free attempt directory name for {0}")]
    NamesExhausted(PathBuf),
}

impl EvidenceError {
    pub fn write(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Write {
            path: path.into(),
            source,
        }
    }
}

/// Errors that abort an orchestrator invocation
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("evidence write failed: {0}")]
    Evidence(#[from] EvidenceError),

    #[error("lock record {path} is corrupted ({reason}); inspect and remove it manually")]
    LockCorrupted { path: PathBuf, reason: String },

    #[error("state error: {0}")]
    State(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

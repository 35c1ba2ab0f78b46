//! Upload queue error types.

use std::path::PathBuf;

use thiserror::Error;

pub type UploadResult<T> = Result<T, UploadError>;

#[derive(Debug, Error)]
pub enum UploadError {
    /// Persisted queue state exists but cannot be parsed. Startup must halt
    /// rather than silently reset state.
    #[error("Corrupted queue state at {path}: {source}")]
    CorruptState {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Artifact not found: {0}")]
    ArtifactMissing(PathBuf),

    #[error("Upload entry not found: {0}")]
    EntryNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failure signal from the external publish platform.
#[derive(Debug, Clone, Error)]
pub enum PublishError {
    /// Network trouble, 5xx, provider-side throttling. Retried with backoff.
    #[error("Transient publish failure: {0}")]
    Transient(String),

    /// Invalid credential, rejected content. Never retried.
    #[error("Permanent publish failure: {0}")]
    Permanent(String),
}

impl PublishError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, PublishError::Transient(_))
    }
}

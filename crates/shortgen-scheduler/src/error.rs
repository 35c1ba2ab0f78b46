//! Scheduler error types.

use std::path::PathBuf;

use thiserror::Error;

use shortgen_ledger::LedgerError;
use shortgen_uploader::UploadError;

pub type SchedulerResult<T> = Result<T, SchedulerError>;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("Upload hand-off failed: {0}")]
    Upload(#[from] UploadError),

    /// Persisted job state exists but cannot be parsed. Startup must halt
    /// rather than silently reset state.
    #[error("Corrupted job state at {path}: {source}")]
    CorruptState {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SchedulerError {
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, SchedulerError::Ledger(e) if e.is_quota_exceeded())
    }
}

/// Failure signal from the external rendering engine.
#[derive(Debug, Clone, Error)]
pub enum RenderError {
    /// The render could not produce an artifact. Maps to a failed job with a
    /// quota refund; never retried automatically.
    #[error("Render failed: {0}")]
    Failed(String),

    /// The render observed the cancellation flag and stopped early.
    #[error("Render cancelled")]
    Cancelled,
}

impl RenderError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }
}

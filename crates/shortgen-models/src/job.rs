//! Generation job definitions and lifecycle.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::upload::UploadMetadata;

/// Unique identifier for a generation job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the inner string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job lifecycle state.
///
/// Transitions are monotonic: `Pending -> Processing -> {Completed, Failed,
/// Cancelled}`, with cancellation also allowed straight from `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Job is waiting for a worker
    #[default]
    Pending,
    /// Job is being rendered
    Processing,
    /// Job completed successfully
    Completed,
    /// Job failed (render error or interrupted)
    Failed,
    /// Job was cancelled by the user
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    /// Check if this is a terminal state (no more updates expected).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Request to republish the finished artifact to the external platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishRequest {
    /// Credential/channel key the upload runs under
    pub account_key: String,
    /// Metadata for the published video
    pub metadata: UploadMetadata,
}

/// Input for one generation request.
///
/// The rendering engine itself is an external collaborator; these fields are
/// opaque to the scheduler and passed through to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationInput {
    /// Text to narrate and caption
    pub text: String,
    /// Primary source video
    pub source_video: PathBuf,
    /// Optional second source for split-screen mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub second_source: Option<PathBuf>,
    /// Voice code for speech synthesis
    #[serde(default = "default_voice")]
    pub voice: String,
    /// Mix background music under the narration
    #[serde(default)]
    pub background_music: bool,
    /// Republish the artifact once rendering completes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub publish: Option<PublishRequest>,
}

fn default_voice() -> String {
    "en_us_002".to_string()
}

impl GenerationInput {
    /// Create an input with default rendering options.
    pub fn new(text: impl Into<String>, source_video: impl Into<PathBuf>) -> Self {
        Self {
            text: text.into(),
            source_video: source_video.into(),
            second_source: None,
            voice: default_voice(),
            background_music: false,
            publish: None,
        }
    }

    /// Enable split-screen mode with a second source video.
    pub fn with_second_source(mut self, path: impl Into<PathBuf>) -> Self {
        self.second_source = Some(path.into());
        self
    }

    /// Attach a publish request for auto-publishing on completion.
    pub fn with_publish(mut self, publish: PublishRequest) -> Self {
        self.publish = Some(publish);
        self
    }
}

/// One user-submitted generation request tracked through its lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique job ID
    pub id: JobId,

    /// User who submitted the job
    pub user_id: String,

    /// Current lifecycle state
    #[serde(default)]
    pub status: JobStatus,

    /// Free-form progress label ("synthesizing speech", "compositing", ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,

    /// Progress in [0.0, 1.0], non-decreasing while processing
    #[serde(default)]
    pub progress: f32,

    /// Generation request payload
    pub input: GenerationInput,

    /// Path to the finished artifact, set only when completed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,

    /// Error message, set only when failed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,

    /// Cancellation was requested; observed by the worker at stage boundaries
    #[serde(default)]
    pub cancel_requested: bool,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last update timestamp
    pub updated_at: DateTime<Utc>,

    /// Started at timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// Completed at timestamp
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Create a new pending job.
    pub fn new(user_id: impl Into<String>, input: GenerationInput) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            user_id: user_id.into(),
            status: JobStatus::Pending,
            stage: None,
            progress: 0.0,
            input,
            output_path: None,
            error_message: None,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Check if the job is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Start processing the job.
    pub fn start(&mut self) {
        self.status = JobStatus::Processing;
        self.started_at = Some(Utc::now());
        self.updated_at = Utc::now();
    }

    /// Update stage label and progress. Progress never moves backwards.
    pub fn set_progress(&mut self, stage: impl Into<String>, progress: f32) {
        self.stage = Some(stage.into());
        self.progress = self.progress.max(progress.clamp(0.0, 1.0));
        self.updated_at = Utc::now();
    }

    /// Mark job as completed with its output artifact.
    pub fn complete(&mut self, output_path: impl Into<PathBuf>) {
        self.status = JobStatus::Completed;
        self.output_path = Some(output_path.into());
        self.progress = 1.0;
        self.stage = Some("complete".into());
        self.completed_at = Some(Utc::now());
        self.updated_at = Utc::now();
    }

    /// Mark job as failed with an error message.
    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error_message = Some(error.into());
        self.completed_at = Some(Utc::now());
        self.updated_at = Utc::now();
    }

    /// Mark job as cancelled.
    pub fn cancel(&mut self) {
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(Utc::now());
        self.updated_at = Utc::now();
    }

    /// Request cancellation. Idempotent; the worker observes the flag at the
    /// next stage boundary.
    pub fn request_cancel(&mut self) {
        self.cancel_requested = true;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_creation() {
        let job = Job::new("user123", GenerationInput::new("hello", "/tmp/src.mp4"));

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.progress, 0.0);
        assert!(!job.cancel_requested);
        assert!(job.output_path.is_none());
    }

    #[test]
    fn test_job_state_transitions() {
        let mut job = Job::new("user123", GenerationInput::new("hello", "/tmp/src.mp4"));

        job.start();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.started_at.is_some());

        job.complete("/tmp/out.mp4");
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 1.0);
        assert!(job.is_terminal());
    }

    #[test]
    fn test_progress_never_decreases() {
        let mut job = Job::new("user123", GenerationInput::new("hello", "/tmp/src.mp4"));
        job.start();

        job.set_progress("speech", 0.4);
        assert_eq!(job.progress, 0.4);

        job.set_progress("captions", 0.2);
        assert_eq!(job.progress, 0.4);
        assert_eq!(job.stage.as_deref(), Some("captions"));

        job.set_progress("compositing", 2.0);
        assert_eq!(job.progress, 1.0);
    }

    #[test]
    fn test_terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Processing.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Processing).unwrap(),
            "\"processing\""
        );

        let job = Job::new("user123", GenerationInput::new("hello", "/tmp/src.mp4"));
        let json = serde_json::to_string(&job).unwrap();
        assert!(json.contains("\"pending\""));
        // Unset optionals stay off the wire.
        assert!(!json.contains("output_path"));
    }

    #[test]
    fn test_cancel_request_is_idempotent() {
        let mut job = Job::new("user123", GenerationInput::new("hello", "/tmp/src.mp4"));
        job.request_cancel();
        job.request_cancel();
        assert!(job.cancel_requested);
        assert_eq!(job.status, JobStatus::Pending);
    }
}

//! Upload queue entries, history records, and rate windows.

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an upload queue entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UploadEntryId(pub String);

impl UploadEntryId {
    /// Generate a new random entry ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for UploadEntryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UploadEntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Visibility of the published video.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Privacy {
    #[default]
    Public,
    Private,
    Unlisted,
}

impl Privacy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Privacy::Public => "public",
            Privacy::Private => "private",
            Privacy::Unlisted => "unlisted",
        }
    }
}

/// Metadata for a video awaiting publication.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadMetadata {
    pub title: String,
    pub description: String,
    pub tags: Vec<String>,
    /// Platform category id
    #[serde(default = "default_category")]
    pub category_id: String,
    #[serde(default)]
    pub privacy: Privacy,
    /// Earliest time the entry becomes eligible for upload
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduled_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_path: Option<PathBuf>,
}

fn default_category() -> String {
    // Entertainment
    "24".to_string()
}

impl UploadMetadata {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            tags: Vec::new(),
            category_id: default_category(),
            privacy: Privacy::default(),
            scheduled_time: None,
            thumbnail_path: None,
        }
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_scheduled_time(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_time = Some(at);
        self
    }
}

/// Build default metadata for a finished artifact.
///
/// Mirrors what the generator produces when the user does not provide their
/// own title/description: a dated title from the file stem and generic tags.
pub fn default_metadata_for_file(artifact_path: &Path) -> UploadMetadata {
    let date = Utc::now().format("%Y-%m-%d");
    let stem = artifact_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "short".to_string());

    UploadMetadata::new(
        format!("{} {}", stem, date),
        format!("{} - generated short", date),
    )
    .with_tags(vec![
        "shorts".to_string(),
        "generated".to_string(),
        "automated".to_string(),
    ])
}

/// Delivery state of an upload queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum UploadStatus {
    /// Waiting for rate-window headroom and eligibility
    #[default]
    Queued,
    /// An upload attempt is in flight
    Uploading,
    /// Delivered and confirmed by the platform
    Uploaded,
    /// Retries exhausted or rejected outright; never retried automatically
    FailedPermanently,
}

impl UploadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadStatus::Queued => "queued",
            UploadStatus::Uploading => "uploading",
            UploadStatus::Uploaded => "uploaded",
            UploadStatus::FailedPermanently => "failed_permanently",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, UploadStatus::Uploaded | UploadStatus::FailedPermanently)
    }
}

/// One finished artifact awaiting delivery to the external platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadEntry {
    pub id: UploadEntryId,
    /// Credential/channel key this entry uploads under
    pub account_key: String,
    pub artifact_path: PathBuf,
    pub metadata: UploadMetadata,
    /// Attempts made so far; bumped when an attempt starts
    #[serde(default)]
    pub attempts: u32,
    /// Attempts allowed before the entry fails permanently
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub status: UploadStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Backoff deadline after a transient failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_attempt_at: Option<DateTime<Utc>>,
}

fn default_max_attempts() -> u32 {
    3
}

impl UploadEntry {
    /// Create a new queued entry.
    pub fn new(
        account_key: impl Into<String>,
        artifact_path: impl Into<PathBuf>,
        metadata: UploadMetadata,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: UploadEntryId::new(),
            account_key: account_key.into(),
            artifact_path: artifact_path.into(),
            metadata,
            attempts: 0,
            max_attempts: default_max_attempts(),
            status: UploadStatus::Queued,
            created_at: now,
            updated_at: now,
            last_error: None,
            next_attempt_at: None,
        }
    }

    /// Check whether the entry may be attempted at `now` (queued, past its
    /// scheduled time, and past any backoff deadline).
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        if self.status != UploadStatus::Queued {
            return false;
        }
        if let Some(at) = self.metadata.scheduled_time {
            if now < at {
                return false;
            }
        }
        if let Some(at) = self.next_attempt_at {
            if now < at {
                return false;
            }
        }
        true
    }

    /// The earliest future instant this queued entry could become eligible.
    pub fn eligible_at(&self) -> Option<DateTime<Utc>> {
        if self.status != UploadStatus::Queued {
            return None;
        }
        match (self.metadata.scheduled_time, self.next_attempt_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    /// Start an upload attempt.
    pub fn begin_attempt(&mut self) {
        self.status = UploadStatus::Uploading;
        self.attempts += 1;
        self.next_attempt_at = None;
        self.updated_at = Utc::now();
    }

    /// Record a confirmed upload.
    pub fn mark_uploaded(&mut self) {
        self.status = UploadStatus::Uploaded;
        self.last_error = None;
        self.updated_at = Utc::now();
    }

    /// Return the entry to the queue after a transient failure.
    pub fn retry_later(&mut self, error: impl Into<String>, next_attempt_at: DateTime<Utc>) {
        self.status = UploadStatus::Queued;
        self.last_error = Some(error.into());
        self.next_attempt_at = Some(next_attempt_at);
        self.updated_at = Utc::now();
    }

    /// Mark the entry permanently failed. Its artifact is kept on disk.
    pub fn fail_permanently(&mut self, error: impl Into<String>) {
        self.status = UploadStatus::FailedPermanently;
        self.last_error = Some(error.into());
        self.updated_at = Utc::now();
    }

    /// Check whether another retry is allowed after a transient failure.
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }

    /// Reset an entry found mid-attempt after a crash. The outcome of the
    /// interrupted attempt is unknown, so it re-enters the queue with its
    /// attempt count unchanged (at-least-once delivery).
    pub fn recover_interrupted(&mut self) {
        self.status = UploadStatus::Queued;
        self.attempts = self.attempts.saturating_sub(1);
        self.updated_at = Utc::now();
    }
}

/// History record of a delivered (or permanently failed) entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadRecord {
    pub entry_id: UploadEntryId,
    pub account_key: String,
    pub title: String,
    pub artifact_path: PathBuf,
    /// Remote video id, present when the upload succeeded
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_id: Option<String>,
    pub status: UploadStatus,
    pub recorded_at: DateTime<Utc>,
}

impl UploadRecord {
    /// Build a history record from a terminal entry.
    pub fn from_entry(entry: &UploadEntry, remote_id: Option<String>) -> Self {
        Self {
            entry_id: entry.id.clone(),
            account_key: entry.account_key.clone(),
            title: entry.metadata.title.clone(),
            artifact_path: entry.artifact_path.clone(),
            remote_id,
            status: entry.status,
            recorded_at: Utc::now(),
        }
    }
}

/// Fixed 24-hour upload bucket for one account key.
///
/// Not a sliding window: `count` resets when the bucket lapses and
/// `window_start` advances by whole window durations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateWindow {
    pub window_start: DateTime<Utc>,
    pub count: u32,
    pub limit: u32,
    /// Bucket duration in seconds (24h by default)
    #[serde(default = "default_window_secs")]
    pub window_secs: i64,
}

fn default_window_secs() -> i64 {
    24 * 60 * 60
}

impl RateWindow {
    /// Create a fresh window starting now.
    pub fn new(limit: u32) -> Self {
        Self {
            window_start: Utc::now(),
            count: 0,
            limit,
            window_secs: default_window_secs(),
        }
    }

    /// When the current bucket resets.
    pub fn resets_at(&self) -> DateTime<Utc> {
        self.window_start + Duration::seconds(self.window_secs)
    }

    /// Advance past lapsed buckets and reset the count. Safe to call on every
    /// access, like the ledger's lazy daily rollover.
    pub fn rollover_if_due(&mut self, now: DateTime<Utc>) {
        if now < self.resets_at() {
            return;
        }
        self.count = 0;
        while self.resets_at() <= now {
            self.window_start += Duration::seconds(self.window_secs);
        }
    }

    /// Uploads still allowed in the current bucket.
    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.count)
    }

    /// Whether another upload fits in the current bucket.
    pub fn has_headroom(&self) -> bool {
        self.count < self.limit
    }

    /// Count one confirmed upload against the bucket.
    pub fn record_upload(&mut self) {
        self.count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_attempt_counting() {
        let mut entry = UploadEntry::new("acct", "/tmp/a.mp4", UploadMetadata::new("t", "d"));
        assert_eq!(entry.attempts, 0);
        assert!(entry.is_eligible(Utc::now()));

        entry.begin_attempt();
        assert_eq!(entry.status, UploadStatus::Uploading);
        assert_eq!(entry.attempts, 1);

        entry.retry_later("timeout", Utc::now() + Duration::seconds(30));
        assert_eq!(entry.status, UploadStatus::Queued);
        assert!(!entry.is_eligible(Utc::now()));
        assert!(entry.can_retry());

        entry.begin_attempt();
        entry.begin_attempt();
        assert_eq!(entry.attempts, 3);
        assert!(!entry.can_retry());
    }

    #[test]
    fn test_entry_scheduled_time_gates_eligibility() {
        let meta = UploadMetadata::new("t", "d").with_scheduled_time(Utc::now() + Duration::hours(1));
        let entry = UploadEntry::new("acct", "/tmp/a.mp4", meta);

        assert!(!entry.is_eligible(Utc::now()));
        assert!(entry.is_eligible(Utc::now() + Duration::hours(2)));
    }

    #[test]
    fn test_recover_interrupted_keeps_attempt_budget() {
        let mut entry = UploadEntry::new("acct", "/tmp/a.mp4", UploadMetadata::new("t", "d"));
        entry.begin_attempt();

        // Crash between attempt start and result: the attempt is not charged.
        entry.recover_interrupted();
        assert_eq!(entry.status, UploadStatus::Queued);
        assert_eq!(entry.attempts, 0);
    }

    #[test]
    fn test_rate_window_bucket_reset() {
        let mut window = RateWindow::new(10);
        for _ in 0..10 {
            window.record_upload();
        }
        assert!(!window.has_headroom());

        // Still inside the bucket: no reset.
        window.rollover_if_due(Utc::now());
        assert!(!window.has_headroom());

        // Bucket lapsed: count resets, start advances past now.
        window.window_start = Utc::now() - Duration::hours(25);
        window.rollover_if_due(Utc::now());
        assert_eq!(window.count, 0);
        assert!(window.resets_at() > Utc::now());
    }

    #[test]
    fn test_default_metadata_from_filename() {
        let meta = default_metadata_for_file(Path::new("/tmp/outputs/clip_042.mp4"));
        assert!(meta.title.starts_with("clip_042"));
        assert!(!meta.tags.is_empty());
        assert_eq!(meta.privacy, Privacy::Public);
    }
}

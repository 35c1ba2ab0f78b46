//! Upload queue configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Upload queue configuration.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Directory holding the queue snapshot and credential tokens
    pub data_dir: PathBuf,
    /// Uploads allowed per account per 24h bucket
    pub daily_limit: u32,
    /// Attempts before an entry fails permanently
    pub max_attempts: u32,
    /// How long the delivery loop sleeps when nothing is eligible
    pub poll_interval: Duration,
    /// Base delay for exponential retry backoff (doubles each attempt)
    pub backoff_base: Duration,
    /// Maximum retry backoff delay
    pub backoff_max: Duration,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/uploads"),
            daily_limit: 10,
            max_attempts: 3,
            poll_interval: Duration::from_secs(60),
            backoff_base: Duration::from_secs(30),
            backoff_max: Duration::from_secs(3600),
        }
    }
}

impl UploadConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("UPLOADER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            daily_limit: std::env::var("UPLOADER_DAILY_LIMIT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.daily_limit),
            max_attempts: std::env::var("UPLOADER_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_attempts),
            poll_interval: Duration::from_secs(
                std::env::var("UPLOADER_POLL_INTERVAL_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(60),
            ),
            backoff_base: Duration::from_secs(
                std::env::var("UPLOADER_BACKOFF_BASE_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(30),
            ),
            backoff_max: Duration::from_secs(
                std::env::var("UPLOADER_BACKOFF_MAX_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(3600),
            ),
        }
    }

    /// Retry delay before the given attempt number (1-based), doubling each
    /// time and capped at `backoff_max`.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.backoff_base.saturating_mul(2u32.pow(exp));
        delay.min(self.backoff_max)
    }
}

//! Scheduler configuration.

use std::path::PathBuf;

/// Scheduler configuration.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Directory holding the persisted job table
    pub data_dir: PathBuf,
    /// Maximum jobs rendered in parallel
    pub max_concurrent_jobs: usize,
    /// Hand completed artifacts with a publish request to the upload queue
    pub auto_publish: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data/jobs"),
            max_concurrent_jobs: 2,
            auto_publish: true,
        }
    }
}

impl SchedulerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("SCHEDULER_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            max_concurrent_jobs: std::env::var("SCHEDULER_MAX_CONCURRENT_JOBS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_concurrent_jobs),
            auto_publish: std::env::var("SCHEDULER_AUTO_PUBLISH")
                .map(|s| s.to_lowercase() == "true")
                .unwrap_or(defaults.auto_publish),
        }
    }
}

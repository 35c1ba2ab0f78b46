//! Shared data models for the shortgen backend.
//!
//! This crate provides Serde-serializable types for:
//! - Generation jobs and their lifecycle
//! - Quota accounts and reward tickets
//! - Upload queue entries, history records, and rate windows

pub mod job;
pub mod quota;
pub mod upload;

// Re-export common types
pub use job::{GenerationInput, Job, JobId, JobStatus, PublishRequest};
pub use quota::{QuotaAccount, QuotaUsage, RewardTicket};
pub use upload::{
    default_metadata_for_file, Privacy, RateWindow, UploadEntry, UploadEntryId, UploadMetadata,
    UploadRecord, UploadStatus,
};

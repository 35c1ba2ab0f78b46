//! Durable, rate-limited delivery of finished artifacts to the external
//! video platform.
//!
//! The queue survives restarts: every transition is persisted to a JSON
//! snapshot before it takes effect, and entries caught mid-attempt by a
//! crash are requeued on startup. A single background loop drains the
//! queue oldest-first, honoring per-account daily rate windows, scheduled
//! publish times, and exponential retry backoff.

pub mod config;
pub mod error;
pub mod publisher;
pub mod queue;
pub mod state;

pub use config::UploadConfig;
pub use error::{PublishError, UploadError, UploadResult};
pub use publisher::{Publisher, TokenStore};
pub use queue::{QueueStatus, UploadQueue};
pub use state::{QueueState, StateStore};

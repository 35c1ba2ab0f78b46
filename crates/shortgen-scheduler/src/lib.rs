//! Per-user generation job scheduling.
//!
//! Accepts generation requests, enforces daily quotas through the ledger,
//! renders them on a bounded worker pool via the external [`Renderer`], and
//! hands finished artifacts to the upload queue when a publish request is
//! attached. Jobs persist across restarts; anything left mid-render by a
//! crash is reconciled to `failed` and its quota reservation refunded.

pub mod config;
pub mod error;
pub mod renderer;
pub mod scheduler;
pub mod store;

pub use config::SchedulerConfig;
pub use error::{RenderError, SchedulerError, SchedulerResult};
pub use renderer::{RenderHandle, Renderer};
pub use scheduler::Scheduler;
pub use store::JobStore;

//! External rendering engine boundary.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use shortgen_models::{GenerationInput, JobId};

use crate::error::RenderError;
use crate::store::JobStore;

/// External collaborator that turns a generation request into a finished
/// artifact (speech synthesis, captioning, compositing).
///
/// Implementations report progress through the [`RenderHandle`] and must stop
/// promptly when a progress report signals cancellation. A renderer that
/// exceeds its own deadline returns `Failed`, never hangs.
#[async_trait]
pub trait Renderer: Send + Sync {
    /// Render one job. Returns the path of the finished artifact.
    async fn render(
        &self,
        input: &GenerationInput,
        handle: &RenderHandle,
    ) -> Result<PathBuf, RenderError>;
}

/// Progress and cancellation channel handed to the renderer for one job.
///
/// Single-writer: only the worker owning the job holds a handle.
#[derive(Clone)]
pub struct RenderHandle {
    store: Arc<JobStore>,
    job_id: JobId,
}

impl RenderHandle {
    pub(crate) fn new(store: Arc<JobStore>, job_id: JobId) -> Self {
        Self { store, job_id }
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    /// Record a stage boundary. Returns `false` when cancellation has been
    /// requested; the renderer must then abort and return
    /// [`RenderError::Cancelled`].
    pub fn report(&self, stage: &str, progress: f32) -> bool {
        let mut cancel_requested = false;
        let _ = self.store.update(&self.job_id, |job| {
            job.set_progress(stage, progress);
            cancel_requested = job.cancel_requested;
        });
        !cancel_requested
    }

    /// Check the cancellation flag without recording progress.
    pub fn is_cancelled(&self) -> bool {
        self.store
            .get(&self.job_id)
            .map(|job| job.cancel_requested)
            .unwrap_or(true)
    }
}

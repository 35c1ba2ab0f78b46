//! Job scheduler and worker pool.
//!
//! Submission reserves quota in the ledger before a job exists, so a rejected
//! submission has no side effects. Dispatch is FIFO across all users through
//! an unbounded channel; a semaphore bounds how many renders run in parallel
//! and each job is owned by exactly one worker task for its full lifetime.

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Semaphore};
use tracing::{error, info, warn};

use shortgen_ledger::QuotaLedger;
use shortgen_models::{GenerationInput, Job, JobId, JobStatus};
use shortgen_uploader::UploadQueue;

use crate::config::SchedulerConfig;
use crate::error::{RenderError, SchedulerError, SchedulerResult};
use crate::renderer::{RenderHandle, Renderer};
use crate::store::JobStore;

/// Accepts generation requests and drives them through the worker pool.
pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<JobStore>,
    ledger: Arc<QuotaLedger>,
    uploader: Option<Arc<UploadQueue>>,
    renderer: Arc<dyn Renderer>,
    job_semaphore: Arc<Semaphore>,
    queue_tx: mpsc::UnboundedSender<JobId>,
    queue_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<JobId>>>,
    shutdown: watch::Sender<bool>,
}

impl Scheduler {
    /// Create a scheduler, loading the persisted job table and reconciling
    /// jobs a previous process left in flight: they become `failed` with
    /// error `"interrupted"` and their quota reservations are refunded.
    pub fn new(
        config: SchedulerConfig,
        renderer: Arc<dyn Renderer>,
        ledger: Arc<QuotaLedger>,
        uploader: Option<Arc<UploadQueue>>,
    ) -> SchedulerResult<Self> {
        let store = Arc::new(JobStore::load(config.data_dir.join("jobs.json"))?);

        let interrupted = store.reconcile_interrupted()?;
        for job in &interrupted {
            warn!(
                job_id = %job.id,
                user_id = %job.user_id,
                "Reconciled interrupted job, refunding quota"
            );
            ledger.refund(&job.user_id);
        }

        let job_semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);

        Ok(Self {
            config,
            store,
            ledger,
            uploader,
            renderer,
            job_semaphore,
            queue_tx,
            queue_rx: std::sync::Mutex::new(Some(queue_rx)),
            shutdown,
        })
    }

    /// Submit one generation request.
    ///
    /// Reserves a quota unit first; the job is only created once the
    /// reservation succeeded.
    pub fn submit(&self, user_id: &str, input: GenerationInput) -> SchedulerResult<JobId> {
        self.ledger.reserve(user_id)?;

        let job = Job::new(user_id, input);
        let job_id = job.id.clone();
        if let Err(e) = self.store.insert(job) {
            self.ledger.refund(user_id);
            return Err(e);
        }

        let _ = self.queue_tx.send(job_id.clone());
        info!(job_id = %job_id, user_id = %user_id, "Job submitted");
        Ok(job_id)
    }

    /// Submit one job per text against shared source media.
    ///
    /// Stops at the first `QuotaExceeded`: jobs created up to that point
    /// stay submitted. Errors only when no job could be created at all.
    pub fn submit_batch(
        &self,
        user_id: &str,
        texts: &[String],
        template: &GenerationInput,
    ) -> SchedulerResult<Vec<JobId>> {
        let mut job_ids = Vec::with_capacity(texts.len());

        for text in texts {
            let mut input = template.clone();
            input.text = text.clone();
            match self.submit(user_id, input) {
                Ok(job_id) => job_ids.push(job_id),
                Err(e) if e.is_quota_exceeded() => {
                    if job_ids.is_empty() {
                        return Err(e);
                    }
                    warn!(
                        user_id = %user_id,
                        submitted = job_ids.len(),
                        requested = texts.len(),
                        "Batch submission truncated by quota"
                    );
                    break;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(job_ids)
    }

    /// Fetch a job by id.
    pub fn status(&self, job_id: &JobId) -> SchedulerResult<Job> {
        self.store
            .get(job_id)
            .ok_or_else(|| SchedulerError::JobNotFound(job_id.to_string()))
    }

    /// All jobs for a user, newest first.
    pub fn list(&self, user_id: &str) -> Vec<Job> {
        self.store.list(user_id)
    }

    /// Request cancellation of a job. Idempotent.
    ///
    /// A pending job is cancelled immediately; a processing job observes the
    /// flag at its next stage boundary.
    pub fn cancel(&self, job_id: &JobId) -> SchedulerResult<()> {
        let updated = self.store.update(job_id, |job| {
            if job.is_terminal() {
                return;
            }
            job.request_cancel();
            if job.status == JobStatus::Pending {
                job.cancel();
            }
        })?;

        if !updated {
            return Err(SchedulerError::JobNotFound(job_id.to_string()));
        }
        info!(job_id = %job_id, "Cancellation requested");
        Ok(())
    }

    /// Request cancellation of every active job of a user. Returns how many
    /// jobs were flagged.
    pub fn cancel_all(&self, user_id: &str) -> SchedulerResult<usize> {
        let active = self.store.active_ids(user_id);
        let count = active.len();
        for job_id in active {
            self.cancel(&job_id)?;
        }
        info!(user_id = %user_id, count, "Cancelled all active jobs");
        Ok(count)
    }

    /// Sweep a user's terminal jobs from the table.
    pub fn clear_finished(&self, user_id: &str) -> SchedulerResult<usize> {
        self.store.clear_finished(user_id)
    }

    /// Run the dispatch loop until shutdown is signalled.
    pub async fn run(&self) {
        let receiver = self
            .queue_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut queue_rx) = receiver else {
            warn!("Scheduler dispatch loop already running");
            return;
        };

        info!(
            max_concurrent_jobs = self.config.max_concurrent_jobs,
            "Starting job scheduler"
        );
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Shutdown signal received, stopping scheduler");
                        break;
                    }
                }
                maybe_id = queue_rx.recv() => {
                    let Some(job_id) = maybe_id else { break; };

                    let permit = match Arc::clone(&self.job_semaphore).acquire_owned().await {
                        Ok(permit) => permit,
                        Err(_) => break,
                    };

                    let store = Arc::clone(&self.store);
                    let ledger = Arc::clone(&self.ledger);
                    let uploader = self.uploader.clone();
                    let renderer = Arc::clone(&self.renderer);
                    let auto_publish = self.config.auto_publish;

                    tokio::spawn(async move {
                        let _permit = permit;
                        Self::execute_job(store, ledger, uploader, renderer, auto_publish, job_id)
                            .await;
                    });
                }
            }
        }

        info!("Waiting for in-flight jobs to complete...");
        let _ = tokio::time::timeout(Duration::from_secs(60), self.wait_for_jobs()).await;
        info!("Job scheduler stopped");
    }

    /// Signal shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(true);
    }

    async fn wait_for_jobs(&self) {
        loop {
            if self.job_semaphore.available_permits() == self.config.max_concurrent_jobs {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    /// Execute one job start to finish on the owning worker task.
    async fn execute_job(
        store: Arc<JobStore>,
        ledger: Arc<QuotaLedger>,
        uploader: Option<Arc<UploadQueue>>,
        renderer: Arc<dyn Renderer>,
        auto_publish: bool,
        job_id: JobId,
    ) {
        let Some(job) = store.get(&job_id) else {
            warn!(job_id = %job_id, "Dispatched job no longer exists");
            return;
        };

        // Pickup boundary: a job cancelled (or otherwise terminal) before a
        // worker claimed it is skipped.
        let mut skipped = false;
        let started = store.update(&job_id, |j| {
            if j.is_terminal() {
                skipped = true;
            } else if j.cancel_requested {
                j.cancel();
                skipped = true;
            } else {
                j.start();
            }
        });
        if let Err(e) = started {
            error!(job_id = %job_id, "Failed to persist job start: {}", e);
            return;
        }
        if skipped {
            info!(job_id = %job_id, "Skipping job already terminal at pickup");
            return;
        }

        info!(job_id = %job_id, user_id = %job.user_id, "Executing job");
        let handle = RenderHandle::new(Arc::clone(&store), job_id.clone());

        match renderer.render(&job.input, &handle).await {
            Ok(artifact_path) => {
                if let Err(e) = store.update(&job_id, |j| j.complete(&artifact_path)) {
                    error!(job_id = %job_id, "Failed to persist job completion: {}", e);
                    return;
                }
                info!(job_id = %job_id, output = %artifact_path.display(), "Job completed");

                if auto_publish {
                    if let (Some(uploader), Some(publish)) = (uploader, &job.input.publish) {
                        match uploader
                            .enqueue(&publish.account_key, &artifact_path, publish.metadata.clone())
                            .await
                        {
                            Ok(entry_id) => {
                                info!(
                                    job_id = %job_id,
                                    entry_id = %entry_id,
                                    account = %publish.account_key,
                                    "Artifact handed to upload queue"
                                );
                            }
                            Err(e) => {
                                // The job stays completed; the artifact is on
                                // disk and can be enqueued again manually.
                                warn!(job_id = %job_id, "Upload hand-off failed: {}", e);
                            }
                        }
                    }
                }
            }
            Err(RenderError::Cancelled) => {
                // User-initiated abort: capacity was consumed intentionally,
                // so the reservation is not refunded.
                if let Err(e) = store.update(&job_id, |j| j.cancel()) {
                    error!(job_id = %job_id, "Failed to persist job cancellation: {}", e);
                }
                info!(job_id = %job_id, "Job cancelled");
            }
            Err(RenderError::Failed(msg)) => {
                if let Err(e) = store.update(&job_id, |j| j.fail(&msg)) {
                    error!(job_id = %job_id, "Failed to persist job failure: {}", e);
                }
                ledger.refund(&job.user_id);
                error!(job_id = %job_id, user_id = %job.user_id, "Job failed: {}", msg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::{Path, PathBuf};

    use async_trait::async_trait;
    use tempfile::TempDir;

    use shortgen_models::{PublishRequest, UploadMetadata};
    use shortgen_uploader::{PublishError, Publisher, UploadConfig};

    enum Mode {
        Succeed,
        Fail,
        Slow,
    }

    struct MockRenderer {
        mode: Mode,
        out_dir: PathBuf,
    }

    #[async_trait]
    impl Renderer for MockRenderer {
        async fn render(
            &self,
            _input: &GenerationInput,
            handle: &RenderHandle,
        ) -> Result<PathBuf, RenderError> {
            match self.mode {
                Mode::Succeed => {
                    for (stage, progress) in [
                        ("synthesizing speech", 0.3),
                        ("rendering captions", 0.6),
                        ("compositing", 0.9),
                    ] {
                        if !handle.report(stage, progress) {
                            return Err(RenderError::Cancelled);
                        }
                    }
                    let path = self.out_dir.join(format!("{}.mp4", handle.job_id()));
                    std::fs::write(&path, b"artifact")
                        .map_err(|e| RenderError::failed(e.to_string()))?;
                    Ok(path)
                }
                Mode::Fail => Err(RenderError::failed("voice synthesis unavailable")),
                Mode::Slow => {
                    for _ in 0..1000 {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        if !handle.report("compositing", 0.5) {
                            return Err(RenderError::Cancelled);
                        }
                    }
                    Err(RenderError::failed("never cancelled"))
                }
            }
        }
    }

    struct NoopPublisher;

    #[async_trait]
    impl Publisher for NoopPublisher {
        async fn authenticate(&self, _account_key: &str) -> Result<String, PublishError> {
            Ok("token".to_string())
        }

        async fn publish(
            &self,
            _credential: &str,
            _artifact: &Path,
            _metadata: &UploadMetadata,
        ) -> Result<String, PublishError> {
            Ok("remote-1".to_string())
        }
    }

    struct Harness {
        scheduler: Arc<Scheduler>,
        ledger: Arc<QuotaLedger>,
        uploader: Option<Arc<UploadQueue>>,
        _dir: TempDir,
    }

    fn harness(mode: Mode, quota: u32, uploader: bool) -> Harness {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(QuotaLedger::new(quota));
        let renderer = Arc::new(MockRenderer {
            mode,
            out_dir: dir.path().to_path_buf(),
        });
        let uploader = if uploader {
            let config = UploadConfig {
                data_dir: dir.path().join("uploads"),
                ..Default::default()
            };
            Some(Arc::new(
                UploadQueue::new(config, Arc::new(NoopPublisher)).unwrap(),
            ))
        } else {
            None
        };
        let config = SchedulerConfig {
            data_dir: dir.path().join("jobs"),
            max_concurrent_jobs: 2,
            auto_publish: true,
        };
        let scheduler = Arc::new(
            Scheduler::new(config, renderer, Arc::clone(&ledger), uploader.clone()).unwrap(),
        );

        Harness {
            scheduler,
            ledger,
            uploader,
            _dir: dir,
        }
    }

    fn spawn_run(scheduler: &Arc<Scheduler>) {
        let scheduler = Arc::clone(scheduler);
        tokio::spawn(async move { scheduler.run().await });
    }

    async fn wait_until<F>(scheduler: &Scheduler, job_id: &JobId, predicate: F) -> Job
    where
        F: Fn(&Job) -> bool,
    {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let job = scheduler.status(job_id).unwrap();
            if predicate(&job) {
                return job;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for job {} ({:?})", job_id, job.status);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn wait_terminal(scheduler: &Scheduler, job_id: &JobId) -> Job {
        wait_until(scheduler, job_id, |j| j.is_terminal()).await
    }

    fn input() -> GenerationInput {
        GenerationInput::new("hello world", "/tmp/source.mp4")
    }

    #[tokio::test]
    async fn test_submit_renders_to_completion() {
        let h = harness(Mode::Succeed, 5, false);
        spawn_run(&h.scheduler);

        let job_id = h.scheduler.submit("user1", input()).unwrap();
        let job = wait_terminal(&h.scheduler, &job_id).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.progress, 1.0);
        let output = job.output_path.unwrap();
        assert!(output.exists());
        assert_eq!(h.ledger.usage("user1").daily_used, 1);
    }

    #[tokio::test]
    async fn test_sixth_submit_needs_a_ticket() {
        let h = harness(Mode::Succeed, 5, false);

        for _ in 0..5 {
            h.scheduler.submit("user1", input()).unwrap();
        }
        let err = h.scheduler.submit("user1", input()).unwrap_err();
        assert!(err.is_quota_exceeded());

        let ticket_id = h.ledger.issue_ticket("user1");
        h.ledger.redeem(&ticket_id, "user1").unwrap();

        h.scheduler.submit("user1", input()).unwrap();
        assert_eq!(h.scheduler.list("user1").len(), 6);
    }

    #[tokio::test]
    async fn test_render_failure_refunds_quota() {
        let h = harness(Mode::Fail, 5, false);
        spawn_run(&h.scheduler);

        let job_id = h.scheduler.submit("user1", input()).unwrap();
        let job = wait_terminal(&h.scheduler, &job_id).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(
            job.error_message.as_deref(),
            Some("voice synthesis unavailable")
        );
        assert_eq!(h.ledger.usage("user1").daily_used, 0);
    }

    #[tokio::test]
    async fn test_cancel_mid_render_is_cooperative() {
        let h = harness(Mode::Slow, 5, false);
        spawn_run(&h.scheduler);

        let job_id = h.scheduler.submit("user1", input()).unwrap();
        wait_until(&h.scheduler, &job_id, |j| j.status == JobStatus::Processing).await;

        h.scheduler.cancel(&job_id).unwrap();
        let job = wait_terminal(&h.scheduler, &job_id).await;

        assert_eq!(job.status, JobStatus::Cancelled);
        // User-initiated abort keeps the reservation.
        assert_eq!(h.ledger.usage("user1").daily_used, 1);
    }

    #[tokio::test]
    async fn test_cancel_pending_job_is_immediate_and_idempotent() {
        let h = harness(Mode::Succeed, 5, false);

        let job_id = h.scheduler.submit("user1", input()).unwrap();
        h.scheduler.cancel(&job_id).unwrap();
        assert_eq!(
            h.scheduler.status(&job_id).unwrap().status,
            JobStatus::Cancelled
        );

        // Cancelling again is a no-op, not an error.
        h.scheduler.cancel(&job_id).unwrap();

        let missing = JobId::from_string("no-such-job");
        assert!(matches!(
            h.scheduler.cancel(&missing),
            Err(SchedulerError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_all_flags_every_active_job() {
        let h = harness(Mode::Succeed, 5, false);

        for _ in 0..3 {
            h.scheduler.submit("user1", input()).unwrap();
        }
        assert_eq!(h.scheduler.cancel_all("user1").unwrap(), 3);

        for job in h.scheduler.list("user1") {
            assert_eq!(job.status, JobStatus::Cancelled);
        }
    }

    #[tokio::test]
    async fn test_restart_reconciles_interrupted_job() {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Arc::new(QuotaLedger::new(5));
        let data_dir = dir.path().join("jobs");

        // A previous process reserved quota and left a job mid-render.
        ledger.reserve("user1").unwrap();
        let store = JobStore::load(data_dir.join("jobs.json")).unwrap();
        let mut job = Job::new("user1", input());
        job.start();
        let job_id = job.id.clone();
        store.insert(job).unwrap();
        drop(store);

        let config = SchedulerConfig {
            data_dir,
            max_concurrent_jobs: 2,
            auto_publish: false,
        };
        let renderer = Arc::new(MockRenderer {
            mode: Mode::Succeed,
            out_dir: dir.path().to_path_buf(),
        });
        let scheduler = Scheduler::new(config, renderer, Arc::clone(&ledger), None).unwrap();

        let job = scheduler.status(&job_id).unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("interrupted"));
        assert_eq!(ledger.usage("user1").daily_used, 0);
    }

    #[tokio::test]
    async fn test_completed_job_hands_artifact_to_upload_queue() {
        let h = harness(Mode::Succeed, 5, true);
        spawn_run(&h.scheduler);

        let publish = PublishRequest {
            account_key: "channel-a".to_string(),
            metadata: UploadMetadata::new("my short", "generated"),
        };
        let job_id = h
            .scheduler
            .submit("user1", input().with_publish(publish))
            .unwrap();
        let job = wait_terminal(&h.scheduler, &job_id).await;
        assert_eq!(job.status, JobStatus::Completed);

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let status = h.uploader.as_ref().unwrap().status("channel-a").await;
            if status.queued_count == 1 {
                break;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("artifact never enqueued");
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_submit_batch_truncates_at_quota() {
        let h = harness(Mode::Succeed, 3, false);

        let texts: Vec<String> = (0..5).map(|i| format!("text {}", i)).collect();
        let job_ids = h
            .scheduler
            .submit_batch("user1", &texts, &input())
            .unwrap();
        assert_eq!(job_ids.len(), 3);

        let err = h
            .scheduler
            .submit_batch("user1", &texts, &input())
            .unwrap_err();
        assert!(err.is_quota_exceeded());
    }

    #[tokio::test]
    async fn test_clear_finished_sweeps_terminal_jobs() {
        let h = harness(Mode::Succeed, 5, false);
        spawn_run(&h.scheduler);

        let job_id = h.scheduler.submit("user1", input()).unwrap();
        wait_terminal(&h.scheduler, &job_id).await;

        assert_eq!(h.scheduler.clear_finished("user1").unwrap(), 1);
        assert!(h.scheduler.list("user1").is_empty());
        assert!(matches!(
            h.scheduler.status(&job_id),
            Err(SchedulerError::JobNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_newest_first() {
        let h = harness(Mode::Succeed, 5, false);

        let first = h.scheduler.submit("user1", input()).unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = h.scheduler.submit("user1", input()).unwrap();

        let listed = h.scheduler.list("user1");
        assert_eq!(listed[0].id, second);
        assert_eq!(listed[1].id, first);
    }
}

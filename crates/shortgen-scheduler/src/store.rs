//! Persistent job table.
//!
//! Jobs are held in memory behind a mutex and snapshotted to a JSON file on
//! every mutation, so a restart can reconcile work that was in flight.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::info;

use shortgen_models::{Job, JobId, JobStatus};

use crate::error::{SchedulerError, SchedulerResult};

/// In-memory job table with an on-disk snapshot.
#[derive(Debug)]
pub struct JobStore {
    path: PathBuf,
    jobs: Mutex<HashMap<String, Job>>,
}

impl JobStore {
    /// Load the persisted job table. A missing snapshot yields an empty
    /// table; an unreadable one is fatal and must halt startup.
    pub fn load(path: impl Into<PathBuf>) -> SchedulerResult<Self> {
        let path = path.into();
        let jobs = match std::fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str::<HashMap<String, Job>>(&raw) {
                Ok(jobs) => {
                    info!(jobs = jobs.len(), "Loaded job table");
                    jobs
                }
                Err(source) => {
                    return Err(SchedulerError::CorruptState { path, source });
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(e.into()),
        };

        Ok(Self {
            path,
            jobs: Mutex::new(jobs),
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Persist a snapshot via temp-file rename, so a crash mid-write never
    /// corrupts the previous snapshot.
    fn persist(&self, jobs: &HashMap<String, Job>) -> SchedulerResult<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&tmp, jobs)?;
        tmp.persist(&self.path)
            .map_err(|e| SchedulerError::Io(e.error))?;
        Ok(())
    }

    /// Add a new job.
    pub fn insert(&self, job: Job) -> SchedulerResult<()> {
        let mut jobs = self.lock();
        jobs.insert(job.id.as_str().to_string(), job);
        self.persist(&jobs)
    }

    /// Fetch a copy of a job.
    pub fn get(&self, id: &JobId) -> Option<Job> {
        self.lock().get(id.as_str()).cloned()
    }

    /// Mutate a job in place and persist. Returns `false` when the job does
    /// not exist.
    pub fn update<F>(&self, id: &JobId, f: F) -> SchedulerResult<bool>
    where
        F: FnOnce(&mut Job),
    {
        let mut jobs = self.lock();
        let Some(job) = jobs.get_mut(id.as_str()) else {
            return Ok(false);
        };
        f(job);
        self.persist(&jobs)?;
        Ok(true)
    }

    /// All jobs for a user, newest first.
    pub fn list(&self, user_id: &str) -> Vec<Job> {
        let jobs = self.lock();
        let mut out: Vec<Job> = jobs
            .values()
            .filter(|j| j.user_id == user_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    /// Ids of a user's non-terminal jobs.
    pub fn active_ids(&self, user_id: &str) -> Vec<JobId> {
        self.lock()
            .values()
            .filter(|j| j.user_id == user_id && !j.is_terminal())
            .map(|j| j.id.clone())
            .collect()
    }

    /// Sweep a user's terminal jobs. Returns how many were removed.
    pub fn clear_finished(&self, user_id: &str) -> SchedulerResult<usize> {
        let mut jobs = self.lock();
        let before = jobs.len();
        jobs.retain(|_, j| !(j.user_id == user_id && j.is_terminal()));
        let removed = before - jobs.len();
        if removed > 0 {
            self.persist(&jobs)?;
        }
        Ok(removed)
    }

    /// Fail every job left non-terminal by a previous process (no live worker
    /// owns them anymore). Returns the reconciled jobs so their quota
    /// reservations can be refunded.
    pub fn reconcile_interrupted(&self) -> SchedulerResult<Vec<Job>> {
        let mut jobs = self.lock();
        let mut reconciled = Vec::new();

        for job in jobs.values_mut() {
            if !job.is_terminal() {
                job.fail("interrupted");
                reconciled.push(job.clone());
            }
        }

        if !reconciled.is_empty() {
            self.persist(&jobs)?;
        }
        Ok(reconciled)
    }
}

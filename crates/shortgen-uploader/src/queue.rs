//! Upload queue manager.
//!
//! A single background loop delivers finished artifacts to the external
//! platform, oldest-first across all accounts with rate-window headroom.
//! Every state transition is persisted before the in-memory state is
//! considered authoritative, so the on-disk snapshot is the source of truth
//! after a crash.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Mutex, Notify};
use tracing::{debug, error, info, warn};

use shortgen_models::{UploadEntry, UploadEntryId, UploadMetadata, UploadStatus};

use crate::config::UploadConfig;
use crate::error::{PublishError, UploadError, UploadResult};
use crate::publisher::{Publisher, TokenStore};
use crate::state::{QueueState, StateStore};

/// Snapshot of an account's queue and rate-limit position.
#[derive(Debug, Clone, Serialize)]
pub struct QueueStatus {
    /// Entries waiting for delivery
    pub queued_count: usize,
    /// Uploads still allowed in the current 24h bucket
    pub daily_remaining: u32,
    /// When the next upload slot opens, if the bucket is exhausted
    pub next_available_at: Option<DateTime<Utc>>,
}

enum NextAction {
    /// An attempt was started (and persisted) for this entry.
    Attempt(UploadEntry),
    /// Nothing eligible; sleep at most this long.
    Wait(Duration),
}

enum Tick {
    Worked,
    Idle(Duration),
}

/// Durable, rate-limited delivery queue for finished artifacts.
pub struct UploadQueue {
    inner: Mutex<QueueState>,
    store: StateStore,
    tokens: TokenStore,
    publisher: Arc<dyn Publisher>,
    config: UploadConfig,
    notify: Notify,
}

impl UploadQueue {
    /// Load persisted state and build the queue.
    ///
    /// Entries found mid-attempt are requeued (the interrupted attempt's
    /// outcome is unknown; at-least-once delivery is acceptable). A corrupted
    /// snapshot is a fatal error, never a silent reset.
    pub fn new(config: UploadConfig, publisher: Arc<dyn Publisher>) -> UploadResult<Self> {
        let store = StateStore::new(config.data_dir.join("upload_queue.json"));
        let tokens = TokenStore::new(config.data_dir.join("tokens"));

        let mut state = store.load()?;
        let recovered = state.recover_interrupted();
        if recovered > 0 {
            info!(recovered, "Requeued interrupted upload attempts");
            store.save(&state)?;
        }

        Ok(Self {
            inner: Mutex::new(state),
            store,
            tokens,
            publisher,
            config,
            notify: Notify::new(),
        })
    }

    /// Add a finished artifact to the delivery queue.
    pub async fn enqueue(
        &self,
        account_key: &str,
        artifact_path: impl Into<PathBuf>,
        metadata: UploadMetadata,
    ) -> UploadResult<UploadEntryId> {
        let artifact_path = artifact_path.into();
        if !artifact_path.exists() {
            return Err(UploadError::ArtifactMissing(artifact_path));
        }

        let mut entry = UploadEntry::new(account_key, artifact_path, metadata);
        entry.max_attempts = self.config.max_attempts;
        let entry_id = entry.id.clone();

        let mut state = self.inner.lock().await;
        state.entries.push(entry);
        self.store.save(&state)?;
        drop(state);

        self.notify.notify_one();
        info!(entry_id = %entry_id, account = %account_key, "Enqueued upload");
        Ok(entry_id)
    }

    /// Queue and rate-limit status for one account.
    pub async fn status(&self, account_key: &str) -> QueueStatus {
        let mut state = self.inner.lock().await;
        let now = Utc::now();

        let queued_count = state
            .entries
            .iter()
            .filter(|e| e.account_key == account_key && e.status == UploadStatus::Queued)
            .count();

        let window = state.window_mut(account_key, self.config.daily_limit, now);
        let daily_remaining = window.remaining();
        let next_available_at = if window.has_headroom() {
            None
        } else {
            Some(window.resets_at())
        };

        QueueStatus {
            queued_count,
            daily_remaining,
            next_available_at,
        }
    }

    /// Drop an account's queued entries. History and rate window are kept.
    pub async fn clear_queue(&self, account_key: &str) -> UploadResult<usize> {
        let mut state = self.inner.lock().await;
        let before = state.entries.len();
        state
            .entries
            .retain(|e| !(e.account_key == account_key && e.status == UploadStatus::Queued));
        let dropped = before - state.entries.len();
        self.store.save(&state)?;

        info!(account = %account_key, dropped, "Cleared upload queue");
        Ok(dropped)
    }

    /// Reset an account's rate window and clear its delivery history.
    pub async fn clear_history(&self, account_key: &str) -> UploadResult<()> {
        let mut state = self.inner.lock().await;
        state.history.retain(|r| r.account_key != account_key);
        state.windows.remove(account_key);
        self.store.save(&state)?;

        info!(account = %account_key, "Cleared upload history");
        Ok(())
    }

    /// Invalidate the stored credential so the next upload attempt for this
    /// account re-authenticates.
    pub fn switch_account(&self, account_key: &str) -> UploadResult<()> {
        self.tokens.invalidate(account_key)
    }

    /// Run the delivery loop until shutdown is signalled.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Starting upload delivery loop");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.tick().await {
                Ok(Tick::Worked) => {}
                Ok(Tick::Idle(wait)) => {
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.notify.notified() => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Err(e) => {
                    error!("Upload delivery loop error: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        info!("Upload delivery loop stopped");
    }

    /// Process at most one upload attempt.
    async fn tick(&self) -> UploadResult<Tick> {
        match self.begin_next_attempt().await? {
            NextAction::Attempt(entry) => {
                self.attempt(entry).await?;
                Ok(Tick::Worked)
            }
            NextAction::Wait(wait) => Ok(Tick::Idle(wait)),
        }
    }

    /// Pick the oldest eligible entry with rate headroom and mark its attempt
    /// started (persisted before the attempt runs). When nothing is eligible,
    /// compute how long the loop may sleep: the soonest of the poll interval,
    /// the next rate-window reset, and the next scheduled/backoff deadline.
    async fn begin_next_attempt(&self) -> UploadResult<NextAction> {
        let mut state = self.inner.lock().await;
        let now = Utc::now();

        // An entry already delivered per the persisted history must not be
        // published again; drop such duplicates from the active queue.
        let duplicates: Vec<UploadEntryId> = state
            .entries
            .iter()
            .filter(|e| e.status == UploadStatus::Queued && state.uploaded_in_history(&e.id))
            .map(|e| e.id.clone())
            .collect();
        if !duplicates.is_empty() {
            warn!(count = duplicates.len(), "Dropping already-delivered queue entries");
            state.entries.retain(|e| !duplicates.contains(&e.id));
            self.store.save(&state)?;
        }

        let accounts: HashSet<String> = state
            .entries
            .iter()
            .filter(|e| e.status == UploadStatus::Queued)
            .map(|e| e.account_key.clone())
            .collect();

        let mut headroom: HashMap<String, bool> = HashMap::new();
        let mut resets: HashMap<String, DateTime<Utc>> = HashMap::new();
        for account in accounts {
            let window = state.window_mut(&account, self.config.daily_limit, now);
            headroom.insert(account.clone(), window.has_headroom());
            resets.insert(account, window.resets_at());
        }

        let mut best: Option<usize> = None;
        for (i, entry) in state.entries.iter().enumerate() {
            if !entry.is_eligible(now) {
                continue;
            }
            if !headroom.get(&entry.account_key).copied().unwrap_or(false) {
                continue;
            }
            match best {
                Some(b) if state.entries[b].created_at <= entry.created_at => {}
                _ => best = Some(i),
            }
        }

        if let Some(i) = best {
            state.entries[i].begin_attempt();
            let snapshot = state.entries[i].clone();
            self.store.save(&state)?;
            return Ok(NextAction::Attempt(snapshot));
        }

        let mut wait = self.config.poll_interval;
        for entry in state
            .entries
            .iter()
            .filter(|e| e.status == UploadStatus::Queued)
        {
            let wake_at = if !headroom.get(&entry.account_key).copied().unwrap_or(true) {
                resets.get(&entry.account_key).copied()
            } else {
                entry.eligible_at().filter(|at| *at > now)
            };
            if let Some(at) = wake_at {
                let until = (at - now).to_std().unwrap_or_default();
                if until < wait {
                    wait = until.max(Duration::from_millis(100));
                }
            }
        }

        Ok(NextAction::Wait(wait))
    }

    /// Run one upload attempt for an entry already marked `uploading`.
    async fn attempt(&self, entry: UploadEntry) -> UploadResult<()> {
        info!(
            entry_id = %entry.id,
            account = %entry.account_key,
            attempt = entry.attempts,
            max_attempts = entry.max_attempts,
            "Starting upload attempt"
        );

        let result = self.publish_with_credential(&entry).await;
        let mut state = self.inner.lock().await;

        match result {
            Ok(remote_id) => {
                let now = Utc::now();
                if let Some(e) = state.entry_mut(&entry.id) {
                    e.mark_uploaded();
                }
                state
                    .window_mut(&entry.account_key, self.config.daily_limit, now)
                    .record_upload();
                state.retire_entry(&entry.id, Some(remote_id.clone()));
                self.store.save(&state)?;
                drop(state);

                // Delete the local artifact only after the success is durable.
                if let Err(e) = std::fs::remove_file(&entry.artifact_path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(
                            entry_id = %entry.id,
                            path = %entry.artifact_path.display(),
                            "Failed to delete uploaded artifact: {}", e
                        );
                    }
                }

                info!(entry_id = %entry.id, remote_id = %remote_id, "Upload confirmed");
            }
            Err(PublishError::Transient(msg)) => {
                let can_retry = state
                    .entry_mut(&entry.id)
                    .map(|e| e.can_retry())
                    .unwrap_or(false);

                if can_retry {
                    let delay = self.config.backoff_for_attempt(entry.attempts);
                    let next_attempt_at = Utc::now()
                        + chrono::Duration::from_std(delay)
                            .unwrap_or_else(|_| chrono::Duration::seconds(30));
                    if let Some(e) = state.entry_mut(&entry.id) {
                        e.retry_later(&msg, next_attempt_at);
                    }
                    self.store.save(&state)?;
                    warn!(
                        entry_id = %entry.id,
                        attempt = entry.attempts,
                        retry_in = ?delay,
                        "Transient upload failure, will retry: {}", msg
                    );
                } else {
                    if let Some(e) = state.entry_mut(&entry.id) {
                        e.fail_permanently(&msg);
                    }
                    state.retire_entry(&entry.id, None);
                    self.store.save(&state)?;
                    // The artifact stays on disk for manual retrieval.
                    error!(
                        entry_id = %entry.id,
                        attempts = entry.attempts,
                        "Upload failed after max attempts: {}", msg
                    );
                }
            }
            Err(PublishError::Permanent(msg)) => {
                if let Some(e) = state.entry_mut(&entry.id) {
                    e.fail_permanently(&msg);
                }
                state.retire_entry(&entry.id, None);
                self.store.save(&state)?;
                error!(entry_id = %entry.id, "Permanent upload failure: {}", msg);
            }
        }

        Ok(())
    }

    /// Resolve the account credential (re-authenticating when needed) and
    /// call the external publish operation.
    async fn publish_with_credential(&self, entry: &UploadEntry) -> Result<String, PublishError> {
        let credential = match self.tokens.load(&entry.account_key) {
            Some(token) => token,
            None => {
                debug!(account = %entry.account_key, "No stored credential, authenticating");
                let token = self.publisher.authenticate(&entry.account_key).await?;
                self.tokens
                    .save(&entry.account_key, &token)
                    .map_err(|e| PublishError::transient(format!("credential store: {}", e)))?;
                token
            }
        };

        if !entry.artifact_path.exists() {
            return Err(PublishError::permanent(format!(
                "artifact missing: {}",
                entry.artifact_path.display()
            )));
        }

        self.publisher
            .publish(&credential, &entry.artifact_path, &entry.metadata)
            .await
    }
}

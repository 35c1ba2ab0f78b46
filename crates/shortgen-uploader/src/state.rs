//! Durable queue state and its on-disk snapshot store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use shortgen_models::{RateWindow, UploadEntry, UploadEntryId, UploadRecord, UploadStatus};

use crate::error::{UploadError, UploadResult};

/// Everything the upload queue must remember across restarts: active
/// entries, delivery history, and per-account rate windows.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct QueueState {
    #[serde(default)]
    pub entries: Vec<UploadEntry>,
    #[serde(default)]
    pub history: Vec<UploadRecord>,
    #[serde(default)]
    pub windows: HashMap<String, RateWindow>,
}

impl QueueState {
    /// Fetch (or create) an account's rate window with lapsed buckets
    /// rolled over.
    pub fn window_mut(&mut self, account_key: &str, limit: u32, now: DateTime<Utc>) -> &mut RateWindow {
        let window = self
            .windows
            .entry(account_key.to_string())
            .or_insert_with(|| RateWindow::new(limit));
        window.rollover_if_due(now);
        window
    }

    pub fn entry_mut(&mut self, id: &UploadEntryId) -> Option<&mut UploadEntry> {
        self.entries.iter_mut().find(|e| &e.id == id)
    }

    /// Move a terminal entry out of the active queue into history.
    pub fn retire_entry(&mut self, id: &UploadEntryId, remote_id: Option<String>) {
        if let Some(pos) = self.entries.iter().position(|e| &e.id == id) {
            let entry = self.entries.remove(pos);
            self.history.push(UploadRecord::from_entry(&entry, remote_id));
        }
    }

    /// Check the persisted history for an already-delivered entry id.
    pub fn uploaded_in_history(&self, id: &UploadEntryId) -> bool {
        self.history
            .iter()
            .any(|r| &r.entry_id == id && r.status == UploadStatus::Uploaded)
    }

    /// Requeue entries found mid-attempt after a crash. The interrupted
    /// attempt's outcome is unknown, so it is not charged against the
    /// attempt budget. Returns how many entries were recovered.
    pub fn recover_interrupted(&mut self) -> usize {
        let mut recovered = 0;
        for entry in &mut self.entries {
            if entry.status == UploadStatus::Uploading {
                entry.recover_interrupted();
                recovered += 1;
            }
        }
        recovered
    }
}

/// Atomic snapshot persistence for [`QueueState`].
///
/// Snapshots are written to a temp file in the same directory and renamed
/// into place, so a crash mid-write never corrupts the previous snapshot.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the persisted state. A missing snapshot yields an empty state; an
    /// unreadable one is fatal and must halt startup.
    pub fn load(&self) -> UploadResult<QueueState> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(QueueState::default());
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<QueueState>(&raw) {
            Ok(state) => {
                info!(
                    entries = state.entries.len(),
                    history = state.history.len(),
                    "Loaded upload queue state"
                );
                Ok(state)
            }
            Err(source) => Err(UploadError::CorruptState {
                path: self.path.clone(),
                source,
            }),
        }
    }

    /// Persist a snapshot. The on-disk state is the source of truth: callers
    /// apply in-memory transitions only after this returns.
    pub fn save(&self, state: &QueueState) -> UploadResult<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let tmp = tempfile::NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&tmp, state)?;
        tmp.persist(&self.path).map_err(|e| {
            warn!(path = %self.path.display(), "Failed to persist queue snapshot");
            UploadError::Io(e.error)
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shortgen_models::UploadMetadata;

    fn entry(account: &str) -> UploadEntry {
        UploadEntry::new(account, "/tmp/a.mp4", UploadMetadata::new("t", "d"))
    }

    #[test]
    fn test_missing_snapshot_yields_empty_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("queue.json"));
        let state = store.load().unwrap();
        assert!(state.entries.is_empty());
        assert!(state.history.is_empty());
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("queue.json"));

        let mut state = QueueState::default();
        state.entries.push(entry("acct"));
        state.window_mut("acct", 10, Utc::now()).record_upload();
        store.save(&state).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.entries.len(), 1);
        assert_eq!(loaded.windows["acct"].count, 1);
    }

    #[test]
    fn test_corrupt_snapshot_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        std::fs::write(&path, "{not json").unwrap();

        let err = StateStore::new(&path).load().unwrap_err();
        assert!(matches!(err, UploadError::CorruptState { .. }));
    }

    #[test]
    fn test_recover_interrupted_requeues_uploading() {
        let mut state = QueueState::default();
        let mut e = entry("acct");
        e.begin_attempt();
        state.entries.push(e);
        state.entries.push(entry("acct"));

        assert_eq!(state.recover_interrupted(), 1);
        assert!(state
            .entries
            .iter()
            .all(|e| e.status == UploadStatus::Queued));
        assert_eq!(state.entries[0].attempts, 0);
    }

    #[test]
    fn test_retire_entry_keeps_history() {
        let mut state = QueueState::default();
        let mut e = entry("acct");
        e.begin_attempt();
        e.mark_uploaded();
        let id = e.id.clone();
        state.entries.push(e);

        state.retire_entry(&id, Some("remote-1".into()));
        assert!(state.entries.is_empty());
        assert_eq!(state.history.len(), 1);
        assert!(state.uploaded_in_history(&id));
        assert_eq!(state.history[0].remote_id.as_deref(), Some("remote-1"));
    }
}

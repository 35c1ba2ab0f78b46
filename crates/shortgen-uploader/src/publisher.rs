//! External publish platform boundary and credential storage.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info};

use shortgen_models::UploadMetadata;

use crate::error::{PublishError, UploadResult};

/// External collaborator that delivers an artifact to the video platform.
///
/// Implementations wrap the platform SDK/API. The queue manager handles
/// retries, rate limiting, and durability; implementations only signal
/// whether a failure is worth retrying.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Establish a credential/token for the given account key (OAuth-style
    /// flow). Called when no stored token exists, or after `switch_account`
    /// invalidated it.
    async fn authenticate(&self, account_key: &str) -> Result<String, PublishError>;

    /// Upload one artifact. Returns the remote video id on success.
    async fn publish(
        &self,
        credential: &str,
        artifact: &Path,
        metadata: &UploadMetadata,
    ) -> Result<String, PublishError>;
}

/// On-disk store for per-account credential tokens.
///
/// One token file per account key under the uploader data directory.
/// `invalidate` removes the file, forcing re-authentication on the next
/// upload attempt.
#[derive(Debug, Clone)]
pub struct TokenStore {
    dir: PathBuf,
}

impl TokenStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn token_path(&self, account_key: &str) -> PathBuf {
        self.dir.join(format!("{}.token", account_key))
    }

    /// Load the stored token for an account, if any.
    pub fn load(&self, account_key: &str) -> Option<String> {
        let path = self.token_path(account_key);
        match std::fs::read_to_string(&path) {
            Ok(token) if !token.trim().is_empty() => Some(token.trim().to_string()),
            _ => None,
        }
    }

    /// Persist a freshly established token.
    pub fn save(&self, account_key: &str, token: &str) -> UploadResult<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.token_path(account_key), token)?;
        debug!(account = %account_key, "Stored credential token");
        Ok(())
    }

    /// Remove the stored token so the next attempt re-authenticates.
    pub fn invalidate(&self, account_key: &str) -> UploadResult<()> {
        let path = self.token_path(account_key);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                info!(account = %account_key, "Invalidated credential token");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

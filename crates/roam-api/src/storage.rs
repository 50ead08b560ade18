//! Boundary to the blob storage collaborator. The core never looks inside
//! blobs; it stores references and issues deletes when media goes away.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("blob not found")]
    NotFound,

    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, blob: Bytes) -> Result<String, StorageError>;

    /// Deleting a reference that is already gone reports `NotFound`.
    async fn delete(&self, reference: &str) -> Result<(), StorageError>;
}

/// Stores each blob as a flat file at `{dir}/{reference}`.
pub struct LocalBlobStore {
    dir: PathBuf,
}

impl LocalBlobStore {
    pub async fn new(dir: PathBuf) -> anyhow::Result<Self> {
        fs::create_dir_all(&dir).await?;
        info!("Blob storage directory: {}", dir.display());
        Ok(Self { dir })
    }

    /// References are generated UUIDs, so anything else cannot name a file
    /// in this store (and cannot escape the directory).
    fn path_for(&self, reference: &str) -> Option<PathBuf> {
        reference.parse::<Uuid>().ok()?;
        Some(self.dir.join(reference))
    }
}

#[async_trait]
impl BlobStore for LocalBlobStore {
    async fn put(&self, blob: Bytes) -> Result<String, StorageError> {
        let reference = Uuid::new_v4().to_string();
        let path = self.dir.join(&reference);
        fs::write(&path, &blob)
            .await
            .map_err(|e| StorageError::Unavailable(format!("write {}: {}", path.display(), e)))?;
        Ok(reference)
    }

    async fn delete(&self, reference: &str) -> Result<(), StorageError> {
        let Some(path) = self.path_for(reference) else {
            return Err(StorageError::NotFound);
        };
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StorageError::NotFound),
            Err(e) => Err(StorageError::Unavailable(format!(
                "delete {}: {}",
                path.display(),
                e
            ))),
        }
    }
}

/// Timeout and retry budget for storage calls made during deletes.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub timeout: Duration,
    /// Attempts after the first one.
    pub retries: u32,
    pub initial_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            retries: 3,
            initial_backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Delete one blob, treating an already-missing blob as deleted. Each
    /// attempt is bounded by `timeout`; failed attempts back off
    /// exponentially.
    pub async fn delete(&self, store: &dyn BlobStore, reference: &str) -> Result<(), StorageError> {
        let mut backoff = self.initial_backoff;
        let mut attempt = 0;

        loop {
            let outcome = match tokio::time::timeout(self.timeout, store.delete(reference)).await {
                Ok(Ok(())) | Ok(Err(StorageError::NotFound)) => return Ok(()),
                Ok(Err(e)) => e,
                Err(_) => StorageError::Unavailable(format!("delete of {} timed out", reference)),
            };

            if attempt >= self.retries {
                warn!(
                    "Giving up on blob {} after {} attempts: {}",
                    reference,
                    attempt + 1,
                    outcome
                );
                return Err(outcome);
            }

            warn!(
                "Blob delete {} failed (attempt {}): {}, retrying in {:?}",
                reference,
                attempt + 1,
                outcome,
                backoff
            );
            tokio::time::sleep(backoff).await;
            backoff = backoff.saturating_mul(2);
            attempt += 1;
        }
    }

    /// Delete every reference; stops at the first one that cannot be
    /// deleted. Already-deleted blobs succeed on a later run.
    pub async fn delete_all<'a, I>(&self, store: &dyn BlobStore, references: I) -> Result<usize, StorageError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut deleted = 0;
        for reference in references {
            self.delete(store, reference).await?;
            deleted += 1;
        }
        Ok(deleted)
    }
}

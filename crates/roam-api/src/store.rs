use std::sync::Arc;
use std::time::Duration;

use rusqlite::Connection;
use tracing::error;

use roam_db::Database;

use crate::error::{ApiError, ApiResult};

/// Runs blocking SQLite work off the async runtime.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
    read_timeout: Duration,
}

impl Store {
    pub fn new(db: Arc<Database>, read_timeout: Duration) -> Self {
        Self { db, read_timeout }
    }

    /// A read, abandoned with `Unavailable` after the read timeout.
    pub async fn read<F, T>(&self, f: F) -> ApiResult<T>
    where
        F: FnOnce(&Connection) -> ApiResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        let task = tokio::task::spawn_blocking(move || db.with_conn(f));
        match tokio::time::timeout(self.read_timeout, task).await {
            Ok(joined) => joined.map_err(join_error)?,
            Err(_) => Err(ApiError::Unavailable("data store read timed out".to_string())),
        }
    }

    /// A write against the writer connection. Not abandoned once started: a
    /// write that might still commit must not be reported as failed. The
    /// connection's busy timeout bounds how long it can wait for the lock.
    pub async fn write<F, T>(&self, f: F) -> ApiResult<T>
    where
        F: FnOnce(&mut Connection) -> ApiResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || db.with_conn_mut(f))
            .await
            .map_err(join_error)?
    }
}

fn join_error(e: tokio::task::JoinError) -> ApiError {
    error!("spawn_blocking join error: {}", e);
    ApiError::Unavailable("data store task failed".to_string())
}

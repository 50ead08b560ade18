use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Per-trip async locks. Mutations on one trip run one at a time; different
/// trips never contend. Entries are dropped once nobody holds or waits on
/// them.
#[derive(Clone, Default)]
pub struct TripLocks {
    inner: Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

pub struct TripGuard {
    trip_id: String,
    locks: TripLocks,
    guard: Option<OwnedMutexGuard<()>>,
}

impl TripLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, trip_id: &str) -> TripGuard {
        let mutex = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.entry(trip_id.to_string()).or_default().clone()
        };
        let guard = mutex.lock_owned().await;
        TripGuard {
            trip_id: trip_id.to_string(),
            locks: self.clone(),
            guard: Some(guard),
        }
    }

    /// Number of trips with a live lock entry.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for TripGuard {
    fn drop(&mut self) {
        // Release first so the count below only sees the map and waiters.
        drop(self.guard.take());
        let mut map = self.locks.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mutex) = map.get(&self.trip_id) {
            if Arc::strong_count(mutex) == 1 {
                map.remove(&self.trip_id);
            }
        }
    }
}

//! Per-key async locks.
//!
//! The reconciler and the delivery tracker both read-modify-write job
//! records and feature-set readiness. Each such sequence runs while holding
//! the lock for its key, so an ack cannot interleave with the retirement of
//! the job it names.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Guard for one key; the lock is released on drop.
pub type KeyGuard = OwnedMutexGuard<()>;

#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock a job record.
    pub async fn lock_job(&self, job_id: &str) -> KeyGuard {
        self.lock(format!("job:{job_id}")).await
    }

    /// Lock a feature set's version and readiness.
    pub async fn lock_feature_set(&self, reference: &str) -> KeyGuard {
        self.lock(format!("feature-set:{reference}")).await
    }

    async fn lock(&self, key: String) -> KeyGuard {
        let mutex = {
            let mut locks = self
                .locks
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            // Drop entries nobody holds or waits on.
            locks.retain(|_, m| Arc::strong_count(m) > 1);
            locks.entry(key).or_default().clone()
        };
        mutex.lock_owned().await
    }

    /// Number of keys currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.locks
            .lock()
            .map(|locks| locks.len())
            .unwrap_or_default()
    }
}

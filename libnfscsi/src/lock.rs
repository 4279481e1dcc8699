//! Per-volume mutual exclusion.
//!
//! Every lifecycle operation (create, delete, stage, publish, ...) holds the
//! lock of the volume it touches, so a delete can never interleave with a
//! publish of the same volume.  Operations on different volumes never wait
//! on each other.  Waiters are not queued in any particular order.
//!
//! Entries are created on demand and evicted when the last holder or waiter
//! for an id goes away, so the map only contains volumes with operations in
//! flight.

use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// Registry of per-key async mutexes.
#[derive(Debug, Default)]
pub struct VolumeLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl VolumeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other operation holds `key`, then hold it until the
    /// returned guard is dropped.
    pub async fn lock(&self, key: &str) -> VolumeLockGuard<'_> {
        // Clone under the shard lock so eviction sees this task as a user.
        let mutex = Arc::clone(self.locks.entry(key.to_owned()).or_default().value());
        let guard = mutex.lock_owned().await;
        trace!(key, "volume lock acquired");
        VolumeLockGuard {
            registry: self,
            key: key.to_owned(),
            guard: Some(guard),
        }
    }

    /// Run `fut` while holding the lock for `key`.  The lock is released on
    /// every exit path, including when `fut` is cancelled.
    pub async fn with_lock<F, T>(&self, key: &str, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let _guard = self.lock(key).await;
        fut.await
    }

    /// Number of ids with an operation in flight.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

/// Holds one volume lock; releases and evicts it on drop.
pub struct VolumeLockGuard<'a> {
    registry: &'a VolumeLocks,
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for VolumeLockGuard<'_> {
    fn drop(&mut self) {
        // Release first so the strong count below only counts the map entry
        // and tasks that cloned it to wait.
        drop(self.guard.take());
        self.registry
            .locks
            .remove_if(&self.key, |_, mutex| Arc::strong_count(mutex) == 1);
        trace!(key = %self.key, "volume lock released");
    }
}

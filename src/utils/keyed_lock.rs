//! Per-key async mutual exclusion.
//!
//! A [`KeyedLocks`] table hands out one `tokio::sync::Mutex` per key, so work
//! on the same repository is serialized while work on different repositories
//! proceeds in parallel. Mutexes are created lazily and live as long as the
//! table; the number of keys is bounded by the configured sources and
//! locations.

use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Table of async mutexes keyed by repository identity.
#[derive(Debug, Default, Clone)]
pub struct KeyedLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl KeyedLocks {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for exclusive access to `key`.
    ///
    /// The returned guard releases the key when dropped.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let mutex = self.locks.entry(key.to_string()).or_default().clone();
        if mutex.try_lock().is_err() {
            tracing::debug!("Waiting for lock on '{}'", key);
        }
        mutex.lock_owned().await
    }

    /// Attempts to take `key` without waiting.
    pub fn try_lock(&self, key: &str) -> Option<OwnedMutexGuard<()>> {
        let mutex = self.locks.entry(key.to_string()).or_default().clone();
        mutex.try_lock_owned().ok()
    }

    /// Number of keys that have ever been locked.
    #[must_use]
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no key has been locked yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

//! Per-session cache of fetched location content.
//!
//! Entries hold the entities read directly from one location (nested
//! locations have their own entries). Expiry is checked lazily when an entry
//! is read; nothing runs in the background.
//!
//! A fetch in flight is recorded as a `Pending` slot carrying a
//! [`Notify`]. Concurrent requesters for the same location wait on it and then
//! re-read the slot instead of starting a second fetch. A failed fetch clears
//! the slot and wakes the waiters, and the next one to look takes over.

use anyhow::Result;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

use super::LocationId;
use crate::catalog::SourcedEntity;
use crate::constants::PENDING_STATE_TIMEOUT;

/// Fetched content of one location.
#[derive(Debug, Clone)]
pub struct LocationCacheEntry {
    /// Location this content belongs to
    pub location_id: LocationId,
    /// Entities read from the location
    pub entities: Arc<Vec<SourcedEntity>>,
    /// When the content was fetched
    pub fetched_at: Instant,
    /// Lifetime of the entry
    pub ttl: Duration,
}

impl LocationCacheEntry {
    /// Whether the entry outlived its TTL.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.fetched_at.elapsed() >= self.ttl
    }
}

#[derive(Debug)]
enum Slot {
    Pending(Arc<Notify>),
    Ready(LocationCacheEntry),
}

/// Location content cache owned by one resolver session.
#[derive(Debug, Clone)]
pub struct LocationCache {
    slots: Arc<DashMap<LocationId, Slot>>,
    ttl: Duration,
}

impl LocationCache {
    /// Creates an empty cache whose entries live for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            ttl,
        }
    }

    /// Entry lifetime.
    #[must_use]
    pub const fn ttl(&self) -> Duration {
        self.ttl
    }

    /// A fresh entry for `id`, if any.
    #[must_use]
    pub fn get(&self, id: &LocationId) -> Option<LocationCacheEntry> {
        match self.slots.get(id).as_deref() {
            Some(Slot::Ready(entry)) if !entry.is_expired() => Some(entry.clone()),
            _ => None,
        }
    }

    /// Returns the cached entities for `id`, running `fetch` when the entry
    /// is missing or expired.
    ///
    /// At most one `fetch` runs per location at a time; other callers wait for
    /// its result.
    pub async fn get_or_fetch<F, Fut>(&self, id: &LocationId, fetch: F) -> Result<Arc<Vec<SourcedEntity>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<SourcedEntity>>>,
    {
        let notify = Arc::new(Notify::new());
        let mut owns_slot = true;

        loop {
            match self.slots.entry(id.clone()) {
                Entry::Occupied(mut occupied) => {
                    let in_flight = match occupied.get() {
                        Slot::Ready(entry) if !entry.is_expired() => {
                            tracing::debug!(target: "location", "Cache hit for {id}");
                            return Ok(entry.entities.clone());
                        }
                        Slot::Ready(_) => None,
                        Slot::Pending(existing) => Some(existing.clone()),
                    };

                    let Some(existing) = in_flight else {
                        tracing::debug!(target: "location", "Cache entry for {id} expired");
                        occupied.insert(Slot::Pending(notify.clone()));
                        break;
                    };

                    // Register before releasing the shard so a completion in
                    // between is not missed
                    let notified = existing.notified();
                    drop(occupied);

                    tracing::debug!(target: "location", "Waiting for in-flight fetch of {id}");
                    tokio::select! {
                        () = notified => continue,
                        () = tokio::time::sleep(PENDING_STATE_TIMEOUT) => {
                            tracing::warn!(
                                target: "location",
                                "Timed out waiting for fetch of {id}, fetching directly"
                            );
                            owns_slot = false;
                            break;
                        }
                    }
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(Slot::Pending(notify.clone()));
                    break;
                }
            }
        }

        let result = fetch().await;

        match result {
            Ok(entities) => {
                let entities = Arc::new(entities);
                let entry = LocationCacheEntry {
                    location_id: id.clone(),
                    entities: entities.clone(),
                    fetched_at: Instant::now(),
                    ttl: self.ttl,
                };
                if owns_slot {
                    self.slots.insert(id.clone(), Slot::Ready(entry));
                    notify.notify_waiters();
                }
                Ok(entities)
            }
            Err(e) => {
                if owns_slot {
                    self.slots.remove(id);
                    notify.notify_waiters();
                }
                Err(e)
            }
        }
    }

    /// Drops the entry for `id`. Returns whether one existed.
    pub fn invalidate(&self, id: &LocationId) -> bool {
        matches!(self.slots.remove_if(id, |_, slot| matches!(slot, Slot::Ready(_))), Some(_))
    }

    /// Drops every completed entry. Fetches in flight are left to finish.
    pub fn clear(&self) {
        self.slots.retain(|_, slot| matches!(slot, Slot::Pending(_)));
    }

    /// Number of completed entries, fresh or expired.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| matches!(slot.value(), Slot::Ready(_))).count()
    }

    /// Whether no completed entry exists.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::location::LocationTarget;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn id(name: &str) -> LocationId {
        LocationTarget::Local(PathBuf::from(format!("/catalogs/{name}.yaml"))).id()
    }

    #[tokio::test]
    async fn test_fresh_entry_is_reused() {
        let cache = LocationCache::new(Duration::from_secs(60));
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            cache
                .get_or_fetch(&id("a"), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Vec::new())
                })
                .await
                .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.get(&id("a")).is_some());
    }

    #[tokio::test]
    async fn test_expired_entry_is_refetched() {
        let cache = LocationCache::new(Duration::from_millis(20));
        let calls = AtomicUsize::new(0);
        let fetch = || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        };
        cache.get_or_fetch(&id("a"), fetch).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert!(cache.get(&id("a")).is_none());
        cache.get_or_fetch(&id("a"), fetch).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_fetch() {
        let cache = LocationCache::new(Duration::from_secs(60));
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    cache
                        .get_or_fetch(&id("shared"), || async {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            Ok(Vec::new())
                        })
                        .await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let cache = LocationCache::new(Duration::from_secs(60));
        let failed = cache
            .get_or_fetch(&id("a"), || async { Err(anyhow::anyhow!("unreachable")) })
            .await;
        assert!(failed.is_err());
        assert!(cache.is_empty());
        cache.get_or_fetch(&id("a"), || async { Ok(Vec::new()) }).await.unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_and_clear() {
        let cache = LocationCache::new(Duration::from_secs(60));
        cache.get_or_fetch(&id("a"), || async { Ok(Vec::new()) }).await.unwrap();
        cache.get_or_fetch(&id("b"), || async { Ok(Vec::new()) }).await.unwrap();

        assert!(cache.invalidate(&id("a")));
        assert!(!cache.invalidate(&id("a")));
        assert_eq!(cache.len(), 1);
        cache.clear();
        assert!(cache.is_empty());
    }
}

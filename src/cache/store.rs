//! Client projection cache
//!
//! Shares one live handle per projection instance across every local
//! subscriber and bounds memory with an LRU policy that never evicts an
//! instance somebody is still subscribed to.
//!
//! Entries live in a concurrent map. Recency lives in a separate LRU list
//! behind one mutex; touching, pinning and eviction all happen under that
//! mutex, so an entry can't be pinned and evicted at the same time. The map
//! is never held across the LRU lock being taken.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use lru::LruCache;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::hub::ProjectionHubClient;
use crate::projection::{ProjectionKey, ProjectionUpdated};
use crate::stats::CacheStats;

use super::config::CacheConfig;
use super::entry::CacheEntry;
use super::fetch::ProjectionFetcher;
use super::ripple::{ChangeListener, Ripple};
use super::subscription::ProjectionSubscription;

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

/// Cache of live projection handles keyed by projection instance
pub struct ProjectionCache<T> {
    /// Map of projection key to cache entry
    entries: DashMap<ProjectionKey, Arc<CacheEntry<T>>>,

    /// Recency order; unbounded, capacity is enforced by `evict_for_insert`
    lru: Mutex<LruCache<ProjectionKey, ()>>,

    fetcher: Arc<dyn ProjectionFetcher<T>>,
    hub: Arc<dyn ProjectionHubClient>,
    config: CacheConfig,
    counters: Counters,
}

impl<T: Clone + Send + Sync + 'static> ProjectionCache<T> {
    /// Create a cache with default configuration
    pub fn new(fetcher: Arc<dyn ProjectionFetcher<T>>, hub: Arc<dyn ProjectionHubClient>) -> Self {
        Self::with_config(fetcher, hub, CacheConfig::default())
    }

    /// Create a cache with custom configuration
    pub fn with_config(
        fetcher: Arc<dyn ProjectionFetcher<T>>,
        hub: Arc<dyn ProjectionHubClient>,
        config: CacheConfig,
    ) -> Self {
        Self {
            entries: DashMap::new(),
            lru: Mutex::new(LruCache::unbounded()),
            fetcher,
            hub,
            config,
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Subscribe to a projection instance
    pub async fn subscribe(
        &self,
        projection_type: &str,
        entity_id: &str,
        on_changed: ChangeListener<T>,
    ) -> Result<ProjectionSubscription<T>> {
        let cancel = CancellationToken::new();
        self.subscribe_with_cancel(projection_type, entity_id, on_changed, &cancel)
            .await
    }

    /// Subscribe, giving up with [`Error::Cancelled`] once `cancel` fires
    ///
    /// Looks up or creates the entry, pins it and registers `on_changed`,
    /// then loads the value if nobody has yet. If loading fails or is
    /// cancelled the subscription is released, and an entry created by this
    /// call is removed again unless another subscriber picked it up.
    pub async fn subscribe_with_cancel(
        &self,
        projection_type: &str,
        entity_id: &str,
        on_changed: ChangeListener<T>,
        cancel: &CancellationToken,
    ) -> Result<ProjectionSubscription<T>> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let key = ProjectionKey::new(projection_type, entity_id);
        let (entry, created) = self.acquire(&key);

        let listener = entry.ripple.add_listener(on_changed);
        let subscription = ProjectionSubscription::new(Arc::clone(&entry), listener);

        tracing::debug!(
            projection = %key,
            created = created,
            subscribers = entry.subscriber_count(),
            "Cache subscribe"
        );

        if let Err(e) = entry.ripple.activate(cancel).await {
            subscription.dispose();
            if created {
                self.roll_back(&key, &entry).await;
            }
            if !e.is_cancelled() {
                tracing::warn!(projection = %key, error = %e, "Projection activation failed");
            }
            return Err(e);
        }

        Ok(subscription)
    }

    /// Cached value without subscribing
    ///
    /// Counts as a use for LRU purposes. `None` if the instance is not
    /// cached or not loaded yet.
    pub fn get_cached(&self, projection_type: &str, entity_id: &str) -> Option<T> {
        let key = ProjectionKey::new(projection_type, entity_id);

        let entry = {
            let mut lru = self.lru.lock();
            let entry = self.entries.get(&key).map(|entry| Arc::clone(entry.value()));
            if entry.is_some() {
                lru.get(&key);
            }
            entry
        };

        match entry {
            Some(entry) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                entry.ripple.current()
            }
            None => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn is_cached(&self, projection_type: &str, entity_id: &str) -> bool {
        self.entries
            .contains_key(&ProjectionKey::new(projection_type, entity_id))
    }

    /// Force a re-fetch of a cached instance
    ///
    /// Returns false if the instance is not cached.
    pub async fn refresh(
        &self,
        projection_type: &str,
        entity_id: &str,
        cancel: &CancellationToken,
    ) -> Result<bool> {
        let Some(entry) = self.lookup(&ProjectionKey::new(projection_type, entity_id)) else {
            return Ok(false);
        };
        entry.ripple.refresh(cancel).await?;
        Ok(true)
    }

    /// Remove and dispose an instance regardless of its subscribers
    ///
    /// Returns false if the instance is not cached.
    pub async fn evict(&self, projection_type: &str, entity_id: &str) -> bool {
        let key = ProjectionKey::new(projection_type, entity_id);

        let entry = {
            let mut lru = self.lru.lock();
            lru.pop(&key);
            self.entries.remove(&key).map(|(_, entry)| entry)
        };

        let Some(entry) = entry else {
            return false;
        };

        tracing::debug!(
            projection = %key,
            subscribers = entry.subscriber_count(),
            "Evicted projection"
        );
        dispose_quietly(&entry.ripple).await;
        true
    }

    /// Dispose every entry and clear all bookkeeping
    pub async fn dispose(&self) {
        let entries: Vec<Arc<CacheEntry<T>>> = {
            let mut lru = self.lru.lock();
            lru.clear();
            let entries = self
                .entries
                .iter()
                .map(|entry| Arc::clone(entry.value()))
                .collect();
            self.entries.clear();
            entries
        };

        let count = entries.len();
        join_all(entries.iter().map(|entry| dispose_quietly(&entry.ripple))).await;

        tracing::info!(entries = count, "Projection cache disposed");
    }

    /// Route a pushed update to the matching entry
    ///
    /// No-op if the instance is not cached.
    pub async fn handle_notification(&self, update: &ProjectionUpdated) {
        let key = update.key();
        let Some(entry) = self.lookup(&key) else {
            tracing::trace!(
                projection = %key,
                version = update.new_version,
                "Update for uncached projection"
            );
            return;
        };

        if let Err(e) = entry.ripple.on_server_update(update.new_version).await {
            tracing::warn!(
                projection = %key,
                version = update.new_version,
                error = %e,
                "Failed to refresh projection after update"
            );
        }
    }

    /// Re-establish every server subscription after a transport reconnect
    ///
    /// Failures are isolated per entry. Returns how many entries succeeded.
    pub async fn resubscribe_all(&self, cancel: &CancellationToken) -> usize {
        let entries: Vec<Arc<CacheEntry<T>>> = self
            .entries
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let results = join_all(entries.iter().map(|entry| async move {
            let result = entry.ripple.resubscribe(cancel).await;
            (entry, result)
        }))
        .await;

        let mut succeeded = 0;
        for (entry, result) in results {
            match result {
                Ok(()) => succeeded += 1,
                Err(e) => {
                    tracing::warn!(projection = %entry.key, error = %e, "Resubscribe failed");
                }
            }
        }

        tracing::info!(entries = entries.len(), succeeded = succeeded, "Resubscribed projections");
        succeeded
    }

    pub fn stats(&self) -> CacheStats {
        let active_subscribers = self
            .entries
            .iter()
            .map(|entry| entry.value().subscriber_count())
            .sum();

        CacheStats {
            entries: self.entries.len(),
            capacity: self.config.capacity,
            active_subscribers,
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            evictions: self.counters.evictions.load(Ordering::Relaxed),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Subscriber count of a cached instance
    pub fn subscriber_count(&self, projection_type: &str, entity_id: &str) -> Option<usize> {
        self.lookup(&ProjectionKey::new(projection_type, entity_id))
            .map(|entry| entry.subscriber_count())
    }

    fn lookup(&self, key: &ProjectionKey) -> Option<Arc<CacheEntry<T>>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Find or create the entry for `key`, touch it and pin it
    fn acquire(&self, key: &ProjectionKey) -> (Arc<CacheEntry<T>>, bool) {
        let mut lru = self.lru.lock();

        if let Some(entry) = self.lookup(key) {
            lru.get(key);
            entry.pin();
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return (entry, false);
        }

        self.counters.misses.fetch_add(1, Ordering::Relaxed);
        self.evict_for_insert(&mut lru);

        let ripple = Ripple::new(key.clone(), Arc::clone(&self.fetcher), Arc::clone(&self.hub));
        let entry = Arc::new(CacheEntry::new(key.clone(), ripple));
        entry.pin();

        self.entries.insert(key.clone(), Arc::clone(&entry));
        lru.put(key.clone(), ());

        (entry, true)
    }

    /// Make room for one more entry; caller holds the LRU lock
    ///
    /// Evicts the least recently used entry without subscribers. If every
    /// entry is pinned nothing is evicted and the cache grows past capacity.
    fn evict_for_insert(&self, lru: &mut LruCache<ProjectionKey, ()>) {
        if self.entries.len() < self.config.capacity {
            return;
        }

        // `iter` runs most to least recent
        let victim = lru
            .iter()
            .rev()
            .map(|(key, _)| key)
            .find(|key| self.lookup(key).map_or(true, |entry| !entry.is_pinned()))
            .cloned();

        let Some(victim) = victim else {
            tracing::debug!(
                entries = self.entries.len(),
                capacity = self.config.capacity,
                "All entries pinned, cache over capacity"
            );
            return;
        };

        lru.pop(&victim);
        let Some((_, entry)) = self.entries.remove(&victim) else {
            return;
        };
        self.counters.evictions.fetch_add(1, Ordering::Relaxed);

        tracing::debug!(projection = %victim, "Evicted least recently used projection");

        // Not cancellable; failures are only logged
        let ripple = Arc::clone(&entry.ripple);
        tokio::spawn(async move {
            dispose_quietly(&ripple).await;
        });
    }

    /// Remove an entry whose creating subscribe failed, unless it has been
    /// replaced or picked up by another subscriber in the meantime
    async fn roll_back(&self, key: &ProjectionKey, entry: &Arc<CacheEntry<T>>) {
        let removed = {
            let mut lru = self.lru.lock();
            let current = self.lookup(key);
            match current {
                Some(current) if Arc::ptr_eq(&current, entry) && !current.is_pinned() => {
                    lru.pop(key);
                    self.entries.remove(key);
                    true
                }
                _ => false,
            }
        };

        if removed {
            tracing::debug!(projection = %key, "Rolled back cache entry");
            dispose_quietly(&entry.ripple).await;
        }
    }
}

async fn dispose_quietly<T: Clone + Send + Sync + 'static>(ripple: &Ripple<T>) {
    if let Err(e) = ripple.dispose().await {
        tracing::debug!(projection = %ripple.key(), error = %e, "Ripple dispose failed");
    }
}

//! Subscription handle returned by the cache

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::projection::ProjectionKey;

use super::entry::CacheEntry;
use super::ripple::{ListenerId, Ripple};

/// One subscriber's hold on a cached projection instance
///
/// While alive it pins the entry against LRU eviction and receives change
/// callbacks. Disposing (or dropping) it unregisters the callback and
/// releases the pin. The cached value is kept.
pub struct ProjectionSubscription<T> {
    entry: Arc<CacheEntry<T>>,
    listener: ListenerId,
    disposed: AtomicBool,
}

impl<T> ProjectionSubscription<T> {
    pub(super) fn new(entry: Arc<CacheEntry<T>>, listener: ListenerId) -> Self {
        Self {
            entry,
            listener,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn key(&self) -> &ProjectionKey {
        &self.entry.key
    }

    pub fn ripple(&self) -> &Arc<Ripple<T>> {
        &self.entry.ripple
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Release this subscription; idempotent
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.entry.ripple.remove_listener(self.listener);
        self.entry.unpin();

        tracing::debug!(
            projection = %self.entry.key,
            subscribers = self.entry.subscriber_count(),
            "Subscription released"
        );
    }
}

impl<T: Clone + Send + Sync + 'static> ProjectionSubscription<T> {
    /// Current value of the instance
    pub fn current(&self) -> Option<T> {
        self.entry.ripple.current()
    }
}

impl<T> Drop for ProjectionSubscription<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}

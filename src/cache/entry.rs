//! Cache entry
//!
//! One entry per cached projection instance: the live handle plus the
//! number of subscriptions currently holding it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::projection::ProjectionKey;

use super::ripple::Ripple;

/// Entry for a single projection instance in the cache
pub struct CacheEntry<T> {
    pub key: ProjectionKey,

    /// Live data handle shared by every subscriber
    pub ripple: Arc<Ripple<T>>,

    /// Number of active subscriptions; nonzero pins the entry
    subscriber_count: AtomicUsize,

    /// When the entry was created
    pub created_at: Instant,
}

impl<T> CacheEntry<T> {
    pub(super) fn new(key: ProjectionKey, ripple: Ripple<T>) -> Self {
        Self {
            key,
            ripple: Arc::new(ripple),
            subscriber_count: AtomicUsize::new(0),
            created_at: Instant::now(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count.load(Ordering::Acquire)
    }

    /// Entries with subscribers are never evicted by the LRU policy
    pub fn is_pinned(&self) -> bool {
        self.subscriber_count() > 0
    }

    pub(super) fn pin(&self) {
        self.subscriber_count.fetch_add(1, Ordering::AcqRel);
    }

    pub(super) fn unpin(&self) {
        // Saturating so a stray release can't wrap to a huge pin count
        let _ = self
            .subscriber_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |count| count.checked_sub(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::testing::RecordingHubClient;
    use crate::cache::MemoryFetcher;

    fn entry() -> CacheEntry<u32> {
        let key = ProjectionKey::new("OrderView", "o-1");
        let ripple = Ripple::new(
            key.clone(),
            Arc::new(MemoryFetcher::<u32>::new()),
            Arc::new(RecordingHubClient::new()),
        );
        CacheEntry::new(key, ripple)
    }

    #[test]
    fn test_pin_unpin() {
        let entry = entry();
        assert!(!entry.is_pinned());

        entry.pin();
        entry.pin();
        assert_eq!(entry.subscriber_count(), 2);

        entry.unpin();
        entry.unpin();
        entry.unpin();
        assert_eq!(entry.subscriber_count(), 0);
        assert!(!entry.is_pinned());
    }
}

//! Statistics for multiplexers and client caches

use std::time::Duration;

use crate::multiplexer::ConnectionId;

/// Per-connection multiplexer statistics
#[derive(Debug, Clone)]
pub struct MultiplexerStats {
    /// Connection the multiplexer serves
    pub connection_id: ConnectionId,
    /// Live logical subscriptions
    pub subscriptions: usize,
    /// Brooks with an open stream subscription
    pub watched_brooks: usize,
    /// Broadcasts delivered to the transport
    pub notifications_sent: u64,
    /// Broadcasts the transport rejected
    pub send_failures: u64,
    /// Position events dropped as duplicates or regressions
    pub stale_positions_dropped: u64,
    /// Time since the multiplexer was activated
    pub uptime: Duration,
}

impl MultiplexerStats {
    pub fn new(connection_id: ConnectionId) -> Self {
        Self {
            connection_id,
            subscriptions: 0,
            watched_brooks: 0,
            notifications_sent: 0,
            send_failures: 0,
            stale_positions_dropped: 0,
            uptime: Duration::ZERO,
        }
    }

    /// Number of logical subscriptions sharing each open stream, on average
    pub fn dedup_ratio(&self) -> f64 {
        if self.watched_brooks == 0 {
            0.0
        } else {
            self.subscriptions as f64 / self.watched_brooks as f64
        }
    }
}

/// Client projection cache statistics
#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    /// Cached entries
    pub entries: usize,
    /// Configured capacity (may be exceeded while all entries are pinned)
    pub capacity: usize,
    /// Sum of subscriber counts over all entries
    pub active_subscribers: usize,
    /// Subscribe or get calls served by an existing entry
    pub hits: u64,
    /// Subscribe or get calls that found no entry
    pub misses: u64,
    /// Entries removed by LRU eviction
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn is_over_capacity(&self) -> bool {
        self.entries > self.capacity
    }
}

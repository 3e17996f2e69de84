//! Cache configuration

/// Default number of cached projection instances
pub const DEFAULT_CAPACITY: usize = 100;

/// Configuration for the client projection cache
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Soft cap on cached entries
    ///
    /// Inserting beyond it evicts the least recently used entry without
    /// subscribers. When every entry has subscribers the cache grows past
    /// the cap until one is released.
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl CacheConfig {
    /// Set capacity (at least 1)
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        assert_eq!(CacheConfig::default().capacity, 100);
    }

    #[test]
    fn test_capacity_floor() {
        assert_eq!(CacheConfig::default().capacity(0).capacity, 1);
        assert_eq!(CacheConfig::default().capacity(2).capacity, 2);
    }
}

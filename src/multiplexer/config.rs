//! Multiplexer configuration

use std::time::Duration;

use crate::projection::PROJECTION_UPDATED;

/// Configuration for per-connection multiplexers and their host
#[derive(Debug, Clone)]
pub struct MultiplexerConfig {
    /// How long a multiplexer may sit with no subscriptions before the
    /// host retires it
    pub idle_timeout: Duration,

    /// How often the host scans for idle or retired multiplexers
    pub cleanup_interval: Duration,

    /// Method name used for update broadcasts
    pub notification_method: String,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(30),
            notification_method: PROJECTION_UPDATED.to_string(),
        }
    }
}

impl MultiplexerConfig {
    /// Set idle timeout
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set cleanup interval
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        // tokio::time::interval panics on a zero period
        self.cleanup_interval = interval.max(Duration::from_millis(1));
        self
    }

    /// Set the broadcast method name
    pub fn notification_method(mut self, method: impl Into<String>) -> Self {
        self.notification_method = method.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MultiplexerConfig::default();

        assert_eq!(config.idle_timeout, Duration::from_secs(300));
        assert_eq!(config.cleanup_interval, Duration::from_secs(30));
        assert_eq!(config.notification_method, "ProjectionUpdated");
    }

    #[test]
    fn test_builder_chaining() {
        let config = MultiplexerConfig::default()
            .idle_timeout(Duration::from_secs(10))
            .cleanup_interval(Duration::from_secs(1))
            .notification_method("Changed");

        assert_eq!(config.idle_timeout, Duration::from_secs(10));
        assert_eq!(config.cleanup_interval, Duration::from_secs(1));
        assert_eq!(config.notification_method, "Changed");
    }

    #[test]
    fn test_builder_cleanup_interval_floor() {
        let config = MultiplexerConfig::default().cleanup_interval(Duration::ZERO);

        assert_eq!(config.cleanup_interval, Duration::from_millis(1));
    }
}

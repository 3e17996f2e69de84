//! Multiplexer host
//!
//! Keeps one multiplexer per connection, activating them on first use and
//! retiring them when the connection closes or they sit idle too long.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::RwLock;

use super::actor::MultiplexerDeps;
use super::config::MultiplexerConfig;
use super::handle::MultiplexerHandle;
use super::state::ConnectionId;

/// Keyed registry of per-connection multiplexers
///
/// Thread-safe via `RwLock`. Lookups for existing connections only take the
/// read lock.
pub struct MultiplexerHost {
    /// Map of connection id to its multiplexer
    connections: RwLock<HashMap<ConnectionId, MultiplexerHandle>>,

    /// Collaborators handed to every new multiplexer
    deps: MultiplexerDeps,

    /// Configuration
    config: MultiplexerConfig,
}

impl MultiplexerHost {
    /// Create a host with default configuration
    pub fn new(deps: MultiplexerDeps) -> Self {
        Self::with_config(deps, MultiplexerConfig::default())
    }

    /// Create a host with custom configuration
    pub fn with_config(deps: MultiplexerDeps, config: MultiplexerConfig) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            deps,
            config,
        }
    }

    pub fn config(&self) -> &MultiplexerConfig {
        &self.config
    }

    /// Get the multiplexer for a connection, activating it if needed
    pub async fn get_or_activate(&self, connection: &ConnectionId) -> MultiplexerHandle {
        {
            let connections = self.connections.read().await;
            if let Some(handle) = connections.get(connection) {
                if handle.is_running() {
                    return handle.clone();
                }
            }
        }

        let mut connections = self.connections.write().await;

        // Another caller may have activated it while we waited for the lock
        if let Some(handle) = connections.get(connection) {
            if handle.is_running() {
                return handle.clone();
            }
        }

        let handle =
            MultiplexerHandle::spawn(connection.clone(), self.deps.clone(), self.config.clone());
        connections.insert(connection.clone(), handle.clone());

        tracing::info!(
            connection = %connection,
            active = connections.len(),
            "Multiplexer activated"
        );

        handle
    }

    /// Get the multiplexer for a connection without activating one
    pub async fn get(&self, connection: &ConnectionId) -> Option<MultiplexerHandle> {
        self.connections.read().await.get(connection).cloned()
    }

    /// Tear down a connection's multiplexer
    ///
    /// Clears all of its subscriptions and closes its brook streams. No-op
    /// for unknown connections.
    pub async fn deactivate(&self, connection: &ConnectionId) {
        let handle = self.connections.write().await.remove(connection);

        if let Some(handle) = handle {
            if let Err(e) = handle.clear_all().await {
                tracing::debug!(connection = %connection, error = %e, "Clear on deactivate failed");
            }
            handle.shutdown();
            tracing::info!(connection = %connection, "Multiplexer deactivated");
        }
    }

    /// Number of live multiplexers
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Run cleanup once
    ///
    /// Retires multiplexers that:
    /// - have stopped running
    /// - were cleared and have not subscribed since
    /// - have been idle longer than `idle_timeout`
    ///
    /// The final call is made by each multiplexer when it reaches the
    /// request in its mailbox, so one that picked up a subscription in the
    /// meantime stays. A multiplexer too busy to answer within
    /// `cleanup_interval` is left for the next round.
    pub async fn cleanup(&self) {
        let idle_timeout = self.config.idle_timeout;
        let wait = self.config.cleanup_interval;

        let candidates: Vec<(ConnectionId, MultiplexerHandle)> = self
            .connections
            .read()
            .await
            .iter()
            .filter(|(_, handle)| handle.should_retire(idle_timeout))
            .map(|(key, handle)| (key.clone(), handle.clone()))
            .collect();

        if candidates.is_empty() {
            return;
        }

        let decisions = join_all(candidates.into_iter().map(|(connection, handle)| async move {
            let answer = tokio::time::timeout(wait, handle.retire_if_idle(idle_timeout)).await;
            let retiring = match answer {
                Ok(Ok(retiring)) => retiring,
                // Already gone
                Ok(Err(_)) => true,
                Err(_) => false,
            };
            (connection, handle, retiring)
        }))
        .await;

        let mut connections = self.connections.write().await;
        for (connection, handle, retiring) in decisions {
            if !retiring {
                tracing::debug!(connection = %connection, "Multiplexer busy, not retired");
                continue;
            }
            // A replacement may have been activated in the meantime
            let current = connections
                .get(&connection)
                .map_or(false, |current| current.same_multiplexer(&handle));
            if current {
                connections.remove(&connection);
                tracing::info!(connection = %connection, "Multiplexer retired by cleanup");
            }
        }
    }

    /// Spawn background cleanup task
    ///
    /// Returns a handle that can be used to abort the task.
    pub fn spawn_cleanup_task(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let host = Arc::clone(self);
        let interval = host.config.cleanup_interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                host.cleanup().await;
            }
        })
    }

    /// Deactivate every connection
    pub async fn shutdown(&self) {
        let connections: Vec<ConnectionId> =
            self.connections.read().await.keys().cloned().collect();
        for connection in connections {
            self.deactivate(&connection).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::brook::BrookKey;
    use crate::multiplexer::testing::{fixture, GatedRegistry};

    #[tokio::test]
    async fn test_activate_is_lazy_and_shared() {
        let fx = fixture();
        let host = MultiplexerHost::new(fx.deps);
        let conn = ConnectionId::new("c1");

        assert!(host.get(&conn).await.is_none());

        let a = host.get_or_activate(&conn).await;
        let b = host.get_or_activate(&conn).await;
        a.subscribe("OrderView", "o-1").await.unwrap();

        // Same multiplexer behind both handles
        assert_eq!(b.get_subscriptions().await.unwrap().len(), 1);
        assert_eq!(host.connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_connections_are_isolated() {
        let fx = fixture();
        let host = MultiplexerHost::new(fx.deps);
        let key = BrookKey::new("orders", "o-1");

        let c1 = host.get_or_activate(&ConnectionId::new("c1")).await;
        let c2 = host.get_or_activate(&ConnectionId::new("c2")).await;
        c1.subscribe("OrderView", "o-1").await.unwrap();
        c2.subscribe("OrderView", "o-1").await.unwrap();

        // Dedup is per connection
        assert_eq!(fx.streams.open_subscriptions(&key), 2);
        assert!(c2.get_subscriptions().await.unwrap().len() == 1);
        assert_eq!(host.connection_count().await, 2);
    }

    #[tokio::test]
    async fn test_deactivate_closes_streams() {
        let fx = fixture();
        let host = MultiplexerHost::new(fx.deps);
        let conn = ConnectionId::new("c1");
        let key = BrookKey::new("orders", "o-1");

        let handle = host.get_or_activate(&conn).await;
        handle.subscribe("OrderView", "o-1").await.unwrap();

        host.deactivate(&conn).await;

        assert_eq!(fx.streams.open_subscriptions(&key), 0);
        assert_eq!(host.connection_count().await, 0);

        // Unknown connection is a no-op
        host.deactivate(&ConnectionId::new("ghost")).await;
    }

    #[tokio::test]
    async fn test_reactivate_after_deactivate_starts_fresh() {
        let fx = fixture();
        let host = MultiplexerHost::new(fx.deps);
        let conn = ConnectionId::new("c1");

        host.get_or_activate(&conn)
            .await
            .subscribe("OrderView", "o-1")
            .await
            .unwrap();
        host.deactivate(&conn).await;

        let handle = host.get_or_activate(&conn).await;
        assert!(handle.get_subscriptions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_retires_idle() {
        let fx = fixture();
        let config = MultiplexerConfig::default().idle_timeout(Duration::from_millis(20));
        let host = MultiplexerHost::with_config(fx.deps, config);

        let idle = ConnectionId::new("idle");
        let busy = ConnectionId::new("busy");
        host.get_or_activate(&idle).await;
        host.get_or_activate(&busy)
            .await
            .subscribe("OrderView", "o-1")
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        host.cleanup().await;

        assert!(host.get(&idle).await.is_none());
        assert!(host.get(&busy).await.is_some());
    }

    #[tokio::test]
    async fn test_cleanup_retires_cleared() {
        let fx = fixture();
        let host = MultiplexerHost::new(fx.deps);
        let conn = ConnectionId::new("c1");

        let handle = host.get_or_activate(&conn).await;
        handle.subscribe("OrderView", "o-1").await.unwrap();
        handle.clear_all().await.unwrap();

        host.cleanup().await;
        assert!(host.get(&conn).await.is_none());
    }

    #[tokio::test]
    async fn test_cleanup_spares_subscribe_in_flight() {
        let mut fx = fixture();
        let registry = Arc::new(GatedRegistry::new());
        fx.deps.registry = registry.clone();
        let config = MultiplexerConfig::default().idle_timeout(Duration::ZERO);
        let host = Arc::new(MultiplexerHost::with_config(fx.deps, config));
        let conn = ConnectionId::new("c1");

        let handle = host.get_or_activate(&conn).await;
        let pending = {
            let handle = handle.clone();
            tokio::spawn(async move { handle.subscribe("OrderView", "o-1").await })
        };
        tokio::task::yield_now().await;

        // Subscribe is parked in the registry lookup
        host.cleanup().await;
        assert!(host.get(&conn).await.is_some());

        registry.release.notify_one();
        let id = pending.await.unwrap().unwrap();

        host.cleanup().await;
        let current = host.get(&conn).await.unwrap();
        assert!(current.same_multiplexer(&handle));
        let subs = current.get_subscriptions().await.unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].subscription_id, id);
        assert_eq!(fx.streams.open_subscriptions(&BrookKey::new("orders", "o-1")), 1);
    }

    #[tokio::test]
    async fn test_cleanup_keeps_replacement() {
        let fx = fixture();
        let host = MultiplexerHost::new(fx.deps);
        let conn = ConnectionId::new("c1");

        let old = host.get_or_activate(&conn).await;
        old.shutdown();
        while old.is_running() {
            tokio::task::yield_now().await;
        }

        // Stopped handles are replaced on the next activation
        let fresh = host.get_or_activate(&conn).await;
        assert!(!fresh.same_multiplexer(&old));
        fresh.subscribe("OrderView", "o-1").await.unwrap();

        host.cleanup().await;
        assert!(host.get(&conn).await.unwrap().same_multiplexer(&fresh));
    }

    #[tokio::test]
    async fn test_cleanup_task() {
        let fx = fixture();
        let config = MultiplexerConfig::default()
            .idle_timeout(Duration::ZERO)
            .cleanup_interval(Duration::from_millis(10));
        let host = Arc::new(MultiplexerHost::with_config(fx.deps, config));
        let conn = ConnectionId::new("c1");

        host.get_or_activate(&conn).await;
        let task = host.spawn_cleanup_task();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(host.connection_count().await, 0);

        task.abort();
    }

    #[tokio::test]
    async fn test_shutdown_deactivates_all() {
        let fx = fixture();
        let host = MultiplexerHost::new(fx.deps);

        for id in ["c1", "c2", "c3"] {
            host.get_or_activate(&ConnectionId::new(id))
                .await
                .subscribe("CartView", id)
                .await
                .unwrap();
        }

        host.shutdown().await;
        assert_eq!(host.connection_count().await, 0);
        assert_eq!(fx.streams.open_subscriptions(&BrookKey::new("carts", "c1")), 0);
    }
}

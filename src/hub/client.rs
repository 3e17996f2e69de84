//! Client side of the hub
//!
//! [`ProjectionHubClient`] is what the cache uses to open and close server
//! subscriptions. [`NotificationPump`] feeds pushed hub messages back into
//! the cache.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::broadcast::HubMessage;
use crate::cache::ProjectionCache;
use crate::error::Result;
use crate::multiplexer::{ConnectionId, SubscriptionId};
use crate::projection::{ProjectionUpdated, PROJECTION_UPDATED};

use super::server::ProjectionHub;

/// Subscription RPCs a client issues against the hub
#[async_trait]
pub trait ProjectionHubClient: Send + Sync {
    async fn subscribe(
        &self,
        projection_type: &str,
        entity_id: &str,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionId>;

    async fn unsubscribe(&self, subscription_id: &SubscriptionId) -> Result<()>;
}

/// In-process client bound to one connection of a [`ProjectionHub`]
pub struct LocalHubClient {
    hub: Arc<ProjectionHub>,
    connection: ConnectionId,
}

impl LocalHubClient {
    pub fn new(hub: Arc<ProjectionHub>, connection: ConnectionId) -> Self {
        Self { hub, connection }
    }

    pub fn connection(&self) -> &ConnectionId {
        &self.connection
    }
}

#[async_trait]
impl ProjectionHubClient for LocalHubClient {
    async fn subscribe(
        &self,
        projection_type: &str,
        entity_id: &str,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionId> {
        self.hub
            .subscribe_with_cancel(&self.connection, projection_type, entity_id, cancel)
            .await
    }

    async fn unsubscribe(&self, subscription_id: &SubscriptionId) -> Result<()> {
        self.hub.unsubscribe(&self.connection, subscription_id).await
    }
}

/// Forwards projection update hub messages to a cache
pub struct NotificationPump;

impl NotificationPump {
    /// Spawn a task draining `ProjectionUpdated` messages into `cache`
    pub fn spawn<T: Clone + Send + Sync + 'static>(
        messages: mpsc::UnboundedReceiver<HubMessage>,
        cache: Arc<ProjectionCache<T>>,
    ) -> JoinHandle<()> {
        Self::spawn_with_method(messages, cache, PROJECTION_UPDATED)
    }

    /// Spawn a task draining updates sent under `method` into `cache`
    ///
    /// `method` must match the server's `MultiplexerConfig::notification_method`.
    /// The task ends when the sender side closes. Other methods are ignored
    /// and malformed updates are logged and skipped.
    pub fn spawn_with_method<T: Clone + Send + Sync + 'static>(
        mut messages: mpsc::UnboundedReceiver<HubMessage>,
        cache: Arc<ProjectionCache<T>>,
        method: impl Into<String>,
    ) -> JoinHandle<()> {
        let method = method.into();
        tokio::spawn(async move {
            while let Some(message) = messages.recv().await {
                if message.method != method {
                    tracing::trace!(method = %message.method, "Ignored hub message");
                    continue;
                }

                match ProjectionUpdated::from_args(&message.args) {
                    Some(update) => cache.handle_notification(&update).await,
                    None => {
                        tracing::warn!(args = ?message.args, "Malformed projection update");
                    }
                }
            }

            tracing::debug!("Notification pump stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::cache::testing::RecordingHubClient;
    use crate::cache::{ChangeListener, MemoryFetcher, ProjectionChanged};
    use crate::brook::BrookKey;
    use crate::multiplexer::testing::fixture;
    use crate::multiplexer::{MultiplexerConfig, MultiplexerHost};

    #[tokio::test]
    async fn test_local_client_round_trip() {
        let fx = fixture();
        let host = Arc::new(MultiplexerHost::new(fx.deps.clone()));
        let hub = Arc::new(ProjectionHub::new(host, fx.hub.clone()));
        let conn = ConnectionId::new("c1");
        let _rx = fx.hub.connect(&conn);
        let client = LocalHubClient::new(hub.clone(), conn.clone());

        let id = client
            .subscribe("OrderView", "o-1", &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(hub.get_subscriptions(&conn).await.unwrap().len(), 1);

        client.unsubscribe(&id).await.unwrap();
        assert!(hub.get_subscriptions(&conn).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_pump_routes_updates() {
        let fetcher: Arc<MemoryFetcher<u32>> = Arc::new(MemoryFetcher::new());
        let cache: Arc<ProjectionCache<u32>> =
            Arc::new(ProjectionCache::new(fetcher.clone(), Arc::new(RecordingHubClient::new())));
        let (tx, rx) = mpsc::unbounded_channel();

        let (changed_tx, mut changed_rx) = mpsc::unbounded_channel();
        let listener: ChangeListener<u32> = Arc::new(move |changed: &ProjectionChanged<u32>| {
            let _ = changed_tx.send(changed.value);
        });
        let _sub = cache.subscribe("OrderView", "o-1", listener).await.unwrap();
        assert_eq!(changed_rx.recv().await, Some(None));

        let pump = NotificationPump::spawn(rx, cache.clone());

        fetcher.put("OrderView", "o-1", 8);
        tx.send(HubMessage::new("Other", vec![])).unwrap();
        tx.send(HubMessage::new(PROJECTION_UPDATED, vec![json!("OrderView")])).unwrap();
        tx.send(HubMessage::new(
            PROJECTION_UPDATED,
            ProjectionUpdated::new("OrderView", "o-1", 1).to_args(),
        ))
        .unwrap();

        let value = tokio::time::timeout(Duration::from_secs(1), changed_rx.recv())
            .await
            .unwrap();
        assert_eq!(value, Some(Some(8)));

        drop(tx);
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn test_pump_with_configured_method() {
        let fx = fixture();
        let config = MultiplexerConfig::default().notification_method("OrderChanged");
        let host = Arc::new(MultiplexerHost::with_config(fx.deps.clone(), config));
        let hub = Arc::new(ProjectionHub::new(host, fx.hub.clone()));
        let conn = ConnectionId::new("c1");
        let inbox = fx.hub.connect(&conn);

        let fetcher: Arc<MemoryFetcher<u32>> = Arc::new(MemoryFetcher::new());
        let client = Arc::new(LocalHubClient::new(hub, conn));
        let cache: Arc<ProjectionCache<u32>> =
            Arc::new(ProjectionCache::new(fetcher.clone(), client));
        let pump = NotificationPump::spawn_with_method(inbox, cache.clone(), "OrderChanged");

        let (changed_tx, mut changed_rx) = mpsc::unbounded_channel();
        let listener: ChangeListener<u32> = Arc::new(move |changed: &ProjectionChanged<u32>| {
            let _ = changed_tx.send(changed.value);
        });
        let _sub = cache.subscribe("OrderView", "o-1", listener).await.unwrap();
        assert_eq!(changed_rx.recv().await, Some(None));

        fetcher.put("OrderView", "o-1", 4);
        fx.streams.append(&BrookKey::new("orders", "o-1"));

        let value = tokio::time::timeout(Duration::from_secs(1), changed_rx.recv())
            .await
            .unwrap();
        assert_eq!(value, Some(Some(4)));
        assert_eq!(fx.hub.sent()[0].message.method, "OrderChanged");

        pump.abort();
    }
}

//! Server-side hub facade
//!
//! Client RPCs land here. The hub routes each call to the connection's
//! multiplexer and keeps the transport's group membership in step with the
//! connection's subscriptions, so a client only receives broadcasts for
//! projection instances it subscribed to.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::broadcast::GroupMembership;
use crate::error::{Error, Result};
use crate::multiplexer::{
    ConnectionId, MultiplexerHandle, MultiplexerHost, SubscriptionId, SubscriptionInfo,
};
use crate::projection::group_name;

/// Hub subscriptions per joined group, for one connection
///
/// Held across the transport's join and leave calls, so a join and a leave
/// for the same connection never interleave.
type Memberships = Arc<Mutex<HashMap<String, usize>>>;

/// Entry point for client subscription RPCs
pub struct ProjectionHub {
    host: Arc<MultiplexerHost>,
    groups: Arc<dyn GroupMembership>,
    memberships: DashMap<ConnectionId, Memberships>,
}

impl ProjectionHub {
    pub fn new(host: Arc<MultiplexerHost>, groups: Arc<dyn GroupMembership>) -> Self {
        Self {
            host,
            groups,
            memberships: DashMap::new(),
        }
    }

    pub fn host(&self) -> &Arc<MultiplexerHost> {
        &self.host
    }

    /// Subscribe `connection` to a projection instance
    pub async fn subscribe(
        &self,
        connection: &ConnectionId,
        projection_type: &str,
        entity_id: &str,
    ) -> Result<SubscriptionId> {
        let cancel = CancellationToken::new();
        self.subscribe_with_cancel(connection, projection_type, entity_id, &cancel)
            .await
    }

    /// Subscribe, giving up with [`Error::Cancelled`] once `cancel` fires
    ///
    /// The connection joins the instance's broadcast group only after the
    /// multiplexer accepted the subscription. If joining fails the
    /// subscription is rolled back.
    pub async fn subscribe_with_cancel(
        &self,
        connection: &ConnectionId,
        projection_type: &str,
        entity_id: &str,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionId> {
        let handle = self.host.get_or_activate(connection).await;
        let (handle, subscription_id) = match handle
            .subscribe_with_cancel(projection_type, entity_id, cancel)
            .await
        {
            Ok(id) => (handle, id),
            Err(Error::MultiplexerClosed(_)) => {
                // Retired between lookup and call; the host replaces it
                tracing::debug!(connection = %connection, "Multiplexer retired mid-call, retrying");
                let handle = self.host.get_or_activate(connection).await;
                let id = handle
                    .subscribe_with_cancel(projection_type, entity_id, cancel)
                    .await?;
                (handle, id)
            }
            Err(e) => return Err(e),
        };

        let group = group_name(projection_type, entity_id);
        let memberships = self.memberships_of(connection);
        let mut joined = memberships.lock().await;

        if !joined.contains_key(&group) {
            if let Err(e) = self.groups.add_to_group(connection, &group).await {
                tracing::warn!(
                    connection = %connection,
                    group = %group,
                    error = %e,
                    "Failed to join broadcast group, rolling back subscription"
                );
                if let Err(rollback) = handle.unsubscribe(&subscription_id).await {
                    tracing::debug!(connection = %connection, error = %rollback, "Rollback failed");
                }
                return Err(e.into());
            }
        }
        *joined.entry(group.clone()).or_insert(0) += 1;

        tracing::debug!(
            connection = %connection,
            subscription_id = %subscription_id,
            group = %group,
            "Client subscribed"
        );

        Ok(subscription_id)
    }

    /// Remove one subscription; unknown ids are ignored
    ///
    /// The connection leaves the broadcast group once no other hub
    /// subscription of the connection targets the same instance.
    pub async fn unsubscribe(
        &self,
        connection: &ConnectionId,
        subscription_id: &SubscriptionId,
    ) -> Result<()> {
        let Some(handle) = self.host.get(connection).await else {
            tracing::debug!(
                connection = %connection,
                subscription_id = %subscription_id,
                "Unsubscribe for inactive connection"
            );
            return Ok(());
        };

        let memberships = self.memberships_of(connection);
        let mut joined = memberships.lock().await;

        let Some(removed) = handle.unsubscribe(subscription_id).await? else {
            tracing::debug!(
                connection = %connection,
                subscription_id = %subscription_id,
                "Unsubscribe for unknown subscription"
            );
            return Ok(());
        };

        let group = group_name(&removed.projection_type, &removed.entity_id);
        let Some(count) = joined.get_mut(&group) else {
            // Subscribed directly on the multiplexer, never joined
            return Ok(());
        };
        *count -= 1;
        if *count > 0 {
            return Ok(());
        }
        joined.remove(&group);

        if let Err(e) = self.groups.remove_from_group(connection, &group).await {
            tracing::warn!(
                connection = %connection,
                group = %group,
                error = %e,
                "Failed to leave broadcast group"
            );
        }

        Ok(())
    }

    /// Drop every subscription of a connection
    ///
    /// The multiplexer stays registered until the host's next cleanup.
    pub async fn clear_all(&self, connection: &ConnectionId) -> Result<()> {
        let memberships = self.memberships_of(connection);
        let mut joined = memberships.lock().await;

        if let Some(handle) = self.host.get(connection).await {
            handle.clear_all().await?;
        }
        joined.clear();
        self.groups.remove_connection(connection).await;
        Ok(())
    }

    /// Connection closed: tear down its multiplexer and memberships
    pub async fn on_disconnected(&self, connection: &ConnectionId) {
        let memberships = self.memberships.remove(connection).map(|(_, m)| m);
        // Let joins and leaves already in flight finish first
        let _joined = match &memberships {
            Some(memberships) => Some(memberships.lock().await),
            None => None,
        };

        self.host.deactivate(connection).await;
        self.groups.remove_connection(connection).await;
        tracing::info!(connection = %connection, "Connection disconnected");
    }

    /// Current subscriptions of a connection
    pub async fn get_subscriptions(
        &self,
        connection: &ConnectionId,
    ) -> Result<Vec<SubscriptionInfo>> {
        match self.host.get(connection).await {
            Some(handle) => Ok(handle
                .get_subscriptions()
                .await?
                .iter()
                .map(SubscriptionInfo::from)
                .collect()),
            None => Ok(Vec::new()),
        }
    }

    /// Multiplexer of a connection, if active
    pub async fn multiplexer(&self, connection: &ConnectionId) -> Option<MultiplexerHandle> {
        self.host.get(connection).await
    }

    fn memberships_of(&self, connection: &ConnectionId) -> Memberships {
        Arc::clone(self.memberships.entry(connection.clone()).or_default().value())
    }
}

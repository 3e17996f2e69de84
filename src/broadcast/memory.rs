//! In-memory broadcast hub
//!
//! Connections register an unbounded receiver; group sends are copied to
//! every member's receiver. Every accepted send is also recorded so tests
//! can assert on exactly what was broadcast.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::BroadcastError;
use crate::multiplexer::ConnectionId;

use super::channel::{BroadcastChannel, GroupMembership, HubMessage};

/// A group send accepted by the hub
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub group: String,
    pub message: HubMessage,
}

/// Process-local broadcast hub
#[derive(Default)]
pub struct MemoryHub {
    connections: DashMap<ConnectionId, mpsc::UnboundedSender<HubMessage>>,
    groups: DashMap<String, HashSet<ConnectionId>>,
    failing_groups: Mutex<HashSet<String>>,
    sent: Mutex<Vec<SentMessage>>,
    failed_sends: AtomicUsize,
}

impl MemoryHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection and return its inbound message receiver
    ///
    /// Reconnecting with the same id replaces the previous receiver.
    pub fn connect(&self, connection: &ConnectionId) -> mpsc::UnboundedReceiver<HubMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.insert(connection.clone(), tx);
        tracing::debug!(connection = %connection, "Hub connection registered");
        rx
    }

    /// Drop a connection's receiver and memberships
    pub fn disconnect(&self, connection: &ConnectionId) {
        self.connections.remove(connection);
        self.drop_memberships(connection);
    }

    /// Make sends to `group` fail until cleared
    pub fn fail_group(&self, group: impl Into<String>) {
        self.failing_groups.lock().insert(group.into());
    }

    pub fn clear_failures(&self) {
        self.failing_groups.lock().clear();
    }

    /// Every accepted send, in order
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().clone()
    }

    /// Accepted sends addressed to `group`
    pub fn sent_to(&self, group: &str) -> Vec<HubMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|s| s.group == group)
            .map(|s| s.message.clone())
            .collect()
    }

    pub fn failed_sends(&self) -> usize {
        self.failed_sends.load(Ordering::Relaxed)
    }

    /// Members of `group`
    pub fn members(&self, group: &str) -> HashSet<ConnectionId> {
        self.groups
            .get(group)
            .map(|m| m.value().clone())
            .unwrap_or_default()
    }

    fn drop_memberships(&self, connection: &ConnectionId) {
        self.groups.retain(|_, members| {
            members.remove(connection);
            !members.is_empty()
        });
    }
}

#[async_trait]
impl BroadcastChannel for MemoryHub {
    async fn send_to_group(
        &self,
        group: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<(), BroadcastError> {
        if self.failing_groups.lock().contains(group) {
            self.failed_sends.fetch_add(1, Ordering::Relaxed);
            return Err(BroadcastError::SendFailed {
                group: group.to_string(),
                reason: "group send rejected".into(),
            });
        }

        let message = HubMessage::new(method, args);

        let members: Vec<ConnectionId> = self
            .groups
            .get(group)
            .map(|m| m.iter().cloned().collect())
            .unwrap_or_default();

        for member in members {
            if let Some(tx) = self.connections.get(&member) {
                // Receiver gone means the client went away; nothing to do
                let _ = tx.send(message.clone());
            }
        }

        self.sent.lock().push(SentMessage {
            group: group.to_string(),
            message,
        });
        Ok(())
    }
}

#[async_trait]
impl GroupMembership for MemoryHub {
    async fn add_to_group(
        &self,
        connection: &ConnectionId,
        group: &str,
    ) -> Result<(), BroadcastError> {
        if !self.connections.contains_key(connection) {
            return Err(BroadcastError::UnknownConnection(connection.to_string()));
        }
        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(connection.clone());
        Ok(())
    }

    async fn remove_from_group(
        &self,
        connection: &ConnectionId,
        group: &str,
    ) -> Result<(), BroadcastError> {
        let now_empty = match self.groups.get_mut(group) {
            Some(mut members) => {
                members.remove(connection);
                members.is_empty()
            }
            None => false,
        };
        if now_empty {
            self.groups.remove_if(group, |_, members| members.is_empty());
        }
        Ok(())
    }

    async fn remove_connection(&self, connection: &ConnectionId) {
        self.drop_memberships(connection);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn test_group_send_reaches_members() {
        let hub = MemoryHub::new();
        let a = ConnectionId::new("a");
        let b = ConnectionId::new("b");
        let mut rx_a = hub.connect(&a);
        let mut rx_b = hub.connect(&b);

        hub.add_to_group(&a, "g").await.unwrap();
        hub.send_to_group("g", "Ping", vec![json!(1)]).await.unwrap();

        let msg = rx_a.recv().await.unwrap();
        assert_eq!(msg.method, "Ping");
        assert_eq!(msg.args, vec![json!(1)]);
        assert!(rx_b.try_recv().is_err());
        assert_eq!(hub.sent_to("g").len(), 1);
    }

    #[tokio::test]
    async fn test_failing_group() {
        let hub = MemoryHub::new();
        hub.fail_group("g");

        let result = hub.send_to_group("g", "Ping", vec![]).await;
        assert!(matches!(result, Err(BroadcastError::SendFailed { .. })));
        assert_eq!(hub.failed_sends(), 1);
        assert!(hub.sent().is_empty());

        hub.clear_failures();
        hub.send_to_group("g", "Ping", vec![]).await.unwrap();
        assert_eq!(hub.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_membership_lifecycle() {
        let hub = MemoryHub::new();
        let a = ConnectionId::new("a");
        let _rx = hub.connect(&a);

        hub.add_to_group(&a, "g1").await.unwrap();
        hub.add_to_group(&a, "g2").await.unwrap();
        assert!(hub.members("g1").contains(&a));

        hub.remove_from_group(&a, "g1").await.unwrap();
        assert!(hub.members("g1").is_empty());
        assert!(hub.members("g2").contains(&a));

        hub.remove_connection(&a).await;
        assert!(hub.members("g2").is_empty());
    }

    #[tokio::test]
    async fn test_add_unknown_connection() {
        let hub = MemoryHub::new();
        let result = hub.add_to_group(&ConnectionId::new("ghost"), "g").await;
        assert!(matches!(result, Err(BroadcastError::UnknownConnection(_))));
    }
}

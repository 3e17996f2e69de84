//! Broadcast transport interfaces

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::BroadcastError;
use crate::multiplexer::ConnectionId;

/// A named message with positional arguments, as delivered to a client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HubMessage {
    pub method: String,
    pub args: Vec<Value>,
}

impl HubMessage {
    pub fn new(method: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            method: method.into(),
            args,
        }
    }
}

/// Sends a message to every client that joined a group
#[async_trait]
pub trait BroadcastChannel: Send + Sync {
    async fn send_to_group(
        &self,
        group: &str,
        method: &str,
        args: Vec<Value>,
    ) -> Result<(), BroadcastError>;
}

/// Group membership on the transport side
#[async_trait]
pub trait GroupMembership: Send + Sync {
    async fn add_to_group(
        &self,
        connection: &ConnectionId,
        group: &str,
    ) -> Result<(), BroadcastError>;

    async fn remove_from_group(
        &self,
        connection: &ConnectionId,
        group: &str,
    ) -> Result<(), BroadcastError>;

    /// Drop a connection from every group it joined
    async fn remove_connection(&self, connection: &ConnectionId);
}

//! External brook interfaces
//!
//! The multiplexer only talks to brooks through these traits. Any pub/sub
//! backend (log tailing, channel fan-in, message queue topic) can sit behind
//! them.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::StreamError;

use super::key::{BrookKey, Position, PositionAdvanced};

/// One-shot read of a brook's current position
#[async_trait]
pub trait BrookPositionReader: Send + Sync {
    /// Returns `Position::NOT_SET` if the brook has never been written.
    async fn read_current_position(&self, key: &BrookKey) -> Result<Position, StreamError>;
}

/// Receives events from a brook position stream
///
/// Calls must not block; implementations hand the event off and return.
pub trait PositionObserver: Send + Sync {
    fn on_position_advanced(&self, event: PositionAdvanced);

    fn on_error(&self, key: &BrookKey, error: StreamError) {
        tracing::warn!(brook = %key, error = %error, "Brook stream error");
    }

    fn on_completed(&self, key: &BrookKey) {
        tracing::debug!(brook = %key, "Brook stream completed");
    }
}

/// Stream of position-advanced events per brook
///
/// Streams deliver events in order but may skip positions and may redeliver.
#[async_trait]
pub trait BrookPositionStream: Send + Sync {
    async fn subscribe(
        &self,
        key: &BrookKey,
        observer: Arc<dyn PositionObserver>,
    ) -> Result<Box<dyn StreamSubscription>, StreamError>;
}

/// Handle to an open brook stream subscription
#[async_trait]
pub trait StreamSubscription: Send + Sync {
    /// Close the subscription. No further events are delivered afterwards.
    async fn unsubscribe(self: Box<Self>) -> Result<(), StreamError>;
}

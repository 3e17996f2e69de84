//! Brook stream bridge
//!
//! Opens and closes upstream brook stream subscriptions on behalf of one
//! multiplexer. The multiplexer only asks the bridge to open a brook when
//! it has no handle for it yet, which is what keeps upstream subscriptions
//! at one per (connection, brook) no matter how many clients share it.
//!
//! Events from the upstream stream are posted into the owning multiplexer's
//! mailbox, so they are processed in line with subscribe/unsubscribe calls.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::brook::{
    BrookKey, BrookPositionReader, BrookPositionStream, Position, PositionAdvanced,
    PositionObserver, StreamSubscription,
};
use crate::error::{Result, StreamError};

use super::actor::Command;
use super::state::ConnectionId;

pub(crate) struct BrookStreamBridge {
    connection: ConnectionId,
    reader: Arc<dyn BrookPositionReader>,
    streams: Arc<dyn BrookPositionStream>,
    // Weak so the bridge never keeps its own multiplexer alive
    mailbox: mpsc::WeakUnboundedSender<Command>,
}

impl BrookStreamBridge {
    pub fn new(
        connection: ConnectionId,
        reader: Arc<dyn BrookPositionReader>,
        streams: Arc<dyn BrookPositionStream>,
        mailbox: mpsc::WeakUnboundedSender<Command>,
    ) -> Self {
        Self {
            connection,
            reader,
            streams,
            mailbox,
        }
    }

    /// Read the brook's current position, then subscribe to its stream
    ///
    /// The read happens first so no advance between the two calls is lost:
    /// anything the stream delivers is at least as new as the snapshot.
    pub async fn open(&self, key: &BrookKey) -> Result<(Position, Box<dyn StreamSubscription>)> {
        let position = self.reader.read_current_position(key).await?;

        let observer = Arc::new(MailboxObserver {
            connection: self.connection.clone(),
            mailbox: self.mailbox.clone(),
        });
        let handle = self.streams.subscribe(key, observer).await?;

        tracing::info!(
            connection = %self.connection,
            brook = %key,
            position = %position,
            "Brook stream opened"
        );

        Ok((position, handle))
    }

    /// Close an upstream subscription
    ///
    /// Failures are logged and swallowed.
    pub async fn close(&self, key: &BrookKey, handle: Box<dyn StreamSubscription>) {
        match handle.unsubscribe().await {
            Ok(()) => {
                tracing::info!(connection = %self.connection, brook = %key, "Brook stream closed");
            }
            Err(e) => {
                tracing::warn!(
                    connection = %self.connection,
                    brook = %key,
                    error = %e,
                    "Failed to close brook stream"
                );
            }
        }
    }
}

/// Posts stream events into a multiplexer mailbox
struct MailboxObserver {
    connection: ConnectionId,
    mailbox: mpsc::WeakUnboundedSender<Command>,
}

impl PositionObserver for MailboxObserver {
    fn on_position_advanced(&self, event: PositionAdvanced) {
        let Some(mailbox) = self.mailbox.upgrade() else {
            tracing::trace!(
                connection = %self.connection,
                brook = %event.brook_key,
                "Position event for retired multiplexer"
            );
            return;
        };
        let _ = mailbox.send(Command::PositionAdvanced(event));
    }

    fn on_error(&self, key: &BrookKey, error: StreamError) {
        tracing::warn!(
            connection = %self.connection,
            brook = %key,
            error = %error,
            "Brook stream error"
        );
    }

    fn on_completed(&self, key: &BrookKey) {
        tracing::debug!(connection = %self.connection, brook = %key, "Brook stream completed");
    }
}

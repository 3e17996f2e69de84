//! Error types
//!
//! `Error` is the crate-wide error. Collaborator failures have their own
//! types so implementations of the external traits don't need to know about
//! the rest of the crate.

use thiserror::Error;

use crate::multiplexer::ConnectionId;

/// Result alias for crate operations
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type
#[derive(Debug, Error)]
pub enum Error {
    /// The projection type has no brook registered for it
    #[error("Projection type not registered: {0}")]
    UnregisteredProjection(String),

    /// The operation was cancelled before it completed
    #[error("Operation cancelled")]
    Cancelled,

    /// The multiplexer task for this connection is gone
    #[error("Multiplexer for connection {0} is not running")]
    MultiplexerClosed(ConnectionId),

    /// Brook stream or position reader failure
    #[error("Brook stream error: {0}")]
    Stream(#[from] StreamError),

    /// Broadcast or group membership failure
    #[error("Broadcast error: {0}")]
    Broadcast(#[from] BroadcastError),

    /// Projection fetch failure
    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Client-side hub transport failure
    #[error("Hub error: {0}")]
    Hub(String),
}

impl Error {
    /// Whether this error is a cancellation rather than a failure
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Errors raised by brook position readers and streams
#[derive(Debug, Clone, Error)]
pub enum StreamError {
    #[error("Brook unavailable: {0}")]
    Unavailable(String),

    #[error("Subscription already closed")]
    AlreadyClosed,

    #[error("{0}")]
    Other(String),
}

/// Errors raised by the broadcast transport
#[derive(Debug, Clone, Error)]
pub enum BroadcastError {
    #[error("Send to group {group} failed: {reason}")]
    SendFailed { group: String, reason: String },

    #[error("Unknown connection: {0}")]
    UnknownConnection(String),
}

/// Errors raised by projection fetchers
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("Fetch of {projection_type}/{entity_id} failed: {reason}")]
    Failed {
        projection_type: String,
        entity_id: String,
        reason: String,
    },

    #[error("Fetch transport error: {0}")]
    Transport(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::UnregisteredProjection("OrderView".into());
        assert_eq!(err.to_string(), "Projection type not registered: OrderView");

        let err: Error = StreamError::Unavailable("orders".into()).into();
        assert_eq!(err.to_string(), "Brook stream error: Brook unavailable: orders");
    }

    #[test]
    fn test_cancelled_is_distinct() {
        assert!(Error::Cancelled.is_cancelled());
        assert!(!Error::Hub("down".into()).is_cancelled());
    }
}

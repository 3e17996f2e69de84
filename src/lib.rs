//! Projection change notifications over brook streams
//!
//! Two halves:
//!
//! - Server side: a [`multiplexer`] per client connection turns projection
//!   subscriptions into at most one upstream brook stream per brook, filters
//!   stale positions and fans each advance out as a `ProjectionUpdated`
//!   broadcast to the `projection:{type}:{id}` group of every subscription.
//!   [`hub::ProjectionHub`] is the RPC facade in front of the multiplexers.
//! - Client side: a [`cache::ProjectionCache`] shares one live handle per
//!   projection instance between local subscribers, re-fetches on pushed
//!   updates and bounds memory with LRU eviction that skips pinned entries.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use brookcast::brook::MemoryBrookStreams;
//! use brookcast::broadcast::MemoryHub;
//! use brookcast::hub::ProjectionHub;
//! use brookcast::multiplexer::{ConnectionId, MultiplexerDeps, MultiplexerHost};
//! use brookcast::projection::StaticProjectionRegistry;
//!
//! # async fn run() -> brookcast::Result<()> {
//! let streams = MemoryBrookStreams::new();
//! let transport = Arc::new(MemoryHub::new());
//! let deps = MultiplexerDeps {
//!     registry: Arc::new(StaticProjectionRegistry::new().with("OrderView", "orders")),
//!     reader: Arc::new(streams.clone()),
//!     streams: Arc::new(streams.clone()),
//!     broadcast: transport.clone(),
//! };
//!
//! let hub = ProjectionHub::new(Arc::new(MultiplexerHost::new(deps)), transport.clone());
//! let conn = ConnectionId::new("c1");
//! let _inbox = transport.connect(&conn);
//! hub.subscribe(&conn, "OrderView", "o-1").await?;
//! # Ok(())
//! # }
//! ```

pub mod broadcast;
pub mod brook;
pub mod cache;
pub mod error;
pub mod hub;
pub mod multiplexer;
pub mod projection;
pub mod stats;

pub use cache::{CacheConfig, ProjectionBinder, ProjectionCache};
pub use error::{Error, Result};
pub use hub::{LocalHubClient, ProjectionHub, ProjectionHubClient};
pub use multiplexer::{
    ConnectionId, MultiplexerConfig, MultiplexerHandle, MultiplexerHost, SubscriptionId,
};
pub use projection::{ProjectionKey, ProjectionUpdated};

//! Per-connection subscription multiplexer
//!
//! Each connection gets one multiplexer. It turns client subscriptions to
//! projection instances into brook stream subscriptions, opening at most one
//! upstream stream per brook, and turns brook position advances back into
//! `ProjectionUpdated` broadcasts for every subscription on that brook.
//!
//! # Architecture
//!
//! ```text
//!                        Arc<MultiplexerHost>
//!                  ┌──────────────────────────────┐
//!                  │ connections: HashMap<        │
//!                  │   ConnectionId,              │
//!                  │   MultiplexerHandle ─────────┼──► mailbox
//!                  │ >                            │       │
//!                  └──────────────────────────────┘       ▼
//!                                              ┌────────────────────┐
//!      client RPC ── subscribe/unsubscribe ──► │  MultiplexerActor  │
//!      brook stream ── PositionAdvanced ─────► │  (single writer)   │
//!                                              └─────────┬──────────┘
//!                                                        │
//!                                 send_to_group("projection:{type}:{id}")
//! ```
//!
//! Position events are filtered per brook: only strictly newer positions
//! produce broadcasts, so redelivered or out-of-order events are dropped.

pub mod actor;
pub mod bridge;
pub mod config;
pub mod handle;
pub mod host;
pub mod state;

pub use actor::MultiplexerDeps;
pub use config::MultiplexerConfig;
pub use handle::MultiplexerHandle;
pub use host::MultiplexerHost;
pub use state::{ConnectionId, Subscription, SubscriptionId, SubscriptionInfo};

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use crate::brook::MemoryBrookStreams;
    use crate::broadcast::MemoryHub;
    use crate::projection::{ProjectionRegistry, StaticProjectionRegistry};

    use super::MultiplexerDeps;

    pub(crate) struct Fixture {
        pub streams: MemoryBrookStreams,
        pub hub: Arc<MemoryHub>,
        pub deps: MultiplexerDeps,
    }

    /// OrderView and OrderSummary both read the "orders" brook; CartView
    /// reads "carts".
    pub(crate) fn fixture() -> Fixture {
        let registry = StaticProjectionRegistry::new()
            .with("OrderView", "orders")
            .with("OrderSummary", "orders")
            .with("CartView", "carts");
        let streams = MemoryBrookStreams::new();
        let hub = Arc::new(MemoryHub::new());

        let deps = MultiplexerDeps {
            registry: Arc::new(registry),
            reader: Arc::new(streams.clone()),
            streams: Arc::new(streams.clone()),
            broadcast: hub.clone(),
        };

        Fixture { streams, hub, deps }
    }

    /// Registry whose lookups park until released; resolves to "orders"
    pub(crate) struct GatedRegistry {
        pub release: Arc<Notify>,
    }

    impl GatedRegistry {
        pub fn new() -> Self {
            Self {
                release: Arc::new(Notify::new()),
            }
        }
    }

    #[async_trait]
    impl ProjectionRegistry for GatedRegistry {
        async fn try_resolve_brook(&self, _projection_type: &str) -> Option<String> {
            self.release.notified().await;
            Some("orders".into())
        }
    }
}

//! Client projection cache
//!
//! The client side of projection updates. Local consumers subscribe to
//! projection instances through [`ProjectionCache`]; each cached instance is
//! backed by one [`Ripple`] that holds the value, keeps a server
//! subscription open and re-fetches when the server pushes a newer version.
//!
//! ```text
//!   consumer ──subscribe──► ProjectionCache ──► CacheEntry ──► Ripple
//!                                 ▲                              │  ▲
//!                  handle_notification                   fetch   │  │ Subscribe RPC
//!                                 │                              ▼  │
//!                         NotificationPump ◄── hub messages   fetcher / hub client
//! ```

pub mod binder;
pub mod config;
pub mod entry;
pub mod fetch;
pub mod ripple;
pub mod store;
pub mod subscription;

pub use binder::ProjectionBinder;
pub use config::CacheConfig;
pub use entry::CacheEntry;
pub use fetch::{MemoryFetcher, ProjectionFetcher};
pub use ripple::{ChangeListener, ListenerId, ProjectionChanged, Ripple};
pub use store::ProjectionCache;
pub use subscription::ProjectionSubscription;

//! Hub: the RPC surface between clients and their multiplexers
//!
//! [`ProjectionHub`] is the server-side facade; [`ProjectionHubClient`] is
//! how a client reaches it. [`LocalHubClient`] wires the two together in
//! process.

pub mod client;
pub mod server;

pub use client::{LocalHubClient, NotificationPump, ProjectionHubClient};
pub use server::ProjectionHub;

//! Projections: identity, registry lookup and update notifications

pub mod notification;
pub mod registry;

pub use notification::{group_name, ProjectionKey, ProjectionUpdated, PROJECTION_UPDATED};
pub use registry::{ProjectionRegistry, StaticProjectionRegistry};

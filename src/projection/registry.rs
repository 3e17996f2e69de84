//! Projection registry
//!
//! Maps a projection's logical type name to the brook that feeds it.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

/// Resolves projection types to brook names
#[async_trait]
pub trait ProjectionRegistry: Send + Sync {
    /// `None` if the projection type is not registered
    async fn try_resolve_brook(&self, projection_type: &str) -> Option<String>;
}

/// Registry backed by a fixed table
#[derive(Debug, Default)]
pub struct StaticProjectionRegistry {
    brooks: RwLock<HashMap<String, String>>,
}

impl StaticProjectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a projection type, chaining
    pub fn with(self, projection_type: impl Into<String>, brook_name: impl Into<String>) -> Self {
        self.register(projection_type, brook_name);
        self
    }

    /// Register (or re-point) a projection type
    pub fn register(&self, projection_type: impl Into<String>, brook_name: impl Into<String>) {
        self.brooks
            .write()
            .insert(projection_type.into(), brook_name.into());
    }

    pub fn len(&self) -> usize {
        self.brooks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.brooks.read().is_empty()
    }
}

#[async_trait]
impl ProjectionRegistry for StaticProjectionRegistry {
    async fn try_resolve_brook(&self, projection_type: &str) -> Option<String> {
        self.brooks.read().get(projection_type).cloned()
    }
}

//! Projection fetching

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::FetchError;
use crate::projection::ProjectionKey;

/// Loads the current value of a projection instance
#[async_trait]
pub trait ProjectionFetcher<T>: Send + Sync {
    /// `Ok(None)` if the instance has no data yet
    async fn fetch(&self, projection_type: &str, entity_id: &str) -> Result<Option<T>, FetchError>;
}

/// Fetcher serving values from memory
///
/// Counts fetches and can be told to fail, for tests and demos.
pub struct MemoryFetcher<T> {
    values: DashMap<ProjectionKey, T>,
    fetches: AtomicUsize,
    failing: AtomicBool,
}

impl<T: Clone> MemoryFetcher<T> {
    pub fn new() -> Self {
        Self {
            values: DashMap::new(),
            fetches: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    /// Set the value later fetches return
    pub fn put(&self, projection_type: &str, entity_id: &str, value: T) {
        self.values.insert(ProjectionKey::new(projection_type, entity_id), value);
    }

    /// Make every fetch fail until reset
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }

    /// Number of fetch calls so far
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

impl<T: Clone> Default for MemoryFetcher<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Clone + Send + Sync> ProjectionFetcher<T> for MemoryFetcher<T> {
    async fn fetch(&self, projection_type: &str, entity_id: &str) -> Result<Option<T>, FetchError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);

        if self.failing.load(Ordering::Relaxed) {
            return Err(FetchError::Failed {
                projection_type: projection_type.to_string(),
                entity_id: entity_id.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        let key = ProjectionKey::new(projection_type, entity_id);
        Ok(self.values.get(&key).map(|value| value.value().clone()))
    }
}

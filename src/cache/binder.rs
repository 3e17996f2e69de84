//! Binder
//!
//! Holds at most one cache subscription for a consumer that shows one
//! projection instance at a time and switches between entity ids.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::error::Result;

use super::ripple::ChangeListener;
use super::store::ProjectionCache;
use super::subscription::ProjectionSubscription;

/// Binds a consumer to one projection instance of a fixed type
pub struct ProjectionBinder<T> {
    cache: Arc<ProjectionCache<T>>,
    projection_type: String,
    bound: Option<Bound<T>>,
}

struct Bound<T> {
    entity_id: String,
    subscription: ProjectionSubscription<T>,
}

impl<T: Clone + Send + Sync + 'static> ProjectionBinder<T> {
    pub fn new(cache: Arc<ProjectionCache<T>>, projection_type: impl Into<String>) -> Self {
        Self {
            cache,
            projection_type: projection_type.into(),
            bound: None,
        }
    }

    pub fn projection_type(&self) -> &str {
        &self.projection_type
    }

    /// Bind to `entity_id`
    ///
    /// No-op if already bound to it. Otherwise the previous subscription is
    /// released before subscribing to the new instance.
    pub async fn bind(&mut self, entity_id: &str, on_changed: ChangeListener<T>) -> Result<()> {
        self.bind_with_cancel(entity_id, on_changed, &CancellationToken::new())
            .await
    }

    /// Bind, giving up once `cancel` fires
    ///
    /// On failure the binder is left unbound.
    pub async fn bind_with_cancel(
        &mut self,
        entity_id: &str,
        on_changed: ChangeListener<T>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if self.entity_id() == Some(entity_id) {
            return Ok(());
        }

        self.unbind();

        let subscription = self
            .cache
            .subscribe_with_cancel(&self.projection_type, entity_id, on_changed, cancel)
            .await?;

        tracing::debug!(
            projection_type = %self.projection_type,
            entity_id = %entity_id,
            "Binder bound"
        );

        self.bound = Some(Bound {
            entity_id: entity_id.to_string(),
            subscription,
        });
        Ok(())
    }

    /// Release the current subscription, if any
    pub fn unbind(&mut self) {
        if let Some(bound) = self.bound.take() {
            bound.subscription.dispose();
            tracing::debug!(
                projection_type = %self.projection_type,
                entity_id = %bound.entity_id,
                "Binder unbound"
            );
        }
    }

    /// Entity id currently bound
    pub fn entity_id(&self) -> Option<&str> {
        self.bound.as_ref().map(|bound| bound.entity_id.as_str())
    }

    /// Current value of the bound instance
    pub fn current(&self) -> Option<T> {
        self.bound
            .as_ref()
            .and_then(|bound| bound.subscription.current())
    }

    pub fn is_bound(&self) -> bool {
        self.bound.is_some()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::cache::testing::RecordingHubClient;
    use crate::cache::{MemoryFetcher, ProjectionChanged};

    fn setup() -> (Arc<MemoryFetcher<u32>>, Arc<RecordingHubClient>, Arc<ProjectionCache<u32>>) {
        let fetcher: Arc<MemoryFetcher<u32>> = Arc::new(MemoryFetcher::new());
        let hub = Arc::new(RecordingHubClient::new());
        let cache: Arc<ProjectionCache<u32>> =
            Arc::new(ProjectionCache::new(fetcher.clone(), hub.clone()));
        (fetcher, hub, cache)
    }

    fn noop() -> ChangeListener<u32> {
        Arc::new(|_: &ProjectionChanged<u32>| {})
    }

    #[tokio::test]
    async fn test_rebind_same_id_is_noop() {
        let (fetcher, hub, cache) = setup();
        let mut binder = ProjectionBinder::new(cache.clone(), "OrderView");

        binder.bind("o-1", noop()).await.unwrap();
        binder.bind("o-1", noop()).await.unwrap();

        assert_eq!(cache.subscriber_count("OrderView", "o-1"), Some(1));
        assert_eq!(fetcher.fetches(), 1);
        assert_eq!(hub.subscribes(), 1);
    }

    #[tokio::test]
    async fn test_bind_switches_entity() {
        let (fetcher, _hub, cache) = setup();
        fetcher.put("OrderView", "o-1", 1);
        fetcher.put("OrderView", "o-2", 2);
        let mut binder = ProjectionBinder::new(cache.clone(), "OrderView");

        binder.bind("o-1", noop()).await.unwrap();
        assert_eq!(binder.current(), Some(1));

        binder.bind("o-2", noop()).await.unwrap();
        assert_eq!(binder.entity_id(), Some("o-2"));
        assert_eq!(binder.current(), Some(2));
        assert_eq!(cache.subscriber_count("OrderView", "o-1"), Some(0));
        assert_eq!(cache.subscriber_count("OrderView", "o-2"), Some(1));
    }

    #[tokio::test]
    async fn test_unbind_and_drop_release() {
        let (_fetcher, _hub, cache) = setup();
        let mut binder = ProjectionBinder::new(cache.clone(), "OrderView");

        binder.bind("o-1", noop()).await.unwrap();
        binder.unbind();
        assert!(!binder.is_bound());
        assert_eq!(binder.current(), None);
        assert_eq!(cache.subscriber_count("OrderView", "o-1"), Some(0));

        binder.bind("o-1", noop()).await.unwrap();
        drop(binder);
        assert_eq!(cache.subscriber_count("OrderView", "o-1"), Some(0));
    }

    #[tokio::test]
    async fn test_failed_bind_leaves_unbound() {
        let (fetcher, _hub, cache) = setup();
        let mut binder = ProjectionBinder::new(cache.clone(), "OrderView");
        binder.bind("o-1", noop()).await.unwrap();

        fetcher.fail(true);
        assert!(binder.bind("o-2", noop()).await.is_err());

        assert!(!binder.is_bound());
        assert_eq!(cache.subscriber_count("OrderView", "o-1"), Some(0));
    }

    #[tokio::test]
    async fn test_listener_receives_changes() {
        let (fetcher, _hub, cache) = setup();
        fetcher.put("OrderView", "o-1", 1);
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        let mut binder = ProjectionBinder::new(cache.clone(), "OrderView");

        binder
            .bind(
                "o-1",
                Arc::new(move |changed: &ProjectionChanged<u32>| {
                    counter.store(changed.value.unwrap_or(0) as usize, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}

//! Live projection handle
//!
//! A [`Ripple`] holds the current value of one projection instance and
//! tells its listeners whenever the value is re-fetched. It keeps one
//! server-side subscription open so update notifications for the instance
//! reach this client.
//!
//! Lifecycle:
//!
//! ```text
//!   activate ──► Subscribe RPC ──► fetch ──► loaded
//!                                             │
//!   on_server_update(v) ──(v newer)──► fetch ─┤──► listeners
//!   resubscribe ──► Subscribe RPC ──► fetch ──┘
//!   dispose ──► Unsubscribe RPC, listeners dropped
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::hub::ProjectionHubClient;
use crate::multiplexer::SubscriptionId;
use crate::projection::ProjectionKey;

use super::fetch::ProjectionFetcher;

/// Value delivered to change listeners
#[derive(Debug, Clone)]
pub struct ProjectionChanged<T> {
    pub key: ProjectionKey,
    /// Fetched value, `None` if the instance has no data
    pub value: Option<T>,
    /// Newest version notified before the fetch, `None` for the initial load
    pub version: Option<u64>,
}

/// Callback invoked after every successful fetch
pub type ChangeListener<T> = Arc<dyn Fn(&ProjectionChanged<T>) + Send + Sync>;

/// Identifies a registered listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Live data handle for one projection instance
pub struct Ripple<T> {
    key: ProjectionKey,
    fetcher: Arc<dyn ProjectionFetcher<T>>,
    hub: Arc<dyn ProjectionHubClient>,

    value: RwLock<Option<T>>,
    loaded: AtomicBool,
    last_version: Mutex<Option<u64>>,

    listeners: Mutex<Vec<(ListenerId, ChangeListener<T>)>>,
    next_listener: AtomicU64,

    /// Server-side subscription backing this handle
    server_subscription: tokio::sync::Mutex<Option<SubscriptionId>>,

    /// Serializes fetches so values are applied in request order
    fetch_lock: tokio::sync::Mutex<()>,

    disposed: AtomicBool,
}

impl<T> Ripple<T> {
    pub fn key(&self) -> &ProjectionKey {
        &self.key
    }

    /// Whether the initial fetch has completed
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Newest version the server notified about
    pub fn last_version(&self) -> Option<u64> {
        *self.last_version.lock()
    }

    pub fn add_listener(&self, listener: ChangeListener<T>) -> ListenerId {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        self.listeners.lock().push((id, listener));
        id
    }

    /// Returns false if the listener was not registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(listener_id, _)| *listener_id != id);
        listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

impl<T: Clone + Send + Sync + 'static> Ripple<T> {
    pub fn new(
        key: ProjectionKey,
        fetcher: Arc<dyn ProjectionFetcher<T>>,
        hub: Arc<dyn ProjectionHubClient>,
    ) -> Self {
        Self {
            key,
            fetcher,
            hub,
            value: RwLock::new(None),
            loaded: AtomicBool::new(false),
            last_version: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(0),
            server_subscription: tokio::sync::Mutex::new(None),
            fetch_lock: tokio::sync::Mutex::new(()),
            disposed: AtomicBool::new(false),
        }
    }

    /// Current value, `None` until loaded or if the instance has no data
    pub fn current(&self) -> Option<T> {
        self.value.read().clone()
    }

    /// Subscribe on the server and load the initial value
    ///
    /// No-op once loaded. The server subscription is taken before the fetch
    /// so an update landing in between still triggers a re-fetch.
    pub async fn activate(&self, cancel: &CancellationToken) -> Result<()> {
        if self.is_loaded() {
            return Ok(());
        }

        let _fetching = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            guard = self.fetch_lock.lock() => guard,
        };

        // Another subscriber finished activation while we waited
        if self.is_loaded() {
            return Ok(());
        }

        self.ensure_server_subscription(cancel).await?;
        self.fetch_locked(cancel).await
    }

    /// Force a re-fetch
    pub async fn refresh(&self, cancel: &CancellationToken) -> Result<()> {
        let _fetching = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            guard = self.fetch_lock.lock() => guard,
        };
        self.fetch_locked(cancel).await
    }

    /// Handle a pushed update notification
    ///
    /// Several connections can push the same version, so versions not newer
    /// than the last one seen are ignored. Returns whether a re-fetch ran.
    pub async fn on_server_update(&self, version: u64) -> Result<bool> {
        if self.is_disposed() {
            return Ok(false);
        }

        let previous = {
            let mut last = self.last_version.lock();
            if last.map_or(false, |seen| version <= seen) {
                tracing::trace!(
                    projection = %self.key,
                    version = version,
                    "Ignored duplicate update"
                );
                return Ok(false);
            }
            last.replace(version)
        };

        if let Err(e) = self.refresh(&CancellationToken::new()).await {
            // Not applied, so a redelivery of this version must still refetch
            let mut last = self.last_version.lock();
            if *last == Some(version) {
                *last = previous;
            }
            return Err(e);
        }
        Ok(true)
    }

    /// Re-establish the server subscription after a reconnect, then refresh
    ///
    /// The previous server-side subscription is assumed gone with the old
    /// transport, so it is replaced rather than unsubscribed.
    pub async fn resubscribe(&self, cancel: &CancellationToken) -> Result<()> {
        if self.is_disposed() {
            return Ok(());
        }
        {
            let mut server = self.server_subscription.lock().await;
            let subscription_id = self.subscribe_on_server(cancel).await?;
            *server = Some(subscription_id);
        }
        self.refresh(cancel).await
    }

    /// Release the server subscription and drop all listeners
    ///
    /// Idempotent.
    pub async fn dispose(&self) -> Result<()> {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        self.listeners.lock().clear();

        let subscription_id = self.server_subscription.lock().await.take();
        if let Some(subscription_id) = subscription_id {
            self.hub.unsubscribe(&subscription_id).await?;
        }

        tracing::debug!(projection = %self.key, "Ripple disposed");
        Ok(())
    }

    async fn ensure_server_subscription(&self, cancel: &CancellationToken) -> Result<()> {
        let mut server = self.server_subscription.lock().await;
        if server.is_none() {
            *server = Some(self.subscribe_on_server(cancel).await?);
        }
        Ok(())
    }

    async fn subscribe_on_server(&self, cancel: &CancellationToken) -> Result<SubscriptionId> {
        self.hub
            .subscribe(&self.key.projection_type, &self.key.entity_id, cancel)
            .await
    }

    /// Fetch and publish; caller holds `fetch_lock`
    async fn fetch_locked(&self, cancel: &CancellationToken) -> Result<()> {
        let version = self.last_version();

        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            fetched = self.fetcher.fetch(&self.key.projection_type, &self.key.entity_id) => {
                fetched?
            }
        };

        if self.is_disposed() {
            return Ok(());
        }

        *self.value.write() = fetched.clone();
        self.loaded.store(true, Ordering::Release);

        tracing::debug!(
            projection = %self.key,
            version = ?version,
            has_value = fetched.is_some(),
            "Projection fetched"
        );

        let changed = ProjectionChanged {
            key: self.key.clone(),
            value: fetched,
            version,
        };

        // Invoke outside the lock so listeners may add or remove listeners
        let listeners: Vec<ChangeListener<T>> = self
            .listeners
            .lock()
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(&changed);
        }

        Ok(())
    }
}

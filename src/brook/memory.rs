//! In-memory brook backend
//!
//! Implements both [`BrookPositionReader`] and [`BrookPositionStream`] over
//! process-local maps. Used by tests and the demo, and as a reference for
//! real backends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::StreamError;

use super::key::{BrookKey, Position, PositionAdvanced};
use super::stream::{BrookPositionReader, BrookPositionStream, PositionObserver, StreamSubscription};

type ObserverList = Vec<(u64, Arc<dyn PositionObserver>)>;

struct Inner {
    positions: DashMap<BrookKey, Position>,
    observers: Mutex<HashMap<BrookKey, ObserverList>>,
    next_observer_id: AtomicU64,
    subscribe_calls: AtomicUsize,
    unsubscribe_calls: AtomicUsize,
    fail_unsubscribe: AtomicBool,
}

/// Process-local brook positions and position streams
#[derive(Clone)]
pub struct MemoryBrookStreams {
    inner: Arc<Inner>,
}

impl MemoryBrookStreams {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                positions: DashMap::new(),
                observers: Mutex::new(HashMap::new()),
                next_observer_id: AtomicU64::new(1),
                subscribe_calls: AtomicUsize::new(0),
                unsubscribe_calls: AtomicUsize::new(0),
                fail_unsubscribe: AtomicBool::new(false),
            }),
        }
    }

    /// Append one event to a brook and notify its observers
    ///
    /// Returns the new position (0 for the first event).
    pub fn append(&self, key: &BrookKey) -> Position {
        let position = {
            let mut entry = self
                .inner
                .positions
                .entry(key.clone())
                .or_insert(Position::NOT_SET);
            let next = entry.value().value().map_or(0, |v| v + 1);
            *entry = Position::new(next);
            *entry
        };

        self.deliver(key, position);
        position
    }

    /// Set the stored position without notifying anyone
    pub fn set_position(&self, key: &BrookKey, position: Position) {
        self.inner.positions.insert(key.clone(), position);
    }

    /// Deliver a raw event to every observer of `key`
    ///
    /// Does not touch the stored position, so this can replay duplicates
    /// and regressions the way a redelivering stream would.
    pub fn deliver(&self, key: &BrookKey, position: Position) {
        let observers: Vec<Arc<dyn PositionObserver>> = self
            .inner
            .observers
            .lock()
            .get(key)
            .map(|list| list.iter().map(|(_, o)| Arc::clone(o)).collect())
            .unwrap_or_default();

        for observer in observers {
            observer.on_position_advanced(PositionAdvanced::new(key.clone(), position));
        }
    }

    /// Make every subsequent unsubscribe fail (the observer stays attached)
    pub fn fail_unsubscribe(&self, fail: bool) {
        self.inner.fail_unsubscribe.store(fail, Ordering::Relaxed);
    }

    /// Number of open subscriptions on `key`
    pub fn open_subscriptions(&self, key: &BrookKey) -> usize {
        self.inner.observers.lock().get(key).map_or(0, Vec::len)
    }

    /// Total number of subscribe calls served
    pub fn subscribe_calls(&self) -> usize {
        self.inner.subscribe_calls.load(Ordering::Relaxed)
    }

    /// Total number of unsubscribe calls received, failed ones included
    pub fn unsubscribe_calls(&self) -> usize {
        self.inner.unsubscribe_calls.load(Ordering::Relaxed)
    }
}

impl Default for MemoryBrookStreams {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrookPositionReader for MemoryBrookStreams {
    async fn read_current_position(&self, key: &BrookKey) -> Result<Position, StreamError> {
        Ok(self
            .inner
            .positions
            .get(key)
            .map(|p| *p.value())
            .unwrap_or(Position::NOT_SET))
    }
}

#[async_trait]
impl BrookPositionStream for MemoryBrookStreams {
    async fn subscribe(
        &self,
        key: &BrookKey,
        observer: Arc<dyn PositionObserver>,
    ) -> Result<Box<dyn StreamSubscription>, StreamError> {
        let id = self.inner.next_observer_id.fetch_add(1, Ordering::Relaxed);
        self.inner
            .observers
            .lock()
            .entry(key.clone())
            .or_default()
            .push((id, observer));
        self.inner.subscribe_calls.fetch_add(1, Ordering::Relaxed);

        Ok(Box::new(MemoryStreamSubscription {
            inner: Arc::clone(&self.inner),
            key: key.clone(),
            id,
        }))
    }
}

struct MemoryStreamSubscription {
    inner: Arc<Inner>,
    key: BrookKey,
    id: u64,
}

#[async_trait]
impl StreamSubscription for MemoryStreamSubscription {
    async fn unsubscribe(self: Box<Self>) -> Result<(), StreamError> {
        self.inner.unsubscribe_calls.fetch_add(1, Ordering::Relaxed);

        if self.inner.fail_unsubscribe.load(Ordering::Relaxed) {
            return Err(StreamError::Unavailable(self.key.to_string()));
        }

        let mut observers = self.inner.observers.lock();
        if let Some(list) = observers.get_mut(&self.key) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                observers.remove(&self.key);
            }
        }
        Ok(())
    }
}

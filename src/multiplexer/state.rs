//! Per-connection subscription state
//!
//! Owned by exactly one multiplexer task, so none of these maps need locks.
//! Two invariants hold after every public method returns:
//!
//! - a brook has an open stream handle iff it has at least one subscriber
//! - every subscriber id listed under a brook has a matching subscription

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::brook::{BrookKey, Position, StreamSubscription};

/// Identifies one client connection
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Opaque server-side subscription identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(String);

impl SubscriptionId {
    /// Generate a fresh random id
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A logical subscription held by a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub subscription_id: SubscriptionId,
    pub projection_type: String,
    pub entity_id: String,
    pub brook_key: BrookKey,
}

/// Client-facing view of a subscription (no brook internals)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionInfo {
    pub subscription_id: SubscriptionId,
    pub projection_type: String,
    pub entity_id: String,
}

impl From<&Subscription> for SubscriptionInfo {
    fn from(sub: &Subscription) -> Self {
        Self {
            subscription_id: sub.subscription_id.clone(),
            projection_type: sub.projection_type.clone(),
            entity_id: sub.entity_id.clone(),
        }
    }
}

/// Outcome of offering a new position for a brook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Advance {
    /// Nobody on this connection watches the brook
    Unwatched,
    /// Not strictly newer than the last position we notified about
    Stale { current: Position },
    /// Recorded; subscribers should be notified
    Accepted,
}

/// A removed subscription, plus the stream to close if it was the last one
pub(crate) struct Removed {
    pub subscription: Subscription,
    pub closed_stream: Option<(BrookKey, Box<dyn StreamSubscription>)>,
}

#[derive(Default)]
pub(crate) struct ConnectionSubscriptionState {
    subscriptions: HashMap<SubscriptionId, Subscription>,
    brook_to_subscription_ids: HashMap<BrookKey, HashSet<SubscriptionId>>,
    brook_stream_handles: HashMap<BrookKey, Box<dyn StreamSubscription>>,
    brook_positions: HashMap<BrookKey, Position>,
}

impl ConnectionSubscriptionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a stream is already open for `key`
    pub fn is_watching(&self, key: &BrookKey) -> bool {
        self.brook_stream_handles.contains_key(key)
    }

    /// Insert a subscription
    ///
    /// `opened` must carry the initial position and stream handle exactly
    /// when this is the first subscriber for the brook.
    pub fn add(
        &mut self,
        subscription: Subscription,
        opened: Option<(Position, Box<dyn StreamSubscription>)>,
    ) {
        let key = subscription.brook_key.clone();
        debug_assert_eq!(opened.is_some(), !self.is_watching(&key));

        if let Some((position, handle)) = opened {
            self.brook_positions.insert(key.clone(), position);
            self.brook_stream_handles.insert(key.clone(), handle);
        }

        self.brook_to_subscription_ids
            .entry(key)
            .or_default()
            .insert(subscription.subscription_id.clone());
        self.subscriptions
            .insert(subscription.subscription_id.clone(), subscription);
    }

    /// Remove a subscription, returning `None` for unknown ids
    pub fn remove(&mut self, id: &SubscriptionId) -> Option<Removed> {
        let subscription = self.subscriptions.remove(id)?;
        let key = &subscription.brook_key;

        let now_empty = match self.brook_to_subscription_ids.get_mut(key) {
            Some(ids) => {
                ids.remove(id);
                ids.is_empty()
            }
            None => true,
        };

        let closed_stream = if now_empty {
            self.brook_to_subscription_ids.remove(key);
            self.brook_positions.remove(key);
            self.brook_stream_handles
                .remove(key)
                .map(|handle| (key.clone(), handle))
        } else {
            None
        };

        Some(Removed {
            subscription,
            closed_stream,
        })
    }

    /// Offer a new position for `key`
    pub fn advance(&mut self, key: &BrookKey, position: Position) -> Advance {
        if !self.is_watching(key) {
            return Advance::Unwatched;
        }

        let current = self
            .brook_positions
            .get(key)
            .copied()
            .unwrap_or(Position::NOT_SET);

        // NOT_SET is never newer, and any set position beats NOT_SET
        if !position.is_newer_than(&current) {
            return Advance::Stale { current };
        }

        self.brook_positions.insert(key.clone(), position);
        Advance::Accepted
    }

    /// Subscriptions currently registered under `key`
    pub fn subscribers_of(&self, key: &BrookKey) -> Vec<Subscription> {
        self.brook_to_subscription_ids
            .get(key)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| self.subscriptions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Last position notified for `key`
    #[cfg(test)]
    pub fn position_of(&self, key: &BrookKey) -> Option<Position> {
        self.brook_positions.get(key).copied()
    }

    pub fn snapshot(&self) -> Vec<Subscription> {
        self.subscriptions.values().cloned().collect()
    }

    /// Clear every map, handing back the open streams for closing
    pub fn drain(&mut self) -> Vec<(BrookKey, Box<dyn StreamSubscription>)> {
        self.subscriptions.clear();
        self.brook_to_subscription_ids.clear();
        self.brook_positions.clear();
        self.brook_stream_handles.drain().collect()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn watched_brooks(&self) -> usize {
        self.brook_stream_handles.len()
    }

    #[cfg(test)]
    pub fn is_idle(&self) -> bool {
        self.subscriptions.is_empty()
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        for key in self.brook_stream_handles.keys() {
            let ids = self.brook_to_subscription_ids.get(key);
            assert!(
                ids.map_or(false, |ids| !ids.is_empty()),
                "stream open for {} with no subscribers",
                key
            );
        }
        for (key, ids) in &self.brook_to_subscription_ids {
            assert!(!ids.is_empty());
            assert!(self.brook_stream_handles.contains_key(key));
            for id in ids {
                let sub = self.subscriptions.get(id).expect("dangling subscription id");
                assert_eq!(&sub.brook_key, key);
            }
        }
        for key in self.brook_positions.keys() {
            assert!(self.brook_stream_handles.contains_key(key));
        }
    }
}

//! Multiplexer task
//!
//! One task per connection owns a [`ConnectionSubscriptionState`] and
//! processes its mailbox one command at a time. Client RPCs and upstream
//! position events share the mailbox, so they are strictly serialized and
//! the state needs no locking.
//!
//! ```text
//!   MultiplexerHandle ──┐
//!   MultiplexerHandle ──┼──► mailbox ──► MultiplexerActor ──► BroadcastChannel
//!   MailboxObserver  ───┘                  │   ▲                 (one send per
//!     (brook streams)                      ▼   │                  subscription)
//!                                     BrookStreamBridge
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::brook::{BrookKey, BrookPositionReader, BrookPositionStream, PositionAdvanced};
use crate::broadcast::BroadcastChannel;
use crate::error::{Error, Result};
use crate::projection::{group_name, ProjectionRegistry, ProjectionUpdated};
use crate::stats::MultiplexerStats;

use super::bridge::BrookStreamBridge;
use super::config::MultiplexerConfig;
use super::state::{
    Advance, ConnectionId, ConnectionSubscriptionState, Subscription, SubscriptionId,
};

/// External collaborators shared by every multiplexer
#[derive(Clone)]
pub struct MultiplexerDeps {
    pub registry: Arc<dyn ProjectionRegistry>,
    pub reader: Arc<dyn BrookPositionReader>,
    pub streams: Arc<dyn BrookPositionStream>,
    pub broadcast: Arc<dyn BroadcastChannel>,
}

pub(crate) enum Command {
    Subscribe {
        projection_type: String,
        entity_id: String,
        cancel: CancellationToken,
        reply: oneshot::Sender<Result<SubscriptionId>>,
    },
    Unsubscribe {
        subscription_id: SubscriptionId,
        reply: oneshot::Sender<Option<Subscription>>,
    },
    ClearAll {
        reply: oneshot::Sender<()>,
    },
    GetSubscriptions {
        reply: oneshot::Sender<Vec<Subscription>>,
    },
    Stats {
        reply: oneshot::Sender<MultiplexerStats>,
    },
    PositionAdvanced(PositionAdvanced),
    /// Exit if idle; the reply says whether the task is retiring
    RetireIfIdle {
        idle_timeout: Duration,
        reply: oneshot::Sender<bool>,
    },
    Shutdown,
}

/// Lifecycle signals the host reads without going through the mailbox
pub(crate) struct Activity {
    subscriptions: AtomicUsize,
    /// Subscribes sent to the mailbox and not yet answered
    pending_subscribes: AtomicUsize,
    idle_since: Mutex<Option<Instant>>,
    retire_requested: AtomicBool,
    running: AtomicBool,
}

impl Activity {
    fn new() -> Self {
        Self {
            subscriptions: AtomicUsize::new(0),
            pending_subscribes: AtomicUsize::new(0),
            idle_since: Mutex::new(Some(Instant::now())),
            retire_requested: AtomicBool::new(false),
            running: AtomicBool::new(true),
        }
    }

    fn record(&self, subscriptions: usize) {
        let previous = self.subscriptions.swap(subscriptions, Ordering::SeqCst);
        let mut idle_since = self.idle_since.lock();
        if subscriptions > 0 {
            *idle_since = None;
            self.retire_requested.store(false, Ordering::Relaxed);
        } else if previous > 0 || idle_since.is_none() {
            *idle_since = Some(Instant::now());
        }
    }

    pub fn is_idle(&self) -> bool {
        self.subscriptions.load(Ordering::SeqCst) == 0
    }

    pub fn begin_subscribe(&self) {
        self.pending_subscribes.fetch_add(1, Ordering::SeqCst);
    }

    pub fn end_subscribe(&self) {
        self.pending_subscribes.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn has_pending_subscribes(&self) -> bool {
        self.pending_subscribes.load(Ordering::SeqCst) > 0
    }

    pub fn idle_for(&self) -> Option<Duration> {
        self.idle_since.lock().map(|since| since.elapsed())
    }

    pub fn retire_requested(&self) -> bool {
        self.retire_requested.load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct Counters {
    notifications_sent: u64,
    send_failures: u64,
    stale_positions_dropped: u64,
}

pub(crate) struct MultiplexerActor {
    connection: ConnectionId,
    state: ConnectionSubscriptionState,
    bridge: BrookStreamBridge,
    registry: Arc<dyn ProjectionRegistry>,
    broadcast: Arc<dyn BroadcastChannel>,
    config: MultiplexerConfig,
    activity: Arc<Activity>,
    counters: Counters,
    started_at: Instant,
}

impl MultiplexerActor {
    /// Spawn a multiplexer task for `connection`
    ///
    /// Returns the mailbox sender and the shared activity tracker.
    pub fn spawn(
        connection: ConnectionId,
        deps: MultiplexerDeps,
        config: MultiplexerConfig,
    ) -> (mpsc::UnboundedSender<Command>, Arc<Activity>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let activity = Arc::new(Activity::new());

        let actor = Self {
            bridge: BrookStreamBridge::new(
                connection.clone(),
                deps.reader,
                deps.streams,
                tx.downgrade(),
            ),
            connection,
            state: ConnectionSubscriptionState::new(),
            registry: deps.registry,
            broadcast: deps.broadcast,
            config,
            activity: Arc::clone(&activity),
            counters: Counters::default(),
            started_at: Instant::now(),
        };

        tokio::spawn(actor.run(rx));
        (tx, activity)
    }

    async fn run(mut self, mut mailbox: mpsc::UnboundedReceiver<Command>) {
        tracing::debug!(connection = %self.connection, "Multiplexer activated");

        while let Some(command) = mailbox.recv().await {
            match command {
                Command::Shutdown => break,
                Command::RetireIfIdle { idle_timeout, reply } => {
                    let retiring = self.should_retire(idle_timeout);
                    if retiring {
                        // Callers see the task as gone before the reply lands
                        self.activity.running.store(false, Ordering::SeqCst);
                        mailbox.close();
                    }
                    let _ = reply.send(retiring);
                    if retiring {
                        break;
                    }
                }
                command => self.handle(command).await,
            }
        }

        // Anything still queued is answered with a dropped reply
        self.activity.running.store(false, Ordering::SeqCst);
        mailbox.close();

        // Retired without ClearAll: don't leak upstream subscriptions
        self.close_all_streams().await;
        self.activity.record(0);

        tracing::debug!(connection = %self.connection, "Multiplexer retired");
    }

    // Activity is recorded before replying so callers observe it as soon as
    // their request completes.
    async fn handle(&mut self, command: Command) {
        match command {
            Command::Subscribe {
                projection_type,
                entity_id,
                cancel,
                reply,
            } => {
                let result = self.subscribe(projection_type, entity_id, &cancel).await;
                self.record_activity();
                self.activity.end_subscribe();
                let _ = reply.send(result);
            }
            Command::Unsubscribe {
                subscription_id,
                reply,
            } => {
                let removed = self.unsubscribe(&subscription_id).await;
                self.record_activity();
                let _ = reply.send(removed);
            }
            Command::ClearAll { reply } => {
                self.clear_all().await;
                self.record_activity();
                let _ = reply.send(());
            }
            Command::GetSubscriptions { reply } => {
                let _ = reply.send(self.state.snapshot());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
            Command::PositionAdvanced(event) => {
                self.on_position_advanced(event).await;
            }
            Command::RetireIfIdle { reply, .. } => {
                let _ = reply.send(false);
            }
            Command::Shutdown => {}
        }
    }

    /// Idle long enough, or cleared and untouched since
    fn should_retire(&self, idle_timeout: Duration) -> bool {
        if self.state.subscription_count() > 0 {
            return false;
        }
        self.activity.retire_requested()
            || self
                .activity
                .idle_for()
                .map_or(false, |idle| idle >= idle_timeout)
    }

    fn record_activity(&self) {
        self.activity.record(self.state.subscription_count());
    }

    async fn subscribe(
        &mut self,
        projection_type: String,
        entity_id: String,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionId> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let resolved = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            resolved = self.registry.try_resolve_brook(&projection_type) => resolved,
        };
        let Some(brook_name) = resolved else {
            tracing::warn!(
                connection = %self.connection,
                projection_type = %projection_type,
                "Subscribe for unregistered projection type"
            );
            return Err(Error::UnregisteredProjection(projection_type));
        };

        let subscription_id = SubscriptionId::generate();
        let brook_key = BrookKey::new(brook_name, entity_id.clone());

        // Nothing is recorded until every await has finished, so a failed or
        // cancelled subscribe leaves the state exactly as it was.
        let opened = if self.state.is_watching(&brook_key) {
            None
        } else {
            let opened = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                opened = self.bridge.open(&brook_key) => opened?,
            };
            if cancel.is_cancelled() {
                self.bridge.close(&brook_key, opened.1).await;
                return Err(Error::Cancelled);
            }
            Some(opened)
        };

        self.state.add(
            Subscription {
                subscription_id: subscription_id.clone(),
                projection_type,
                entity_id,
                brook_key: brook_key.clone(),
            },
            opened,
        );

        tracing::debug!(
            connection = %self.connection,
            subscription_id = %subscription_id,
            brook = %brook_key,
            subscriptions = self.state.subscription_count(),
            "Subscription added"
        );

        Ok(subscription_id)
    }

    async fn unsubscribe(&mut self, subscription_id: &SubscriptionId) -> Option<Subscription> {
        let Some(removed) = self.state.remove(subscription_id) else {
            tracing::debug!(
                connection = %self.connection,
                subscription_id = %subscription_id,
                "Unsubscribe for unknown subscription"
            );
            return None;
        };

        tracing::debug!(
            connection = %self.connection,
            subscription_id = %subscription_id,
            brook = %removed.subscription.brook_key,
            subscriptions = self.state.subscription_count(),
            "Subscription removed"
        );

        if let Some((key, handle)) = removed.closed_stream {
            self.bridge.close(&key, handle).await;
        }

        Some(removed.subscription)
    }

    async fn clear_all(&mut self) {
        let subscriptions = self.state.subscription_count();
        self.close_all_streams().await;
        self.activity.retire_requested.store(true, Ordering::Relaxed);

        tracing::info!(
            connection = %self.connection,
            subscriptions = subscriptions,
            "Cleared all subscriptions"
        );
    }

    async fn close_all_streams(&mut self) {
        for (key, handle) in self.state.drain() {
            self.bridge.close(&key, handle).await;
        }
    }

    async fn on_position_advanced(&mut self, event: PositionAdvanced) {
        let PositionAdvanced {
            brook_key,
            new_position,
        } = event;

        match self.state.advance(&brook_key, new_position) {
            Advance::Unwatched => {
                tracing::trace!(
                    connection = %self.connection,
                    brook = %brook_key,
                    "Position event for unwatched brook"
                );
                return;
            }
            Advance::Stale { current } => {
                self.counters.stale_positions_dropped += 1;
                tracing::trace!(
                    connection = %self.connection,
                    brook = %brook_key,
                    position = %new_position,
                    current = %current,
                    "Dropped stale position"
                );
                return;
            }
            Advance::Accepted => {}
        }

        // Accepted positions are always set
        let Some(version) = new_position.value() else {
            return;
        };

        let subscribers = self.state.subscribers_of(&brook_key);
        let broadcast = &self.broadcast;
        let method = self.config.notification_method.as_str();

        let sends = subscribers.iter().map(|sub| async move {
            let group = group_name(&sub.projection_type, &sub.entity_id);
            let update = ProjectionUpdated::new(
                sub.projection_type.clone(),
                sub.entity_id.clone(),
                version,
            );
            let result = broadcast.send_to_group(&group, method, update.to_args()).await;
            (sub, group, result)
        });

        for (sub, group, result) in join_all(sends).await {
            match result {
                Ok(()) => self.counters.notifications_sent += 1,
                Err(e) => {
                    self.counters.send_failures += 1;
                    tracing::warn!(
                        connection = %self.connection,
                        subscription_id = %sub.subscription_id,
                        group = %group,
                        error = %e,
                        "Failed to broadcast projection update"
                    );
                }
            }
        }

        tracing::debug!(
            connection = %self.connection,
            brook = %brook_key,
            position = version,
            subscribers = subscribers.len(),
            "Projection updates broadcast"
        );
    }

    fn stats(&self) -> MultiplexerStats {
        MultiplexerStats {
            connection_id: self.connection.clone(),
            subscriptions: self.state.subscription_count(),
            watched_brooks: self.state.watched_brooks(),
            notifications_sent: self.counters.notifications_sent,
            send_failures: self.counters.send_failures,
            stale_positions_dropped: self.counters.stale_positions_dropped,
            uptime: self.started_at.elapsed(),
        }
    }
}

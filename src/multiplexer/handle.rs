//! Client-side handle to a multiplexer task

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::stats::MultiplexerStats;

use super::actor::{Activity, Command, MultiplexerActor, MultiplexerDeps};
use super::config::MultiplexerConfig;
use super::state::{ConnectionId, Subscription, SubscriptionId};

/// Handle to the multiplexer of one connection
///
/// Cheap to clone. Every call is queued on the multiplexer's mailbox and
/// runs after the calls queued before it.
#[derive(Clone)]
pub struct MultiplexerHandle {
    connection: ConnectionId,
    mailbox: mpsc::UnboundedSender<Command>,
    activity: Arc<Activity>,
}

impl MultiplexerHandle {
    /// Spawn a new multiplexer task for `connection`
    pub fn spawn(
        connection: ConnectionId,
        deps: MultiplexerDeps,
        config: MultiplexerConfig,
    ) -> Self {
        let (mailbox, activity) = MultiplexerActor::spawn(connection.clone(), deps, config);
        Self {
            connection,
            mailbox,
            activity,
        }
    }

    pub fn connection_id(&self) -> &ConnectionId {
        &self.connection
    }

    /// Subscribe to a projection instance
    ///
    /// Fails with [`Error::UnregisteredProjection`] if the projection type
    /// has no brook.
    pub async fn subscribe(
        &self,
        projection_type: &str,
        entity_id: &str,
    ) -> Result<SubscriptionId> {
        self.subscribe_with_cancel(projection_type, entity_id, &CancellationToken::new())
            .await
    }

    /// Subscribe, giving up with [`Error::Cancelled`] once `cancel` fires
    ///
    /// A cancelled subscribe never leaves a subscription behind: if the
    /// multiplexer completes it anyway, it is removed again.
    pub async fn subscribe_with_cancel(
        &self,
        projection_type: &str,
        entity_id: &str,
        cancel: &CancellationToken,
    ) -> Result<SubscriptionId> {
        let (reply, mut rx) = oneshot::channel();

        // Counted until the task answers, so cleanup never retires a
        // multiplexer with a subscribe on the way
        self.activity.begin_subscribe();
        let sent = self.send(Command::Subscribe {
            projection_type: projection_type.to_string(),
            entity_id: entity_id.to_string(),
            cancel: cancel.clone(),
            reply,
        });
        if let Err(e) = sent {
            self.activity.end_subscribe();
            return Err(e);
        }

        tokio::select! {
            biased;
            result = &mut rx => match result {
                Ok(result) => result,
                Err(_) => Err(self.closed()),
            },
            _ = cancel.cancelled() => {
                // The task may have committed just before seeing the token
                let handle = self.clone();
                tokio::spawn(async move {
                    if let Ok(Ok(subscription_id)) = rx.await {
                        let _ = handle.unsubscribe(&subscription_id).await;
                    }
                });
                Err(Error::Cancelled)
            }
        }
    }

    /// Remove a subscription, returning it
    ///
    /// Unknown ids are ignored and yield `None`.
    pub async fn unsubscribe(
        &self,
        subscription_id: &SubscriptionId,
    ) -> Result<Option<Subscription>> {
        self.request(|reply| Command::Unsubscribe {
            subscription_id: subscription_id.clone(),
            reply,
        })
        .await
    }

    /// Drop every subscription and close every brook stream
    pub async fn clear_all(&self) -> Result<()> {
        self.request(|reply| Command::ClearAll { reply }).await
    }

    /// Snapshot of current subscriptions
    pub async fn get_subscriptions(&self) -> Result<Vec<Subscription>> {
        self.request(|reply| Command::GetSubscriptions { reply }).await
    }

    pub async fn stats(&self) -> Result<MultiplexerStats> {
        self.request(|reply| Command::Stats { reply }).await
    }

    /// Ask the task to exit after the commands already queued
    pub fn shutdown(&self) {
        let _ = self.mailbox.send(Command::Shutdown);
    }

    /// Whether the multiplexer currently holds no subscriptions
    pub fn is_idle(&self) -> bool {
        self.activity.is_idle()
    }

    /// How long the multiplexer has been idle, `None` while active
    pub fn idle_for(&self) -> Option<Duration> {
        self.activity.idle_for()
    }

    /// Whether `clear_all` ran and nothing subscribed since
    pub fn retire_requested(&self) -> bool {
        self.activity.retire_requested()
    }

    pub fn is_running(&self) -> bool {
        self.activity.is_running() && !self.mailbox.is_closed()
    }

    /// Whether two handles drive the same task
    pub fn same_multiplexer(&self, other: &MultiplexerHandle) -> bool {
        self.mailbox.same_channel(&other.mailbox)
    }

    /// Ask the task to exit if it is still idle once the request is reached
    ///
    /// Everything queued before the request runs first, so a subscribe in
    /// flight keeps the multiplexer alive. Returns whether it is retiring.
    pub(crate) async fn retire_if_idle(&self, idle_timeout: Duration) -> Result<bool> {
        self.request(|reply| Command::RetireIfIdle { idle_timeout, reply })
            .await
    }

    /// Whether the host should ask this multiplexer to retire
    pub(crate) fn should_retire(&self, idle_timeout: Duration) -> bool {
        if !self.is_running() {
            return true;
        }
        if !self.is_idle() || self.activity.has_pending_subscribes() {
            return false;
        }
        self.retire_requested() || self.idle_for().map_or(false, |idle| idle >= idle_timeout)
    }

    fn send(&self, command: Command) -> Result<()> {
        self.mailbox.send(command).map_err(|_| self.closed())
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply))?;
        rx.await.map_err(|_| self.closed())
    }

    fn closed(&self) -> Error {
        Error::MultiplexerClosed(self.connection.clone())
    }
}

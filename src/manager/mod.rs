//! Keep a RabbitMq channel alive across involuntary closures and broker cancellations.
//!
//! Check out [`ChannelManager`] as a starting point.
mod settings;

pub use settings::{BackoffSettings, ChannelManagerSettings, ReconnectStrategy};

use crate::{
    dispatcher::{Dispatcher, Subscription},
    error::{ChannelFailure, ManagerError},
    transport::{open_channel, ConnectionPool, ManagedChannel},
};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::{
    sync::{watch, RwLock},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

/// The lifecycle stage of a [`ChannelManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    /// The current channel is believed to be healthy.
    Active,
    /// The current channel failed: the manager is trying to replace it.
    Recovering,
    /// The channel was closed gracefully. The manager will not recover it.
    Closed,
}

/// Owns a single channel and replaces it whenever it fails.
///
/// # Recovery
///
/// A background task listens to the lifecycle signals of the current channel:
/// - if the channel is closed gracefully, the manager moves to [`ManagerState::Closed`] and stays
///   there;
/// - if the channel is closed with an error, or the broker cancels one of its consumers, the
///   manager starts recovering.
///
/// Recovery waits according to the configured [`ReconnectStrategy`], then tries to open a new
/// channel. Failed attempts are logged and retried, forever.
/// Once an attempt succeeds, the new channel is installed, the reconnection count is bumped and
/// the original failure is broadcast to all [`subscribers`](ChannelManager::subscribe).
///
/// # Using the channel
///
/// [`ChannelManager::channel`] gives you the current channel.
/// A recovery never interrupts an in-flight operation on an old channel: the operation fails on
/// its own, and the caller should retry with the channel returned by a new call to
/// [`ChannelManager::channel`].
///
/// Consumers must listen to recovery notifications and register again on the new channel: the
/// manager does not do it on their behalf.
pub struct ChannelManager<P: ConnectionPool> {
    inner: Arc<Inner<P>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

struct Inner<P: ConnectionPool> {
    pool: P,
    channel: RwLock<Arc<P::Channel>>,
    reconnect_strategy: ReconnectStrategy,
    reconnection_count: Mutex<u64>,
    dispatcher: Dispatcher<ChannelFailure>,
    state: watch::Sender<ManagerState>,
    shutdown: CancellationToken,
}

impl<P: ConnectionPool> ChannelManager<P> {
    /// Open a channel and start watching it.
    ///
    /// It fails straight away if a channel cannot be acquired: there is no retry at
    /// construction time.
    ///
    /// It must be called from within a tokio runtime.
    #[tracing::instrument(name = "channel_manager_new", skip_all)]
    pub async fn new(pool: P, settings: &ChannelManagerSettings) -> Result<Self, ManagerError> {
        let channel = open_channel(&pool)
            .await
            .map_err(ManagerError::Acquisition)?;
        let (state, _) = watch::channel(ManagerState::Active);

        let inner = Arc::new(Inner {
            pool,
            channel: RwLock::new(Arc::new(channel)),
            reconnect_strategy: settings.reconnect_strategy(),
            reconnection_count: Mutex::new(0),
            dispatcher: Dispatcher::with_capacity(settings.subscriber_capacity),
            state,
            shutdown: CancellationToken::new(),
        });
        let watcher = tokio::spawn(Arc::clone(&inner).watch());

        Ok(Self {
            inner,
            watcher: Mutex::new(Some(watcher)),
        })
    }

    /// The current channel.
    ///
    /// The returned handle stays usable (as far as the manager is concerned) even if a recovery
    /// replaces it: you will find out it is broken when an operation on it fails.
    pub async fn channel(&self) -> Arc<P::Channel> {
        Arc::clone(&*self.inner.channel.read().await)
    }

    /// Whether `channel` is the one currently handed out by [`ChannelManager::channel`].
    ///
    /// Recovery notifications can pile up: after two quick recoveries, a subscriber that
    /// moved to the latest channel on the first notification is already where it needs to be
    /// when it reads the second one.
    pub async fn is_current(&self, channel: &Arc<P::Channel>) -> bool {
        Arc::ptr_eq(&*self.inner.channel.read().await, channel)
    }

    /// Get notified every time the channel has been recovered.
    ///
    /// Each notification carries the failure that triggered the recovery.
    pub fn subscribe(&self) -> Subscription<ChannelFailure> {
        self.inner.dispatcher.add_subscriber()
    }

    /// How many times the channel has been successfully recovered.
    pub fn reconnection_count(&self) -> u64 {
        self.inner.reconnection_count()
    }

    /// The current lifecycle stage.
    ///
    /// Use [`ChannelManager::watch_state`] to wait for a transition instead of polling.
    pub fn state(&self) -> ManagerState {
        *self.inner.state.borrow()
    }

    /// Observe lifecycle transitions.
    pub fn watch_state(&self) -> watch::Receiver<ManagerState> {
        self.inner.state.subscribe()
    }

    /// Stop watching the channel and close it.
    ///
    /// The background task is stopped (and awaited) before the channel is closed, therefore
    /// closing never triggers a recovery, even if it happens while the manager is recovering.
    #[tracing::instrument(name = "channel_manager_close", skip_all)]
    pub async fn close(&self) -> Result<(), ManagerError> {
        let watcher = self
            .watcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(watcher) = watcher else {
            return Err(ManagerError::AlreadyClosed);
        };
        tracing::info!("Closing channel manager");

        self.inner.shutdown.cancel();
        if let Err(e) = watcher.await {
            tracing::error!(error = %e, "Channel watcher terminated abnormally");
        }

        let channel = self.inner.channel.write().await;
        self.inner.state.send_replace(ManagerState::Closed);
        channel.close().await.map_err(ManagerError::Close)
    }
}

impl<P: ConnectionPool> Drop for ChannelManager<P> {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
    }
}

impl<P: ConnectionPool> Inner<P> {
    /// Wait for the current channel to fail, recover it, repeat.
    async fn watch(self: Arc<Self>) {
        loop {
            let (closed, cancelled) = {
                let channel = self.channel.read().await;
                (channel.notify_close(), channel.notify_cancel())
            };
            // A cancellation listener whose sender goes away will never fire.
            let cancelled = async move {
                match cancelled.await {
                    Ok(reason) => reason,
                    Err(_) => std::future::pending().await,
                }
            };

            let failure = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => return,
                closed = closed => match closed {
                    Ok(Some(failure)) => {
                        tracing::error!(error = %failure, "Attempting to recover the channel after it was closed with an error");
                        failure
                    }
                    Ok(None) | Err(_) => {
                        tracing::info!("Channel closed gracefully");
                        self.state.send_replace(ManagerState::Closed);
                        return;
                    }
                },
                reason = cancelled => {
                    tracing::error!(%reason, "Attempting to recover the channel after the broker cancelled a consumer");
                    ChannelFailure::cancelled(reason)
                }
            };

            self.state.send_replace(ManagerState::Recovering);
            if !self.reconnect_loop().await {
                return;
            }
            self.state.send_replace(ManagerState::Active);
            tracing::warn!(
                reconnection_count = self.reconnection_count(),
                "Successfully recovered the channel"
            );
            self.dispatcher.dispatch(failure);
        }
    }

    /// Try to replace the current channel until it works.
    ///
    /// Returns `false` if the manager was shut down before a new channel could be installed.
    async fn reconnect_loop(&self) -> bool {
        let mut attempt = 0u32;
        loop {
            let delay = self.reconnect_strategy.delay(attempt);
            tracing::info!(?delay, attempt, "Waiting before attempting to reconnect");
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }

            let outcome = tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => return false,
                outcome = self.reconnect() => outcome,
            };
            match outcome {
                Ok(()) => return true,
                Err(e) => {
                    tracing::error!(error = ?e, attempt, "Failed to reconnect");
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// Swap the current channel for a fresh one.
    #[tracing::instrument(name = "channel_manager_reconnect", skip_all)]
    async fn reconnect(&self) -> Result<(), anyhow::Error> {
        let mut current = self.channel.write().await;
        let channel = open_channel(&self.pool).await?;

        if let Err(e) = current.close().await {
            tracing::warn!(error = ?e, "Failed to close the stale channel while reconnecting");
        }

        *current = Arc::new(channel);
        self.increment_reconnection_count();
        Ok(())
    }

    fn reconnection_count(&self) -> u64 {
        *self
            .reconnection_count
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn increment_reconnection_count(&self) {
        *self
            .reconnection_count
            .lock()
            .unwrap_or_else(PoisonError::into_inner) += 1;
    }
}

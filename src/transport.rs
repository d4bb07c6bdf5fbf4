//! The transport primitives [`ChannelManager`](crate::ChannelManager) is built upon.
//!
//! The manager does not talk to RabbitMq directly: it checks out a connection from a
//! [`ConnectionPool`], opens a [`ManagedChannel`] on it and listens to the channel lifecycle
//! signals.
//! The [`amqp`](crate::amqp) and [`pool`](crate::pool) modules provide implementations backed by
//! `lapin` and `deadpool`; you can provide your own (e.g. an in-memory fake in tests).
use crate::error::ChannelFailure;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

/// A source of connections that can be checked out exclusively.
///
/// Implementations must tolerate concurrent callers.
#[async_trait::async_trait]
pub trait ConnectionPool: Send + Sync + 'static {
    /// The type of channel opened on the pooled connections.
    type Channel: ManagedChannel;

    /// A checked-out connection.
    ///
    /// The connection is checked back into the pool when the guard is dropped.
    type Connection: Connection<Channel = Self::Channel>;

    /// Check out a connection.
    ///
    /// It might wait for a connection to be checked back in if the pool is exhausted.
    async fn checkout(&self) -> Result<Self::Connection, anyhow::Error>;
}

/// A transport session, able to open channels.
#[async_trait::async_trait]
pub trait Connection: Send + Sync {
    type Channel: ManagedChannel;

    /// Open a new channel on this connection.
    async fn open_channel(&self) -> Result<Self::Channel, anyhow::Error>;
}

/// A logical channel whose lifecycle can be observed.
#[async_trait::async_trait]
pub trait ManagedChannel: Send + Sync + 'static {
    /// Register a listener for the closure of the channel.
    ///
    /// The listener receives at most one value:
    /// - `None` if the channel was closed gracefully;
    /// - `Some(failure)` if it was closed with an error.
    ///
    /// If the channel is already closed, the listener is notified straight away.
    /// Dropping the sender without a value is interpreted as a graceful close.
    fn notify_close(&self) -> oneshot::Receiver<Option<ChannelFailure>>;

    /// Register a listener for server-initiated consumer cancellations.
    ///
    /// The listener receives at most one value, the reason of the cancellation.
    /// Dropping the sender without a value means no cancellation will ever be reported.
    fn notify_cancel(&self) -> oneshot::Receiver<String>;

    /// Close the channel.
    async fn close(&self) -> Result<(), anyhow::Error>;
}

/// Check out a connection and open a channel on it.
///
/// The connection is checked back in before returning, whatever the outcome.
#[tracing::instrument(name = "open_channel", skip_all, level = "debug")]
pub(crate) async fn open_channel<P: ConnectionPool>(pool: &P) -> Result<P::Channel, anyhow::Error> {
    let connection = pool.checkout().await?;
    connection.open_channel().await
}

/// Bookkeeping for the listeners of [`ManagedChannel::notify_close`] and
/// [`ManagedChannel::notify_cancel`].
///
/// Each signal fires at most once; listeners registered afterwards get the recorded value.
#[derive(Default)]
pub struct ChannelSignals {
    state: Mutex<SignalState>,
}

#[derive(Default)]
struct SignalState {
    closed: Option<Option<ChannelFailure>>,
    close_listeners: Vec<oneshot::Sender<Option<ChannelFailure>>>,
    cancelled: Option<String>,
    cancel_listeners: Vec<oneshot::Sender<String>>,
}

impl ChannelSignals {
    fn lock(&self) -> MutexGuard<'_, SignalState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn on_close(&self) -> oneshot::Receiver<Option<ChannelFailure>> {
        let (sender, receiver) = oneshot::channel();
        let mut state = self.lock();
        match &state.closed {
            Some(outcome) => {
                let _ = sender.send(outcome.clone());
            }
            None => state.close_listeners.push(sender),
        }
        receiver
    }

    pub fn on_cancel(&self) -> oneshot::Receiver<String> {
        let (sender, receiver) = oneshot::channel();
        let mut state = self.lock();
        match &state.cancelled {
            Some(reason) => {
                let _ = sender.send(reason.clone());
            }
            None => state.cancel_listeners.push(sender),
        }
        receiver
    }

    pub fn closed(&self, outcome: Option<ChannelFailure>) {
        let mut state = self.lock();
        // First outcome wins: closing an already broken channel is not a graceful close.
        if state.closed.is_some() {
            return;
        }
        for listener in state.close_listeners.drain(..) {
            let _ = listener.send(outcome.clone());
        }
        state.closed = Some(outcome);
    }

    pub fn cancelled(&self, reason: String) {
        let mut state = self.lock();
        if state.cancelled.is_some() {
            return;
        }
        for listener in state.cancel_listeners.drain(..) {
            let _ = listener.send(reason.clone());
        }
        state.cancelled = Some(reason);
    }
}

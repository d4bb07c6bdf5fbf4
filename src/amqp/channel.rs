use crate::{
    error::{ChannelFailure, ReplyCode},
    transport::{ChannelSignals, ManagedChannel},
};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Reply code used when we close a channel on purpose.
/// See https://www.rabbitmq.com/amqp-0-9-1-reference.html#constants
const REPLY_SUCCESS: u16 = 200;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// A [`lapin::Channel`] whose closure and consumer cancellations can be observed.
///
/// Errors reported by `lapin` (including connection-level errors) are surfaced as a failed
/// close, a call to [`ManagedChannel::close`] as a graceful one.
///
/// `lapin` ends the delivery stream of a consumer when the broker cancels it: whoever owns the
/// consumer is expected to report it via [`AmqpChannel::report_cancellation`].
pub struct AmqpChannel {
    channel: lapin::Channel,
    signals: Arc<ChannelSignals>,
}

impl AmqpChannel {
    pub fn new(channel: lapin::Channel) -> Self {
        let signals = Arc::new(ChannelSignals::default());
        channel.on_error({
            let signals = Arc::clone(&signals);
            move |error| signals.closed(Some(failure_from(&error)))
        });
        Self { channel, signals }
    }

    /// Get access to the underlying raw channel
    pub fn raw(&self) -> &lapin::Channel {
        &self.channel
    }

    /// Report that the broker cancelled a consumer registered on this channel.
    pub fn report_cancellation(&self, reason: impl Into<String>) {
        self.signals.cancelled(reason.into());
    }

    pub fn status(&self) -> HealthStatus {
        if self.channel.status().connected() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }
}

#[async_trait::async_trait]
impl ManagedChannel for AmqpChannel {
    fn notify_close(&self) -> oneshot::Receiver<Option<ChannelFailure>> {
        self.signals.on_close()
    }

    fn notify_cancel(&self) -> oneshot::Receiver<String> {
        self.signals.on_cancel()
    }

    #[tracing::instrument(name = "rabbitmq_close_channel", skip(self))]
    async fn close(&self) -> Result<(), anyhow::Error> {
        let outcome = self.channel.close(REPLY_SUCCESS, "Bye").await;
        self.signals.closed(None);
        Ok(outcome?)
    }
}

fn failure_from(error: &lapin::Error) -> ChannelFailure {
    match error {
        lapin::Error::ProtocolError(e) => {
            ChannelFailure::closed(e.get_id(), e.get_message().as_str())
        }
        e => ChannelFailure::closed(ReplyCode(None), e.to_string()),
    }
}

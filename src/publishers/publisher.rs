use crate::{
    amqp::AmqpChannel, publishers::MessageEnvelope, transport::ConnectionPool, ChannelManager,
};
use lapin::{
    message::BasicReturnMessage, options::BasicPublishOptions, publisher_confirm::Confirmation,
    BasicProperties,
};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;
use uuid::Uuid;

/// A high-level interface to publish messages.
///
/// # Fault tolerance
///
/// `Publisher` always publishes on the current channel of its [`ChannelManager`].
/// If a publish fails because the channel broke, the error is returned to the caller: retrying
/// after the manager has recovered will use the new channel.
///
/// # How do I build a `Publisher`?
///
/// The starting point is [`Publisher::builder`].
pub struct Publisher<P: ConnectionPool<Channel = AmqpChannel>> {
    manager: Arc<ChannelManager<P>>,
    timeout: std::time::Duration,
    mandatory: bool,
}

impl<P: ConnectionPool<Channel = AmqpChannel>> Publisher<P> {
    /// Start building a [`Publisher`] on top of a channel manager.
    pub fn builder(manager: Arc<ChannelManager<P>>) -> PublisherBuilder<P> {
        PublisherBuilder::new(manager)
    }

    /// Publish a message to RabbitMq.
    ///
    /// The mandatory flag defaults to `true`: the broker returns messages that cannot be routed.
    /// Use `publish_with_options` to overwrite this behaviour.
    pub async fn publish(&self, envelope: MessageEnvelope) -> Result<(), PublisherError> {
        let options = BasicPublishOptions {
            mandatory: self.mandatory,
            // The immediate flag was dropped in RabbitMQ 3.0 - see https://www.rabbitmq.com/blog/2012/11/19/breaking-things-with-rabbitmq-3-0/
            // Setting `true` will cause a not-supported error
            immediate: false,
        };
        self.publish_with_options(envelope, options).await
    }

    /// Publish a message to RabbitMq.
    pub async fn publish_with_options(
        &self,
        envelope: MessageEnvelope,
        options: BasicPublishOptions,
    ) -> Result<(), PublisherError> {
        let envelope = inject_amqp_properties(envelope);

        // Fetching the channel counts towards the timeout: it waits while a recovery swaps it.
        let publish_future = async {
            let channel = self.manager.channel().await;
            publish(&channel, &envelope, options).await
        };

        match tokio::time::timeout(self.timeout, publish_future).await {
            Ok(result) => result,
            Err(_) => Err(PublisherError::TimeoutError),
        }
    }
}

/// Error returned when trying to publish a message using `Publisher`.
#[derive(thiserror::Error, Debug)]
pub enum PublisherError {
    #[error("Generic error encountered when interacting with the RabbitMq broker")]
    GenericError(#[source] anyhow::Error),
    #[error("The timeout threshold was reached while trying to publish the message")]
    TimeoutError,
    #[error("The message could not be routed: {0:?}")]
    UnroutableMessage(Box<BasicReturnMessage>),
    #[error("The RabbitMq broker nacked the publishing of the message: {0:?}")]
    NegativeAck(Option<Box<BasicReturnMessage>>),
}

/// A builder for [`Publisher`].
///
/// Use [`Publisher::builder`] as entrypoint.
pub struct PublisherBuilder<P: ConnectionPool<Channel = AmqpChannel>> {
    manager: Arc<ChannelManager<P>>,
    timeout: std::time::Duration,
    mandatory: bool,
}

impl<P: ConnectionPool<Channel = AmqpChannel>> PublisherBuilder<P> {
    fn new(manager: Arc<ChannelManager<P>>) -> Self {
        Self {
            manager,
            timeout: std::time::Duration::from_secs(3),
            mandatory: true,
        }
    }

    /// Timeout applied when attempting to publish a message.
    /// Defaults to 3 seconds if left unspecified.
    #[must_use]
    pub fn publish_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Let the broker silently drop messages that cannot be routed.
    #[must_use]
    pub fn not_mandatory(mut self) -> Self {
        self.mandatory = false;
        self
    }

    pub fn build(self) -> Publisher<P> {
        Publisher {
            manager: self.manager,
            timeout: self.timeout,
            mandatory: self.mandatory,
        }
    }
}

/// Publish an envelope on the given channel.
///
/// If the channel has publisher confirms enabled, it waits for the broker to confirm.
#[tracing::instrument(level = "debug", skip(channel, envelope), fields(exchange = %envelope.exchange_name, routing_key = %envelope.routing_key))]
pub(crate) async fn publish(
    channel: &AmqpChannel,
    envelope: &MessageEnvelope,
    options: BasicPublishOptions,
) -> Result<(), PublisherError> {
    // Delivery mode: Non-persistent (1) or persistent (2).
    let properties = envelope.properties.clone().with_delivery_mode(2);

    let confirm = channel
        .raw()
        .basic_publish(
            &envelope.exchange_name,
            &envelope.routing_key,
            options,
            &envelope.payload,
            properties,
        )
        .await
        .map_err(|e| PublisherError::GenericError(e.into()))?
        .await
        .map_err(|e| PublisherError::GenericError(e.into()))?;

    match confirm {
        Confirmation::Ack(ack) => {
            if let Some(return_message) = ack {
                // Reply Code 312 - NO_ROUTE
                // See https://www.rabbitmq.com/amqp-0-9-1-reference.html
                if return_message.reply_code == 312 {
                    return Err(PublisherError::UnroutableMessage(return_message));
                }
            }
            Ok(())
        }
        Confirmation::Nack(nack) => Err(PublisherError::NegativeAck(nack)),
        Confirmation::NotRequested => Ok(()),
    }
}

fn inject_amqp_properties(mut envelope: MessageEnvelope) -> MessageEnvelope {
    let current_timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .map(|ct| ct.as_secs());

    let props = envelope.properties;
    let props = if let Some(ct) = current_timestamp {
        let ts = *props.timestamp();
        props.with_timestamp(ts.unwrap_or(ct))
    } else {
        warn!("System time is before 1970");
        props
    };

    let message_id = props.message_id().clone();
    envelope.properties =
        props.with_message_id(message_id.unwrap_or_else(|| Uuid::new_v4().to_string().into()));

    envelope
}

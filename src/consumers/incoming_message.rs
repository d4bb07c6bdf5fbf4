use amq_protocol_types::{DeliveryTag, ShortString};
use lapin::{acker::Acker, BasicProperties};
use std::sync::Arc;

/// A dequeued message enriched with some auxiliary data, ready for processing.
///
/// `Incoming` is the input type of our message handler functions (check out
/// [`Handler`](crate::consumers::Handler)'s docs for more details).
pub struct Incoming<C> {
    /// `context` is a set of resources that are required to process the message and are outside
    /// the lifecycle of the message itself - e.g. an HTTP client for a third-party API, a db
    /// connection pool, etc.
    ///
    /// It is shared by all messages processed by the same consumer.
    pub context: Arc<C>,
    pub message: Delivery,
    /// The name of the queue.
    pub queue_name: String,
}

/// A received AMQP message.
#[derive(Debug, PartialEq)]
pub struct Delivery {
    pub delivery_tag: DeliveryTag,

    /// The exchange of the message. May be an empty string
    /// if the default exchange is used.
    pub exchange: ShortString,

    /// The routing key of the message. May be an empty string
    /// if no routing key is specified.
    pub routing_key: ShortString,

    pub redelivered: bool,

    /// Contains the properties and the headers of the
    /// message.
    pub properties: BasicProperties,

    /// The payload of the message in binary format.
    pub data: Vec<u8>,
}

/// Split a `lapin` delivery into the message handed to the handler and the acker kept by the
/// consumer.
///
/// Handlers never get to ack a message: AMQP forbids acking or rejecting the same delivery tag
/// twice.
pub(crate) fn split(delivery: lapin::message::Delivery) -> (Delivery, Acker) {
    let acker = delivery.acker;
    let message = Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange,
        routing_key: delivery.routing_key,
        redelivered: delivery.redelivered,
        properties: delivery.properties,
        data: delivery.data,
    };
    (message, acker)
}

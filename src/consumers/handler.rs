//! The `Handler` trait is heavily inspired by `tide`'s approach to endpoint handlers.
use crate::consumers::Incoming;
use std::future::Future;

/// What the consumer should tell the broker once a message has been handled.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    /// The message was processed: remove it from the queue.
    Ack,
    /// Reject the message without requeueing it.
    /// It ends up in the dead letter exchange, if one is configured.
    NackDiscard,
    /// Reject the message and put it back in the queue.
    NackRequeue,
}

/// The outcome of handling a message: an [`Action`] and, optionally, a reply.
///
/// The reply is only sent if the incoming message carries a `reply_to` property.
/// It is published to the default exchange, using `reply_to` as routing key and propagating
/// the `correlation_id` of the request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcome {
    pub action: Action,
    pub reply: Option<Vec<u8>>,
}

impl Outcome {
    /// Ack the message and reply with `body`.
    pub fn reply(body: impl Into<Vec<u8>>) -> Self {
        Self {
            action: Action::Ack,
            reply: Some(body.into()),
        }
    }
}

impl From<Action> for Outcome {
    fn from(action: Action) -> Self {
        Self {
            action,
            reply: None,
        }
    }
}

/// Implementers of the `Handler` trait can be used by a [`Consumer`] to process messages
/// retrieved from a queue.
///
/// # Scope
///
/// `handle` does not get access to the underlying RabbitMq channel.
/// The consumer takes care of acking/nacking the message with the broker according to the
/// [`Outcome`] returned by the handler.
///
/// # Implementors
///
/// While you can implement `Handler` for a struct or enum, most of the time you will be relying
/// on our implementation of `Handler` for async functions with a matching signature,
/// `Fn(Incoming<Context>) -> impl Future<Output = impl Into<Outcome>>`, via [`ClosureHandler`].
///
/// [`Consumer`]: crate::consumers::Consumer
#[async_trait::async_trait]
pub trait Handler<Context>: Send + Sync + 'static {
    async fn handle(&self, incoming: Incoming<Context>) -> Outcome;
}

/// Wrapper type to turn an async function into a [`Handler`].
pub struct ClosureHandler<F>(pub F);

#[async_trait::async_trait]
impl<Context, F, Fut, O> Handler<Context> for ClosureHandler<F>
where
    Context: Send + Sync + 'static,
    F: Fn(Incoming<Context>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
    O: Into<Outcome> + Send + 'static,
{
    async fn handle(&self, incoming: Incoming<Context>) -> Outcome {
        (self.0)(incoming).await.into()
    }
}

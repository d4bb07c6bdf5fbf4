use crate::{
    amqp::AmqpChannel,
    consumers::{
        handler::{Action, ClosureHandler, Handler, Outcome},
        incoming_message::{split, Incoming},
    },
    dispatcher::Subscription,
    error::ChannelFailure,
    manager::{ChannelManager, ManagerState},
    publishers::{publish, MessageEnvelope},
    transport::ConnectionPool,
};
use amq_protocol_types::FieldTable;
use futures_util::{stream::FuturesUnordered, Future, FutureExt, StreamExt};
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, QueueDeclareOptions,
    },
};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

/// A RabbitMq consumer that survives channel recoveries.
///
/// `Consumer` registers its handler on the current channel of a [`ChannelManager`].
/// Every time the manager recovers the channel, the consumer registers again on the new one.
///
/// If the broker cancels the consumer (e.g. the queue was deleted), `Consumer` reports the
/// cancellation to the channel, which in turn makes the manager recover it.
pub struct Consumer<C, P>
where
    C: Send + Sync + 'static,
    P: ConnectionPool<Channel = AmqpChannel>,
{
    manager: Arc<ChannelManager<P>>,
    queue_name: String,
    prefetch_count: u16,
    queue_declaration: Option<QueueDeclaration>,
    context: Arc<C>,
    handler: Arc<dyn Handler<C>>,
}

enum Interruption {
    Shutdown,
    Recovered(ChannelFailure),
    ManagerClosed,
}

impl<C, P> Consumer<C, P>
where
    C: Send + Sync + 'static,
    P: ConnectionPool<Channel = AmqpChannel>,
{
    /// Start building a [`Consumer`] for `queue_name`.
    pub fn builder(
        manager: Arc<ChannelManager<P>>,
        queue_name: impl Into<String>,
        context: impl Into<Arc<C>>,
    ) -> ConsumerBuilder<C, P> {
        ConsumerBuilder {
            manager,
            queue_name: queue_name.into(),
            prefetch_count: 1,
            queue_declaration: None,
            context: context.into(),
        }
    }

    /// Consume messages until `shutdown` resolves or the channel manager is closed.
    ///
    /// It fails if the handler cannot be registered on the channel the first time around.
    /// Registration failures after a recovery are logged: the consumer waits for the next
    /// recovery to try again.
    #[tracing::instrument(skip_all, name = "consumer_run", fields(queue_name = %self.queue_name))]
    pub async fn run_until_shutdown(
        self,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), anyhow::Error> {
        // Subscribe before registering: a recovery cannot slip in between.
        let mut recoveries = self.manager.subscribe();
        let mut state = self.manager.watch_state();
        let shutdown = shutdown.fuse();
        tokio::pin!(shutdown);

        let mut in_flight = FuturesUnordered::new();
        let mut first_registration = true;

        let result = 'registration: loop {
            let channel = self.manager.channel().await;
            let consumer_tag = Uuid::new_v4().to_string();
            let mut deliveries = match self.register(&channel, &consumer_tag).await {
                Ok(deliveries) => deliveries,
                Err(e) if first_registration => break 'registration Err(e),
                Err(e) => {
                    tracing::error!(error = ?e, "Failed to register the consumer after a recovery");
                    match wait(&mut shutdown, &mut recoveries, &mut state).await {
                        Interruption::Recovered(_) => continue 'registration,
                        _ => break 'registration Ok(()),
                    }
                }
            };
            first_registration = false;

            let interruption = loop {
                tokio::select! {
                    biased;

                    _ = &mut shutdown => {
                        tracing::info!("Consumer received shutdown event");
                        let _ = channel
                            .raw()
                            .basic_cancel(&consumer_tag, BasicCancelOptions::default())
                            .await;
                        break Interruption::Shutdown;
                    }

                    failure = recoveries.recv() => {
                        let Some(failure) = failure else {
                            break Interruption::ManagerClosed;
                        };
                        // Notifications can pile up: we might already be on the latest channel.
                        if self.manager.is_current(&channel).await {
                            tracing::debug!(cause = %failure, "Already registered on the recovered channel");
                            continue;
                        }
                        // The stale channel is closed by the manager, this is best-effort.
                        if let Err(e) = channel
                            .raw()
                            .basic_cancel(&consumer_tag, BasicCancelOptions::default())
                            .await
                        {
                            tracing::debug!(error = %e, "Failed to cancel the consumer on the stale channel");
                        }
                        break Interruption::Recovered(failure);
                    }

                    _ = in_flight.next(), if !in_flight.is_empty() => {}

                    delivery = deliveries.next() => match delivery {
                        Some(Ok(delivery)) => {
                            in_flight.push(tokio::spawn(Self::process(
                                delivery,
                                Arc::clone(&channel),
                                Arc::clone(&self.context),
                                Arc::clone(&self.handler),
                                self.queue_name.clone(),
                            )));
                        }
                        Some(Err(e)) => {
                            tracing::error!(error = %e, "Consumer error, waiting for the channel to be recovered");
                            break wait(&mut shutdown, &mut recoveries, &mut state).await;
                        }
                        None => {
                            // The stream ends if the broker cancels the consumer.
                            tracing::error!(%consumer_tag, "Consumer cancelled by the broker");
                            channel.report_cancellation(format!(
                                "consumer {consumer_tag} on queue {} was cancelled",
                                self.queue_name
                            ));
                            break wait(&mut shutdown, &mut recoveries, &mut state).await;
                        }
                    }
                }
            };

            match interruption {
                Interruption::Recovered(failure) => {
                    tracing::warn!(cause = %failure, "Channel recovered, registering the consumer again");
                }
                Interruption::Shutdown | Interruption::ManagerClosed => break 'registration Ok(()),
            }
        };

        // Make sure all tasks in flight complete before returning.
        while in_flight.next().await.is_some() {}

        result
    }

    async fn register(
        &self,
        channel: &AmqpChannel,
        consumer_tag: &str,
    ) -> Result<lapin::Consumer, anyhow::Error> {
        // The queue might be gone: that's often why the channel had to be recovered.
        if let Some(declaration) = &self.queue_declaration {
            declaration.declare(channel, &self.queue_name).await?;
        }
        channel
            .raw()
            .basic_qos(self.prefetch_count, BasicQosOptions { global: false })
            .await?;
        let consumer = channel
            .raw()
            .basic_consume(
                &self.queue_name,
                consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(consumer)
    }

    /// Run the handler, reply if requested, ack/nack against the broker.
    #[tracing::instrument(
        name = "process_message",
        skip_all,
        fields(queue_name = %queue_name),
        level = tracing::Level::DEBUG
    )]
    async fn process(
        delivery: lapin::message::Delivery,
        channel: Arc<AmqpChannel>,
        context: Arc<C>,
        handler: Arc<dyn Handler<C>>,
        queue_name: String,
    ) {
        let (message, acker) = split(delivery);
        let reply_to = message.properties.reply_to().clone();
        let correlation_id = message.properties.correlation_id().clone();

        let Outcome { action, reply } = handler
            .handle(Incoming {
                context,
                message,
                queue_name,
            })
            .await;

        if let (Some(body), Some(reply_to)) = (reply, reply_to) {
            let mut envelope = MessageEnvelope::default()
                .with_payload(body)
                .with_routing_key(reply_to.as_str().to_owned());
            if let Some(correlation_id) = correlation_id {
                envelope = envelope.with_correlation_id(correlation_id);
            }
            if let Err(e) = publish(&channel, &envelope, BasicPublishOptions::default()).await {
                tracing::error!(error = ?e, "Failed to publish the reply");
            }
        }

        settle(&acker, action).await;
    }
}

async fn settle(acker: &Acker, action: Action) {
    let outcome = match action {
        Action::Ack => acker.ack(BasicAckOptions::default()).await.map(drop),
        Action::NackDiscard => acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue: false,
            })
            .await
            .map(drop),
        Action::NackRequeue => acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue: true,
            })
            .await
            .map(drop),
    };
    if let Err(e) = outcome {
        tracing::error!(error = %e, ?action, "Failed to settle the message with the broker");
    }
}

/// Wait until the channel is usable again, or until there is no point in waiting anymore.
async fn wait(
    shutdown: impl Future<Output = ()> + Unpin,
    recoveries: &mut Subscription<ChannelFailure>,
    state: &mut watch::Receiver<ManagerState>,
) -> Interruption {
    tokio::select! {
        biased;

        _ = shutdown => Interruption::Shutdown,
        failure = recoveries.recv() => match failure {
            Some(failure) => Interruption::Recovered(failure),
            None => Interruption::ManagerClosed,
        },
        _ = state.wait_for(|state| *state == ManagerState::Closed) => Interruption::ManagerClosed,
    }
}

/// How a [`Consumer`] declares its queue.
///
/// Declaring is idempotent as long as the options and arguments match those of the existing
/// queue: the broker closes the channel otherwise.
#[derive(Clone, Debug)]
pub struct QueueDeclaration {
    pub options: QueueDeclareOptions,
    pub arguments: FieldTable,
}

impl QueueDeclaration {
    /// A durable queue, surviving broker restarts.
    pub fn durable() -> Self {
        Self {
            options: QueueDeclareOptions {
                passive: false,
                durable: true,
                exclusive: false,
                auto_delete: false,
                nowait: false,
            },
            arguments: FieldTable::default(),
        }
    }

    /// A queue deleted by the broker once its last consumer goes away.
    pub fn auto_delete() -> Self {
        Self {
            options: QueueDeclareOptions {
                passive: false,
                durable: false,
                exclusive: false,
                auto_delete: true,
                nowait: false,
            },
            arguments: FieldTable::default(),
        }
    }

    /// Use `arguments` when declaring the queue (e.g. `x-dead-letter-exchange`).
    #[must_use]
    pub fn with_arguments(mut self, arguments: FieldTable) -> Self {
        self.arguments = arguments;
        self
    }

    /// Declare `queue_name` on `channel`.
    pub async fn declare(
        &self,
        channel: &AmqpChannel,
        queue_name: &str,
    ) -> Result<(), anyhow::Error> {
        channel
            .raw()
            .queue_declare(queue_name, self.options, self.arguments.clone())
            .await?;
        Ok(())
    }
}

/// A builder for [`Consumer`].
///
/// Use [`Consumer::builder`] as entrypoint.
pub struct ConsumerBuilder<C, P>
where
    C: Send + Sync + 'static,
    P: ConnectionPool<Channel = AmqpChannel>,
{
    manager: Arc<ChannelManager<P>>,
    queue_name: String,
    prefetch_count: u16,
    queue_declaration: Option<QueueDeclaration>,
    context: Arc<C>,
}

impl<C, P> ConsumerBuilder<C, P>
where
    C: Send + Sync + 'static,
    P: ConnectionPool<Channel = AmqpChannel>,
{
    /// How many unacknowledged messages the broker pushes to the consumer.
    /// It bounds the number of messages processed concurrently.
    ///
    /// Defaults to 1.
    #[must_use]
    pub fn prefetch_count(mut self, prefetch_count: u16) -> Self {
        self.prefetch_count = prefetch_count;
        self
    }

    /// Declare the queue every time the consumer registers, before consuming from it.
    ///
    /// Without a declaration the queue must already exist: if it is deleted, the consumer
    /// cannot register again until somebody else declares it.
    #[must_use]
    pub fn declare_queue(mut self, declaration: QueueDeclaration) -> Self {
        self.queue_declaration = Some(declaration);
        self
    }

    /// Use an async function to process messages.
    pub fn handler<F, Fut, O>(self, handler: F) -> Consumer<C, P>
    where
        F: Fn(Incoming<C>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = O> + Send + 'static,
        O: Into<Outcome> + Send + 'static,
    {
        self.dyn_handler(Arc::new(ClosureHandler(handler)))
    }

    pub fn dyn_handler(self, handler: Arc<dyn Handler<C>>) -> Consumer<C, P> {
        Consumer {
            manager: self.manager,
            queue_name: self.queue_name,
            prefetch_count: self.prefetch_count,
            queue_declaration: self.queue_declaration,
            context: self.context,
            handler,
        }
    }
}

//! These tests run against the RabbitMq broker listening on `localhost:5672`
//! (e.g. `docker run -p 5672:5672 rabbitmq:3`).
use crate::helpers::{get_amqp_manager, get_publisher};
use amq_protocol_types::{AMQPValue, FieldTable, LongString, ShortString};
use carrot_keeper::amqp::options::{BasicConsumeOptions, QueueDeclareOptions, QueueDeleteOptions};
use carrot_keeper::consumers::{Action, Consumer, Delivery, Incoming, Outcome, QueueDeclaration};
use carrot_keeper::pool::AmqpConnectionPool;
use carrot_keeper::publishers::{MessageEnvelope, PublisherError};
use carrot_keeper::{ChannelFailure, ChannelManager};
use futures_util::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use uuid::Uuid;

type Manager = Arc<ChannelManager<AmqpConnectionPool>>;

const PATIENCE: Duration = Duration::from_secs(10);

#[derive(Clone)]
struct Context {
    deliveries: mpsc::UnboundedSender<Delivery>,
}

struct RunningConsumer {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<Result<(), anyhow::Error>>,
    deliveries: mpsc::UnboundedReceiver<Delivery>,
}

impl RunningConsumer {
    async fn next_delivery(&mut self) -> Delivery {
        timeout(PATIENCE, self.deliveries.recv())
            .await
            .expect("no message was handled in time")
            .unwrap()
    }

    async fn stop(self) {
        let _ = self.stop.send(());
        self.handle.await.unwrap().unwrap();
    }
}

fn spawn_consumer<F, Fut, O>(
    manager: &Manager,
    queue_name: &str,
    declaration: QueueDeclaration,
    handler: F,
) -> RunningConsumer
where
    F: Fn(Incoming<Context>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = O> + Send + 'static,
    O: Into<Outcome> + Send + 'static,
{
    let (sender, deliveries) = mpsc::unbounded_channel();
    let (stop, stopped) = oneshot::channel();
    let consumer = Consumer::builder(
        Arc::clone(manager),
        queue_name,
        Context { deliveries: sender },
    )
    .prefetch_count(10)
    .declare_queue(declaration)
    .handler(handler);
    let handle = tokio::spawn(consumer.run_until_shutdown(async move {
        let _ = stopped.await;
    }));
    RunningConsumer {
        stop,
        handle,
        deliveries,
    }
}

/// Neither durable nor auto-deleted: it outlives its consumers, so that we can inspect it.
fn inspectable_queue() -> QueueDeclaration {
    QueueDeclaration {
        options: QueueDeclareOptions::default(),
        arguments: FieldTable::default(),
    }
}

/// Returns the number of ready messages and the number of consumers.
async fn inspect(manager: &Manager, queue_name: &str) -> (u32, u32) {
    let queue = manager
        .channel()
        .await
        .raw()
        .queue_declare(
            queue_name,
            QueueDeclareOptions {
                passive: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .unwrap();
    (queue.message_count(), queue.consumer_count())
}

async fn delete(manager: &Manager, queue_name: &str) {
    manager
        .channel()
        .await
        .raw()
        .queue_delete(queue_name, QueueDeleteOptions::default())
        .await
        .unwrap();
}

/// Make the broker close the channel of `manager` with a 404.
async fn break_channel(manager: &Manager) {
    let outcome = manager
        .channel()
        .await
        .raw()
        .queue_declare(
            &Uuid::new_v4().to_string(),
            QueueDeclareOptions {
                passive: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await;
    assert!(outcome.is_err());
}

fn message(queue_name: &str, payload: &str) -> MessageEnvelope {
    MessageEnvelope::default()
        .with_payload(payload.as_bytes().to_vec())
        .with_routing_key(queue_name.to_owned())
}

async fn forward(incoming: Incoming<Context>) -> Action {
    let _ = incoming.context.deliveries.send(incoming.message);
    Action::Ack
}

#[tokio::test]
async fn acked_messages_are_removed_from_the_queue() {
    // Arrange
    let client = get_amqp_manager().await;
    let server = get_amqp_manager().await;
    let queue_name = Uuid::new_v4().to_string();
    inspectable_queue()
        .declare(&*client.channel().await, &queue_name)
        .await
        .unwrap();
    let mut consumer = spawn_consumer(&server, &queue_name, inspectable_queue(), forward);

    // Act
    get_publisher(&client)
        .publish(message(&queue_name, "hello"))
        .await
        .unwrap();
    let delivery = consumer.next_delivery().await;
    consumer.stop().await;
    // Unacked messages would go back to the queue once the channel is closed.
    server.close().await.unwrap();

    // Assert
    assert_eq!(delivery.data, b"hello");
    assert_eq!(inspect(&client, &queue_name).await, (0, 0));
    delete(&client, &queue_name).await;
}

#[tokio::test]
async fn requeued_messages_are_delivered_again() {
    // Arrange
    let client = get_amqp_manager().await;
    let server = get_amqp_manager().await;
    let queue_name = Uuid::new_v4().to_string();
    inspectable_queue()
        .declare(&*client.channel().await, &queue_name)
        .await
        .unwrap();
    let mut consumer = spawn_consumer(
        &server,
        &queue_name,
        inspectable_queue(),
        |incoming: Incoming<Context>| async move {
            let action = if incoming.message.redelivered {
                Action::Ack
            } else {
                Action::NackRequeue
            };
            let _ = incoming.context.deliveries.send(incoming.message);
            action
        },
    );

    // Act
    get_publisher(&client)
        .publish(message(&queue_name, "try again"))
        .await
        .unwrap();
    let first = consumer.next_delivery().await;
    let second = consumer.next_delivery().await;
    consumer.stop().await;
    server.close().await.unwrap();

    // Assert
    assert!(!first.redelivered);
    assert!(second.redelivered);
    assert_eq!(second.data, b"try again");
    assert_eq!(inspect(&client, &queue_name).await, (0, 0));
    delete(&client, &queue_name).await;
}

#[tokio::test]
async fn discarded_messages_are_dead_lettered_instead_of_requeued() {
    // Arrange
    let client = get_amqp_manager().await;
    let server = get_amqp_manager().await;
    let queue_name = Uuid::new_v4().to_string();
    let dead_letter_queue = format!("{queue_name}.dlq");
    inspectable_queue()
        .declare(&*client.channel().await, &dead_letter_queue)
        .await
        .unwrap();
    let mut arguments = FieldTable::default();
    arguments.insert(
        ShortString::from("x-dead-letter-exchange"),
        AMQPValue::LongString(LongString::from("")),
    );
    arguments.insert(
        ShortString::from("x-dead-letter-routing-key"),
        AMQPValue::LongString(LongString::from(dead_letter_queue.as_str())),
    );
    let declaration = inspectable_queue().with_arguments(arguments);
    declaration
        .declare(&*client.channel().await, &queue_name)
        .await
        .unwrap();
    let mut consumer = spawn_consumer(
        &server,
        &queue_name,
        declaration,
        |incoming: Incoming<Context>| async move {
            let _ = incoming.context.deliveries.send(incoming.message);
            Action::NackDiscard
        },
    );

    // Act
    get_publisher(&client)
        .publish(message(&queue_name, "poison"))
        .await
        .unwrap();
    consumer.next_delivery().await;
    consumer.stop().await;
    server.close().await.unwrap();

    // Assert
    timeout(PATIENCE, async {
        while inspect(&client, &dead_letter_queue).await.0 != 1 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await
    .expect("the message never reached the dead letter queue");
    assert_eq!(inspect(&client, &queue_name).await, (0, 0));
    delete(&client, &queue_name).await;
    delete(&client, &dead_letter_queue).await;
}

#[tokio::test]
async fn replies_are_sent_to_reply_to_with_the_request_correlation_id() {
    // Arrange
    let client = get_amqp_manager().await;
    let server = get_amqp_manager().await;
    let queue_name = Uuid::new_v4().to_string();
    QueueDeclaration::auto_delete()
        .declare(&*client.channel().await, &queue_name)
        .await
        .unwrap();
    let consumer = spawn_consumer(
        &server,
        &queue_name,
        QueueDeclaration::auto_delete(),
        |incoming: Incoming<Context>| async move {
            Outcome::reply(String::from_utf8_lossy(&incoming.message.data).to_uppercase())
        },
    );

    let channel = client.channel().await;
    let reply_queue = channel
        .raw()
        .queue_declare(
            "",
            QueueDeclareOptions {
                exclusive: true,
                auto_delete: true,
                ..QueueDeclareOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .unwrap();
    let mut replies = channel
        .raw()
        .basic_consume(
            reply_queue.name().as_str(),
            "rpc-client",
            BasicConsumeOptions {
                no_ack: true,
                ..BasicConsumeOptions::default()
            },
            FieldTable::default(),
        )
        .await
        .unwrap();
    let correlation_id = Uuid::new_v4().to_string();

    // Act
    get_publisher(&client)
        .publish(
            message(&queue_name, "ping")
                .with_reply_to(reply_queue.name().clone())
                .with_correlation_id(correlation_id.as_str().into()),
        )
        .await
        .unwrap();
    let reply = timeout(PATIENCE, replies.next())
        .await
        .expect("no reply in time")
        .unwrap()
        .unwrap();
    consumer.stop().await;

    // Assert
    assert_eq!(reply.data, b"PING");
    assert_eq!(
        reply.properties.correlation_id().as_ref().map(|id| id.as_str()),
        Some(correlation_id.as_str())
    );
}

#[tokio::test]
async fn the_consumer_resumes_after_its_channel_is_closed_by_the_broker() {
    // Arrange
    let client = get_amqp_manager().await;
    let server = get_amqp_manager().await;
    let queue_name = Uuid::new_v4().to_string();
    inspectable_queue()
        .declare(&*client.channel().await, &queue_name)
        .await
        .unwrap();
    let mut consumer = spawn_consumer(&server, &queue_name, inspectable_queue(), forward);
    let publisher = get_publisher(&client);
    publisher
        .publish(message(&queue_name, "before"))
        .await
        .unwrap();
    consumer.next_delivery().await;
    let mut recoveries = server.subscribe();

    // Act
    break_channel(&server).await;
    let failure = timeout(PATIENCE, recoveries.recv())
        .await
        .expect("the channel was not recovered in time")
        .unwrap();
    publisher
        .publish(message(&queue_name, "after"))
        .await
        .unwrap();
    let delivery = consumer.next_delivery().await;

    // Assert
    assert!(matches!(failure, ChannelFailure::Closed { .. }));
    assert_eq!(delivery.data, b"after");
    assert_eq!(inspect(&client, &queue_name).await.1, 1);
    consumer.stop().await;
    delete(&client, &queue_name).await;
}

#[tokio::test]
async fn back_to_back_recoveries_leave_a_single_registration_behind() {
    // Arrange
    let client = get_amqp_manager().await;
    let server = get_amqp_manager().await;
    let queue_name = Uuid::new_v4().to_string();
    inspectable_queue()
        .declare(&*client.channel().await, &queue_name)
        .await
        .unwrap();
    let mut consumer = spawn_consumer(&server, &queue_name, inspectable_queue(), forward);
    let publisher = get_publisher(&client);
    publisher
        .publish(message(&queue_name, "warm-up"))
        .await
        .unwrap();
    consumer.next_delivery().await;
    let mut recoveries = server.subscribe();

    // Act
    for _ in 0..2 {
        break_channel(&server).await;
        timeout(PATIENCE, recoveries.recv())
            .await
            .expect("the channel was not recovered in time")
            .unwrap();
    }
    for i in 0..5 {
        publisher
            .publish(message(&queue_name, &i.to_string()))
            .await
            .unwrap();
    }
    for _ in 0..5 {
        consumer.next_delivery().await;
    }

    // Assert
    assert_eq!(server.reconnection_count(), 2);
    assert_eq!(inspect(&client, &queue_name).await, (0, 1));
    consumer.stop().await;
    server.close().await.unwrap();
    assert_eq!(inspect(&client, &queue_name).await, (0, 0));
    delete(&client, &queue_name).await;
}

#[tokio::test]
async fn a_deleted_queue_is_declared_again_after_the_broker_cancels_the_consumer() {
    // Arrange
    let client = get_amqp_manager().await;
    let server = get_amqp_manager().await;
    let queue_name = Uuid::new_v4().to_string();
    inspectable_queue()
        .declare(&*client.channel().await, &queue_name)
        .await
        .unwrap();
    let mut consumer = spawn_consumer(&server, &queue_name, inspectable_queue(), forward);
    let publisher = get_publisher(&client);
    publisher
        .publish(message(&queue_name, "before"))
        .await
        .unwrap();
    consumer.next_delivery().await;
    let mut recoveries = server.subscribe();

    // Act
    delete(&client, &queue_name).await;
    let failure = timeout(PATIENCE, recoveries.recv())
        .await
        .expect("the cancellation did not trigger a recovery")
        .unwrap();
    // The consumer declares the queue again when it registers on the new channel.
    timeout(PATIENCE, async {
        loop {
            match publisher.publish(message(&queue_name, "after")).await {
                Ok(()) => break,
                Err(PublisherError::UnroutableMessage(_)) => {
                    tokio::time::sleep(Duration::from_millis(100)).await
                }
                Err(e) => panic!("unexpected publishing error: {e}"),
            }
        }
    })
    .await
    .expect("the queue was never declared again");
    let delivery = consumer.next_delivery().await;

    // Assert
    assert!(matches!(failure, ChannelFailure::Cancelled { .. }));
    assert_eq!(delivery.data, b"after");
    consumer.stop().await;
    delete(&client, &queue_name).await;
}

#[tokio::test]
async fn publishing_a_message_nobody_listens_to_fails() {
    let client = get_amqp_manager().await;

    let outcome = get_publisher(&client)
        .publish(message(&Uuid::new_v4().to_string(), "lost"))
        .await;

    assert!(matches!(outcome, Err(PublisherError::UnroutableMessage(_))));
}

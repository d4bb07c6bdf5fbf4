//! An RPC server computing Fibonacci numbers, consuming requests from `rpc_queue`.
//!
//! Run it against the default RabbitMq Docker image, then publish a request with a `reply_to`
//! and a `correlation_id`: the answer is published to the `reply_to` queue.
//! Restart the broker (or delete `rpc_queue`) while it runs to see the channel being recovered:
//! the queue is declared again every time the consumer registers.
use carrot_keeper::amqp::{configuration::RabbitMqSettings, ConnectionFactory};
use carrot_keeper::consumers::{Action, Consumer, Incoming, Outcome, QueueDeclaration};
use carrot_keeper::pool::{AmqpConnectionPool, ConnectionPool};
use carrot_keeper::{ChannelManager, ChannelManagerSettings};
use shutdown_handler::ShutdownHandler;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const QUEUE_NAME: &str = "rpc_queue";

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let settings = RabbitMqSettings::default();
    let connection_pool =
        ConnectionPool::builder(ConnectionFactory::new_from_config(&settings)?)
            .max_size(settings.max_connections())
            .build()?;
    let manager = Arc::new(
        ChannelManager::new(
            AmqpConnectionPool::new(connection_pool),
            &ChannelManagerSettings::default(),
        )
        .await?,
    );

    let mut recoveries = manager.subscribe();
    tokio::spawn(async move {
        while let Some(failure) = recoveries.recv().await {
            tracing::warn!(cause = %failure, "The channel has been recovered");
        }
    });

    let shutdown = ShutdownHandler::sigterm()?;
    tracing::info!("Awaiting RPC requests");
    Consumer::builder(Arc::clone(&manager), QUEUE_NAME, ())
        .prefetch_count(1)
        .declare_queue(QueueDeclaration::durable())
        .handler(handle)
        .run_until_shutdown(shutdown.wait_for_signal())
        .await?;

    manager.close().await?;
    Ok(())
}

async fn handle(incoming: Incoming<()>) -> Outcome {
    let n = match std::str::from_utf8(&incoming.message.data)
        .ok()
        .and_then(|body| body.trim().parse::<u32>().ok())
    {
        Some(n) => n,
        None => {
            tracing::warn!("Discarding a request that is not a number");
            return Action::NackDiscard.into();
        }
    };
    tracing::info!(n, "Computing fib(n)");
    match fib(n) {
        Some(result) => Outcome::reply(result.to_string()),
        None => {
            tracing::warn!(n, "fib(n) does not fit in a u64");
            Action::NackDiscard.into()
        }
    }
}

fn fib(n: u32) -> Option<u64> {
    let (mut current, mut next) = (0u64, Some(1u64));
    for _ in 0..n {
        let following = next?;
        next = current.checked_add(following);
        current = following;
    }
    Some(current)
}

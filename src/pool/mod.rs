//! Connection pooling for a [`lapin::Connection`] using [`deadpool`], exposed as a
//! [`ConnectionPool`](crate::transport::ConnectionPool) for the channel manager.
//!
//! ```rust
//! use carrot_keeper::amqp::configuration::RabbitMqSettings;
//! use carrot_keeper::amqp::ConnectionFactory;
//! use carrot_keeper::pool::{AmqpConnectionPool, ConnectionPool};
//! use carrot_keeper::{ChannelManager, ChannelManagerSettings};
//!
//! // Function for asyncness.
//! async fn example() -> anyhow::Result<()> {
//!     let settings = RabbitMqSettings::default();
//!
//!     let connection_pool = ConnectionPool::builder(ConnectionFactory::new_from_config(&settings)?)
//!         .max_size(settings.max_connections())
//!         .build()?;
//!
//!     let manager = ChannelManager::new(
//!         AmqpConnectionPool::new(connection_pool),
//!         &ChannelManagerSettings::default(),
//!     )
//!     .await?;
//!     let channel = manager.channel().await;
//!     Ok(())
//! }
//! ```

mod connection;
mod error;

pub use connection::{ConnectionPool, PooledConnection};
pub use error::Error;

use crate::amqp::AmqpChannel;
use crate::transport;
use lapin::options::ConfirmSelectOptions;

/// Opens [`AmqpChannel`]s on connections checked out from a [`ConnectionPool`].
///
/// By default, all channels will have publisher confirmations enabled,
/// but you can opt out using [`AmqpConnectionPool::without_publisher_confirmations`].
#[derive(Clone)]
pub struct AmqpConnectionPool {
    pool: ConnectionPool,
    publisher_confirms: bool,
}

impl AmqpConnectionPool {
    pub fn new(pool: ConnectionPool) -> Self {
        Self {
            pool,
            publisher_confirms: true,
        }
    }

    #[must_use]
    pub fn without_publisher_confirmations(mut self) -> Self {
        self.publisher_confirms = false;
        self
    }

    pub fn publisher_confirms(&self) -> bool {
        self.publisher_confirms
    }
}

/// A connection checked out from an [`AmqpConnectionPool`].
pub struct AmqpConnection {
    connection: PooledConnection,
    publisher_confirms: bool,
}

#[async_trait::async_trait]
impl transport::ConnectionPool for AmqpConnectionPool {
    type Channel = AmqpChannel;
    type Connection = AmqpConnection;

    async fn checkout(&self) -> Result<AmqpConnection, anyhow::Error> {
        let connection = self.pool.get().await.map_err(Error::from)?;
        Ok(AmqpConnection {
            connection,
            publisher_confirms: self.publisher_confirms,
        })
    }
}

#[async_trait::async_trait]
impl transport::Connection for AmqpConnection {
    type Channel = AmqpChannel;

    #[tracing::instrument(name = "rabbitmq_create_channel", skip(self))]
    async fn open_channel(&self) -> Result<AmqpChannel, anyhow::Error> {
        let channel = self.connection.create_channel().await?;
        if self.publisher_confirms {
            // See https://www.rabbitmq.com/amqp-0-9-1-reference.html#confirm.select.nowait
            channel
                .confirm_select(ConfirmSelectOptions { nowait: false })
                .await?;
        }
        Ok(AmqpChannel::new(channel))
    }
}

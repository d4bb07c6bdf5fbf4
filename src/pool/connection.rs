//! Implements [`Manager`] for [`lapin::Connection`].
use crate::amqp::ConnectionFactory;
use deadpool::managed::{self, Manager};
use lapin::ConnectionState;

/// A `deadpool` pool of [`lapin::Connection`]s.
pub type ConnectionPool = deadpool::managed::Pool<ConnectionFactory>;

/// A [`lapin::Connection`] checked out from a [`ConnectionPool`].
///
/// It goes back to the pool when dropped.
pub type PooledConnection = deadpool::managed::Object<ConnectionFactory>;

#[async_trait::async_trait]
impl Manager for ConnectionFactory {
    type Type = lapin::Connection;
    type Error = super::Error;

    async fn create(&self) -> Result<lapin::Connection, super::Error> {
        Ok(self.new_connection().await?)
    }

    // Broken connections are dropped here and replaced on the next checkout: the pool takes care
    // of transport-level reconnection.
    async fn recycle(&self, obj: &mut lapin::Connection) -> managed::RecycleResult<super::Error> {
        match obj.status().state() {
            ConnectionState::Connected => Ok(()),
            state => Err(managed::RecycleError::Message(format!(
                "Connection is not in an healthy state {state:?}",
            ))),
        }
    }
}

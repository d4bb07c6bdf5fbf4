//! Helpers for connecting to a rabbitmq broker

mod channel;
pub mod configuration;
mod factory;

pub use channel::{AmqpChannel, HealthStatus};
pub use factory::{ConnectError, ConnectionFactory};
pub use lapin::{options, types, BasicProperties};

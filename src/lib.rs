//! `carrot-keeper` keeps a RabbitMq channel alive, built on top of [`lapin`].
//!
//! Channels die: the broker closes them when something goes wrong, cancels consumers when
//! their queue is deleted, the network drops.
//! [`ChannelManager`] owns a channel, notices when it dies and replaces it, retrying until it
//! succeeds. Once the channel has been recovered, subscribers are notified with the original
//! failure, so that they can register again on the new channel.
//!
//! [`consumers::Consumer`] and [`publishers::Publisher`] are built on top of [`ChannelManager`]
//! and take care of this for you.
//!
//! ## Examples
//!
//! Check the `demos` directory to see the library in action.

pub mod amqp;
pub mod consumers;
pub mod dispatcher;
mod error;
pub mod manager;
pub mod pool;
pub mod publishers;
pub mod transport;

pub use dispatcher::{Dispatcher, Subscription};
pub use error::{ChannelFailure, ManagerError, ReplyCode};
pub use manager::{ChannelManager, ChannelManagerSettings, ManagerState, ReconnectStrategy};

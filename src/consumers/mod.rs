//! Facilities to consume messages from a RabbitMq queue across channel recoveries.
//! Check out [`Consumer`] as a starting point.
pub use consumer::{Consumer, ConsumerBuilder, QueueDeclaration};
pub use handler::{Action, ClosureHandler, Handler, Outcome};
pub use incoming_message::{Delivery, Incoming};

mod consumer;
mod handler;
mod incoming_message;

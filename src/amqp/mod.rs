//! AMQP integration
//!
//! Broker connection, the player command consumer and the notification
//! transport publishing to the notification exchange.

pub mod connection;
pub mod handlers;
pub mod messages;
pub mod publisher;

pub use connection::{AmqpConfig, AmqpConnection};
pub use handlers::{CommandConsumer, CommandHandler, LadderCommandHandler};
pub use messages::*;
pub use publisher::{AmqpNotificationTransport, PublisherConfig};

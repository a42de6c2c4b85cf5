//! Outbound notifications
//!
//! The session manager renders a `Notification` for every observable change
//! and hands it to a `NotificationPublisher` after the change is committed.
//! The bus queues it per session and a `DeliveryTransport` takes it from there.

pub mod bus;
pub mod render;
pub mod transport;
pub mod types;

pub use bus::{NotificationBus, NotificationPublisher, NotificationReceiver};
pub use transport::{spawn_dispatchers, DeliveryTransport, LogTransport};
pub use types::{Notification, NotificationFile, NotificationKind, Recipient};

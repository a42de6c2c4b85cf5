//! Race Ladder - scheduled 1v1 racing sessions with Glicko-2 ladders
//!
//! Each league runs a session per schedule slot. Players join while the
//! session is joinable, get paired at random when preparation begins, race
//! the same seed, and have their ratings updated once both results are in.

pub mod amqp;
pub mod config;
pub mod error;
pub mod metrics;
pub mod notification;
pub mod rating;
pub mod service;
pub mod session;
pub mod store;
pub mod types;
pub mod utils;

// Re-export commonly used types and traits
pub use error::{LadderError, Result};
pub use types::*;

// Re-export key components
pub use notification::{NotificationBus, NotificationPublisher};
pub use rating::RatingEngine;
pub use session::{Scheduler, SessionManager};
pub use store::{InMemoryStore, LadderStore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

//! Configuration management for the race-ladder service
//!
//! This module handles configuration loading from environment variables and
//! TOML files, validation, and default values.

pub mod app;
pub mod league;
pub mod rating;

// Re-export commonly used types
pub use app::{
    validate_config, AmqpSettings, AppConfig, NotificationSettings, SchedulerSettings,
    ServiceSettings,
};
pub use league::LeagueConfig;
pub use rating::RatingConfig;

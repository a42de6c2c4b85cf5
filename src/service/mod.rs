//! Service layer for the ladder
//!
//! Application wiring, background task management and health checks.

pub mod app;
pub mod health;

pub use app::{sync_leagues, AppState, ServiceError};
pub use health::{HealthCheck, HealthStatus, ServiceStatus};

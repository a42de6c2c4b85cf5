//! Metrics and monitoring for the ladder service
//!
//! Prometheus collection plus the HTTP server exposing probes, metrics and
//! the read-only API.

pub mod collector;
pub mod health;

pub use collector::{
    MetricsCollector, MetricsTimer, NotificationMetrics, PerformanceMetrics, PlayerMetrics,
    RatingMetrics, SessionMetrics,
};
pub use health::{HealthServer, HealthServerConfig};

use std::sync::Arc;

/// Collector and HTTP server started and stopped together
#[derive(Clone)]
pub struct MetricsService {
    collector: Arc<MetricsCollector>,
    health_server: Arc<HealthServer>,
}

impl MetricsService {
    pub fn new(collector: Arc<MetricsCollector>, health_server: Arc<HealthServer>) -> Self {
        Self {
            collector,
            health_server,
        }
    }

    pub fn collector(&self) -> Arc<MetricsCollector> {
        self.collector.clone()
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.health_server.start().await
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.health_server.stop().await
    }
}

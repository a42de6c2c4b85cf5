//! Health checks
//!
//! Readiness and liveness probes over the shared service status and the
//! session manager's store.

use crate::session::SessionManager;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::debug;

/// Health check status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Gauge value exported to Prometheus
    pub fn as_gauge(self) -> u8 {
        match self {
            HealthStatus::Healthy => 2,
            HealthStatus::Degraded => 1,
            HealthStatus::Unhealthy => 0,
        }
    }

    /// Worst of two statuses
    fn combine(self, other: HealthStatus) -> HealthStatus {
        match (self, other) {
            (HealthStatus::Unhealthy, _) | (_, HealthStatus::Unhealthy) => HealthStatus::Unhealthy,
            (HealthStatus::Degraded, _) | (_, HealthStatus::Degraded) => HealthStatus::Degraded,
            _ => HealthStatus::Healthy,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Process-wide facts the probes read, shared between the service and the HTTP server
#[derive(Debug)]
pub struct ServiceStatus {
    name: String,
    started_at: Instant,
    running: RwLock<bool>,
    amqp_enabled: bool,
    amqp_connected: AtomicBool,
}

impl ServiceStatus {
    pub fn new(name: impl Into<String>, amqp_enabled: bool) -> Self {
        Self {
            name: name.into(),
            started_at: Instant::now(),
            running: RwLock::new(false),
            amqp_enabled,
            amqp_connected: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uptime(&self) -> std::time::Duration {
        self.started_at.elapsed()
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }

    pub async fn set_running(&self, running: bool) {
        *self.running.write().await = running;
    }

    pub fn set_amqp_connected(&self, connected: bool) {
        self.amqp_connected.store(connected, Ordering::SeqCst);
    }

    pub fn amqp_connected(&self) -> bool {
        self.amqp_connected.load(Ordering::SeqCst)
    }
}

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthCheck {
    pub status: HealthStatus,
    pub service: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub checks: Vec<ComponentCheck>,
    pub stats: ServiceStats,
}

/// Individual component health check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentCheck {
    pub name: String,
    pub status: HealthStatus,
    /// Why the component is not healthy
    pub message: Option<String>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServiceStats {
    pub leagues: usize,
    pub active_sessions: usize,
    pub uptime_seconds: u64,
}

impl HealthCheck {
    /// Full check of every component
    pub async fn check(status: &ServiceStatus, manager: &SessionManager) -> Result<Self> {
        let checks = vec![
            Self::check_service_running(status).await,
            Self::check_store(manager).await,
            Self::check_amqp(status),
        ];
        let overall = checks
            .iter()
            .fold(HealthStatus::Healthy, |acc, check| acc.combine(check.status));

        let stats = Self::gather_service_stats(status, manager).await;

        Ok(HealthCheck {
            status: overall,
            service: status.name().to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: chrono::Utc::now(),
            checks,
            stats,
        })
    }

    /// The process is up and has not begun shutting down
    pub async fn liveness_check(status: &ServiceStatus) -> HealthStatus {
        if status.is_running().await {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        }
    }

    /// Running, and the store answers
    pub async fn readiness_check(status: &ServiceStatus, manager: &SessionManager) -> HealthStatus {
        if !status.is_running().await {
            return HealthStatus::Unhealthy;
        }
        Self::check_store(manager)
            .await
            .status
            .combine(Self::check_amqp(status).status)
    }

    async fn check_service_running(status: &ServiceStatus) -> ComponentCheck {
        let start = Instant::now();
        let (health, message) = if status.is_running().await {
            (HealthStatus::Healthy, None)
        } else {
            (
                HealthStatus::Unhealthy,
                Some("Service is not running".to_string()),
            )
        };

        ComponentCheck {
            name: "service_running".to_string(),
            status: health,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    async fn check_store(manager: &SessionManager) -> ComponentCheck {
        let start = Instant::now();
        let (health, message) = match manager.list_leagues().await {
            Ok(_) => (HealthStatus::Healthy, None),
            Err(e) => {
                debug!("Store health check failed: {:#}", e);
                (HealthStatus::Unhealthy, Some(format!("{:#}", e)))
            }
        };

        ComponentCheck {
            name: "store".to_string(),
            status: health,
            message,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    /// A lost broker link degrades delivery but sessions keep advancing
    fn check_amqp(status: &ServiceStatus) -> ComponentCheck {
        let (health, message) = if !status.amqp_enabled || status.amqp_connected() {
            (HealthStatus::Healthy, None)
        } else {
            (
                HealthStatus::Degraded,
                Some("AMQP connection is down".to_string()),
            )
        };

        ComponentCheck {
            name: "amqp_connection".to_string(),
            status: health,
            message,
            duration_ms: 0,
        }
    }

    async fn gather_service_stats(status: &ServiceStatus, manager: &SessionManager) -> ServiceStats {
        let leagues = manager.list_leagues().await.map(|l| l.len()).unwrap_or(0);
        let active_sessions = manager
            .get_active_sessions_around_now()
            .await
            .map(|sessions| {
                sessions
                    .iter()
                    .filter(|s| s.session.status.is_active())
                    .count()
            })
            .unwrap_or(0);

        ServiceStats {
            leagues,
            active_sessions,
            uptime_seconds: status.uptime().as_secs(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| anyhow::anyhow!("Failed to serialize health check: {}", e))
    }
}

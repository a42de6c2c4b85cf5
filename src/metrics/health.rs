//! HTTP server for health probes, Prometheus metrics and the read-only API
//!
//! Routes:
//! - `/`, `/health`, `/ready`, `/alive`, `/stats`
//! - `/metrics` in Prometheus text format
//! - `/sessions`: sessions not closed yet and those closed recently
//! - `/leaderboard/{short_code}?threshold=<deviation>`

use crate::error::{ladder_error, LadderError};
use crate::metrics::collector::MetricsCollector;
use crate::service::health::{HealthCheck, HealthStatus, ServiceStatus};
use crate::session::SessionManager;
use anyhow::{Context, Result};
use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct HealthServerConfig {
    pub port: u16,
    /// Typically "0.0.0.0" for all interfaces
    pub host: String,
}

impl Default for HealthServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            host: "0.0.0.0".to_string(),
        }
    }
}

/// Shared state for the handlers; probes report unhealthy until both parts are attached
#[derive(Clone)]
pub struct HealthServerState {
    pub metrics_collector: Arc<MetricsCollector>,
    pub manager: Option<Arc<SessionManager>>,
    pub status: Option<Arc<ServiceStatus>>,
}

pub struct HealthServer {
    config: HealthServerConfig,
    state: HealthServerState,
    shutdown_tx: broadcast::Sender<()>,
}

impl HealthServer {
    pub fn new(config: HealthServerConfig, metrics_collector: Arc<MetricsCollector>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            state: HealthServerState {
                metrics_collector,
                manager: None,
                status: None,
            },
            shutdown_tx,
        }
    }

    pub fn with_service(mut self, manager: Arc<SessionManager>, status: Arc<ServiceStatus>) -> Self {
        self.state.manager = Some(manager);
        self.state.status = Some(status);
        self
    }

    /// Serve until `stop` is called
    pub async fn start(&self) -> Result<()> {
        let addr: SocketAddr = format!("{}:{}", self.config.host, self.config.port)
            .parse()
            .context("Invalid health server address")?;

        let app = self.create_router();
        let listener = TcpListener::bind(addr).await?;

        info!("HTTP server listening on http://{}", addr);

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("HTTP server shutdown signal received");
            })
            .await?;

        info!("HTTP server stopped");
        Ok(())
    }

    fn create_router(&self) -> Router {
        Router::new()
            .route("/", get(root_handler))
            .route("/health", get(health_handler))
            .route("/ready", get(ready_handler))
            .route("/alive", get(alive_handler))
            .route("/metrics", get(metrics_handler))
            .route("/stats", get(stats_handler))
            .route("/sessions", get(sessions_handler))
            .route("/leaderboard/{short_code}", get(leaderboard_handler))
            .with_state(self.state.clone())
    }

    pub async fn stop(&self) -> Result<()> {
        if let Err(e) = self.shutdown_tx.send(()) {
            warn!("Failed to send shutdown signal to HTTP server: {}", e);
        }
        Ok(())
    }
}

fn not_initialized() -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(json!({
            "status": "unhealthy",
            "service": "race-ladder",
            "error": "Service not initialized"
        })),
    )
        .into_response()
}

/// Map a failed read to an HTTP status; only public errors expose their message
fn error_response(err: &anyhow::Error) -> Response {
    let status = match ladder_error(err) {
        Some(LadderError::LeagueNotFound { .. }) | Some(LadderError::NoPastSession { .. }) => {
            StatusCode::NOT_FOUND
        }
        Some(LadderError::StoreUnavailable { .. }) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let message = match ladder_error(err) {
        Some(e) if e.is_public() => e.to_string(),
        _ => {
            error!("Read endpoint failed: {:#}", err);
            "internal error".to_string()
        }
    };

    (status, Json(json!({ "error": message }))).into_response()
}

async fn root_handler() -> impl IntoResponse {
    Json(json!({
        "service": "race-ladder",
        "version": env!("CARGO_PKG_VERSION"),
        "endpoints": [
            "/health",
            "/ready",
            "/alive",
            "/metrics",
            "/stats",
            "/sessions",
            "/leaderboard/{short_code}"
        ]
    }))
}

async fn health_handler(State(state): State<HealthServerState>) -> Response {
    let Some(status) = &state.status else {
        return not_initialized();
    };

    let health = HealthCheck::liveness_check(status).await;
    let code = if health == HealthStatus::Unhealthy {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (
        code,
        Json(json!({
            "status": health,
            "service": status.name(),
            "version": env!("CARGO_PKG_VERSION")
        })),
    )
        .into_response()
}

async fn ready_handler(State(state): State<HealthServerState>) -> impl IntoResponse {
    debug!("Readiness check requested");

    match (&state.status, &state.manager) {
        (Some(status), Some(manager)) => match HealthCheck::readiness_check(status, manager).await
        {
            HealthStatus::Healthy => (StatusCode::OK, "Ready"),
            HealthStatus::Degraded => (StatusCode::OK, "Degraded but ready"),
            HealthStatus::Unhealthy => (StatusCode::SERVICE_UNAVAILABLE, "Not ready"),
        },
        _ => (StatusCode::SERVICE_UNAVAILABLE, "Service not initialized"),
    }
}

async fn alive_handler(State(state): State<HealthServerState>) -> impl IntoResponse {
    match &state.status {
        Some(status) => match HealthCheck::liveness_check(status).await {
            HealthStatus::Unhealthy => (StatusCode::SERVICE_UNAVAILABLE, "Not alive"),
            _ => (StatusCode::OK, "Alive"),
        },
        None => (StatusCode::SERVICE_UNAVAILABLE, "Service not initialized"),
    }
}

async fn metrics_handler(State(state): State<HealthServerState>) -> Response {
    let metric_families = state.metrics_collector.registry().gather();
    let encoder = TextEncoder::new();

    match encoder.encode_to_string(&metric_families) {
        Ok(output) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, encoder.format_type().to_string())],
            output,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to encode metrics".to_string(),
            )
                .into_response()
        }
    }
}

async fn stats_handler(State(state): State<HealthServerState>) -> Response {
    let (Some(status), Some(manager)) = (&state.status, &state.manager) else {
        return not_initialized();
    };

    match HealthCheck::check(status, manager).await {
        Ok(health) => {
            state
                .metrics_collector
                .update_health_status(health.status.as_gauge());
            (StatusCode::OK, Json(health)).into_response()
        }
        Err(e) => error_response(&e),
    }
}

async fn sessions_handler(State(state): State<HealthServerState>) -> Response {
    let Some(manager) = &state.manager else {
        return not_initialized();
    };

    match manager.get_active_sessions_around_now().await {
        Ok(sessions) => (StatusCode::OK, Json(sessions)).into_response(),
        Err(e) => error_response(&e),
    }
}

#[derive(Debug, Deserialize)]
struct LeaderboardQuery {
    threshold: Option<f64>,
}

async fn leaderboard_handler(
    State(state): State<HealthServerState>,
    Path(short_code): Path<String>,
    Query(query): Query<LeaderboardQuery>,
) -> Response {
    let Some(manager) = &state.manager else {
        return not_initialized();
    };

    match manager
        .get_leaderboard_for_league(&short_code, query.threshold)
        .await
    {
        Ok(entries) => (StatusCode::OK, Json(entries)).into_response(),
        Err(e) => error_response(&e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::NotificationBus;
    use crate::rating::RatingEngine;
    use crate::store::{InMemoryStore, LadderStore};
    use crate::types::{League, LeagueSchedule};
    use crate::utils::generate_id;
    use axum::{body::Body, http::Request};
    use tower::ServiceExt;

    fn collector() -> Arc<MetricsCollector> {
        Arc::new(MetricsCollector::new().expect("Failed to create collector"))
    }

    async fn wired_server() -> (HealthServer, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        store
            .insert_league(League {
                id: generate_id(),
                name: "Standard".to_string(),
                short_code: "std".to_string(),
                announce_channel_id: "announcements".to_string(),
                joinable_offset_seconds: 3600,
                preparation_offset_seconds: 900,
                deviation_threshold: 120.0,
                schedule: LeagueSchedule {
                    anchor: chrono::Utc::now(),
                    interval_seconds: 86_400,
                },
                generator_settings: serde_json::Value::Null,
                generator_version: "v1".to_string(),
            })
            .await
            .unwrap();

        let (bus, _) = NotificationBus::new(8, 1, std::time::Duration::from_millis(10));
        let manager = Arc::new(SessionManager::new(
            store.clone(),
            Arc::new(bus),
            RatingEngine::default(),
        ));
        let status = Arc::new(ServiceStatus::new("race-ladder", false));
        status.set_running(true).await;

        let server = HealthServer::new(HealthServerConfig::default(), collector())
            .with_service(manager, status);
        (server, store)
    }

    async fn get(app: Router, uri: &str) -> Response {
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_root_endpoint() {
        let server = HealthServer::new(HealthServerConfig::default(), collector());
        let response = get(server.create_router(), "/").await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_metrics_endpoint() {
        let collector = collector();
        collector.record_odd_kick();
        collector.update_health_status(2);

        let server = HealthServer::new(HealthServerConfig::default(), collector);
        let response = get(server.create_router(), "/metrics").await;

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get("content-type").unwrap();
        assert!(content_type.to_str().unwrap().contains("text/plain"));
    }

    #[tokio::test]
    async fn test_probes_without_service() {
        let server = HealthServer::new(HealthServerConfig::default(), collector());
        let app = server.create_router();

        for uri in ["/health", "/ready", "/alive", "/stats", "/sessions", "/leaderboard/std"] {
            let response = get(app.clone(), uri).await;
            assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE, "{}", uri);
        }
    }

    #[tokio::test]
    async fn test_probes_with_service() {
        let (server, store) = wired_server().await;
        let app = server.create_router();

        assert_eq!(get(app.clone(), "/health").await.status(), StatusCode::OK);
        assert_eq!(get(app.clone(), "/ready").await.status(), StatusCode::OK);
        assert_eq!(get(app.clone(), "/stats").await.status(), StatusCode::OK);

        store.set_available(false);
        assert_eq!(
            get(app.clone(), "/ready").await.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            get(app, "/sessions").await.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_leaderboard_endpoint() {
        let (server, _) = wired_server().await;
        let app = server.create_router();

        let response = get(app.clone(), "/leaderboard/STD?threshold=200").await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = get(app, "/leaderboard/nope").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_404_handling() {
        let server = HealthServer::new(HealthServerConfig::default(), collector());
        let response = get(server.create_router(), "/nonexistent").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}

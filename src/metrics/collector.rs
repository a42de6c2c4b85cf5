//! Metrics collection using Prometheus
//!
//! Every collector owns its own registry so that tests and embedded uses never
//! collide on metric names.

use crate::types::{Outcome, SessionStatus};
use anyhow::Result;
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec,
    Opts, Registry,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Main metrics collector for the ladder service
#[derive(Clone)]
pub struct MetricsCollector {
    registry: Arc<Registry>,
    session_metrics: SessionMetrics,
    player_metrics: PlayerMetrics,
    rating_metrics: RatingMetrics,
    notification_metrics: NotificationMetrics,
    performance_metrics: PerformanceMetrics,
}

/// Session lifecycle metrics
#[derive(Clone)]
pub struct SessionMetrics {
    /// Status transitions, labelled by the status entered
    pub transitions_total: IntCounterVec,

    /// Sessions currently in each non-closed status
    pub active_sessions: IntGaugeVec,

    pub sessions_created_total: IntCounter,

    /// Players removed at preparation to even out the count
    pub odd_kicks_total: IntCounter,

    /// Sessions closed at preparation because nobody could be paired
    pub empty_sessions_total: IntCounter,

    pub matches_created_total: IntCounter,

    /// Resolved matches, labelled by the first entry's outcome
    pub matches_resolved_total: IntCounterVec,
}

/// Player action metrics
#[derive(Clone)]
pub struct PlayerMetrics {
    /// Player actions by action and result
    pub actions_total: IntCounterVec,

    pub registered_total: IntCounter,
}

/// Rating metrics
#[derive(Clone)]
pub struct RatingMetrics {
    /// Per-player Glicko-2 updates applied after a match
    pub updates_total: IntCounter,

    /// Inactivity decay steps applied
    pub decay_steps_total: IntCounter,

    /// Distribution of ratings after an update
    pub rating_distribution: Histogram,
}

/// Notification bus metrics
#[derive(Clone)]
pub struct NotificationMetrics {
    pub enqueued_total: IntCounterVec,

    /// Notifications dropped because a shard stayed full past the send timeout
    pub dropped_total: IntCounterVec,

    pub delivered_total: IntCounterVec,

    pub delivery_errors_total: IntCounterVec,
}

/// Performance and health metrics
#[derive(Clone)]
pub struct PerformanceMetrics {
    /// Duration of one scheduler sweep
    pub tick_duration: Histogram,

    /// Sessions whose advancement failed during a sweep
    pub tick_errors_total: IntCounter,

    /// Duration of manager operations
    pub action_duration: HistogramVec,

    pub uptime_seconds: IntGauge,

    /// Health check status (0=unhealthy, 1=degraded, 2=healthy)
    pub health_status: IntGauge,

    pub component_health: IntGaugeVec,
}

impl MetricsCollector {
    /// Create a new metrics collector with its own registry
    pub fn new() -> Result<Self> {
        Self::with_registry(Arc::new(Registry::new()))
    }

    /// Create a metrics collector registering into an existing registry
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let session_metrics = SessionMetrics::new(&registry)?;
        let player_metrics = PlayerMetrics::new(&registry)?;
        let rating_metrics = RatingMetrics::new(&registry)?;
        let notification_metrics = NotificationMetrics::new(&registry)?;
        let performance_metrics = PerformanceMetrics::new(&registry)?;

        Ok(Self {
            registry,
            session_metrics,
            player_metrics,
            rating_metrics,
            notification_metrics,
            performance_metrics,
        })
    }

    pub fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    pub fn sessions(&self) -> &SessionMetrics {
        &self.session_metrics
    }

    pub fn players(&self) -> &PlayerMetrics {
        &self.player_metrics
    }

    pub fn ratings(&self) -> &RatingMetrics {
        &self.rating_metrics
    }

    pub fn notifications(&self) -> &NotificationMetrics {
        &self.notification_metrics
    }

    pub fn performance(&self) -> &PerformanceMetrics {
        &self.performance_metrics
    }

    /// Record a session entering `to`, moving the active gauge along
    pub fn record_transition(&self, from: SessionStatus, to: SessionStatus) {
        self.session_metrics
            .transitions_total
            .with_label_values(&[to.as_str()])
            .inc();

        if from.is_active() {
            self.session_metrics
                .active_sessions
                .with_label_values(&[from.as_str()])
                .dec();
        }
        if to.is_active() {
            self.session_metrics
                .active_sessions
                .with_label_values(&[to.as_str()])
                .inc();
        }
    }

    pub fn record_session_created(&self, status: SessionStatus) {
        self.session_metrics.sessions_created_total.inc();
        self.session_metrics
            .active_sessions
            .with_label_values(&[status.as_str()])
            .inc();
    }

    pub fn record_odd_kick(&self) {
        self.session_metrics.odd_kicks_total.inc();
    }

    pub fn record_empty_session(&self) {
        self.session_metrics.empty_sessions_total.inc();
    }

    pub fn record_matches_created(&self, count: usize) {
        self.session_metrics
            .matches_created_total
            .inc_by(count as u64);
    }

    pub fn record_match_resolved(&self, outcome: Outcome) {
        self.session_metrics
            .matches_resolved_total
            .with_label_values(&[outcome.as_str()])
            .inc();
    }

    /// Record a player action and how long it took
    pub fn record_action(&self, action: &str, success: bool, duration: Duration) {
        let result = if success { "success" } else { "error" };

        self.player_metrics
            .actions_total
            .with_label_values(&[action, result])
            .inc();

        self.performance_metrics
            .action_duration
            .with_label_values(&[action])
            .observe(duration.as_secs_f64());
    }

    pub fn record_player_registered(&self) {
        self.player_metrics.registered_total.inc();
    }

    pub fn record_rating_update(&self, new_rating: f64) {
        self.rating_metrics.updates_total.inc();
        self.rating_metrics.rating_distribution.observe(new_rating);
    }

    pub fn record_decay_steps(&self, steps: u32) {
        if steps > 0 {
            self.rating_metrics.decay_steps_total.inc_by(u64::from(steps));
        }
    }

    pub fn record_notification_enqueued(&self, kind: &str) {
        self.notification_metrics
            .enqueued_total
            .with_label_values(&[kind])
            .inc();
    }

    pub fn record_notification_dropped(&self, kind: &str) {
        self.notification_metrics
            .dropped_total
            .with_label_values(&[kind])
            .inc();
    }

    pub fn record_delivery(&self, transport: &str, success: bool) {
        let counter = if success {
            &self.notification_metrics.delivered_total
        } else {
            &self.notification_metrics.delivery_errors_total
        };
        counter.with_label_values(&[transport]).inc();
    }

    pub fn record_tick(&self, duration: Duration, failed_sessions: usize) {
        self.performance_metrics
            .tick_duration
            .observe(duration.as_secs_f64());
        if failed_sessions > 0 {
            self.performance_metrics
                .tick_errors_total
                .inc_by(failed_sessions as u64);
        }
    }

    pub fn update_uptime(&self, uptime: Duration) {
        self.performance_metrics
            .uptime_seconds
            .set(uptime.as_secs() as i64);
    }

    pub fn update_health_status(&self, status: u8) {
        self.performance_metrics.health_status.set(status as i64);
    }

    pub fn update_component_health(&self, component: &str, healthy: bool) {
        self.performance_metrics
            .component_health
            .with_label_values(&[component])
            .set(if healthy { 1 } else { 0 });
    }

    /// Create a timer for measuring operation duration
    pub fn start_timer(&self) -> MetricsTimer {
        MetricsTimer::new()
    }
}

/// Timer for measuring operation durations
pub struct MetricsTimer {
    start: Instant,
}

impl MetricsTimer {
    fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn stop(self) -> Duration {
        self.elapsed()
    }
}

impl SessionMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let transitions_total = IntCounterVec::new(
            Opts::new(
                "race_ladder_session_transitions_total",
                "Session status transitions",
            ),
            &["to"],
        )?;
        registry.register(Box::new(transitions_total.clone()))?;

        let active_sessions = IntGaugeVec::new(
            Opts::new("race_ladder_active_sessions", "Non-closed sessions by status"),
            &["status"],
        )?;
        registry.register(Box::new(active_sessions.clone()))?;

        let sessions_created_total = IntCounter::new(
            "race_ladder_sessions_created_total",
            "Total sessions created",
        )?;
        registry.register(Box::new(sessions_created_total.clone()))?;

        let odd_kicks_total = IntCounter::new(
            "race_ladder_odd_kicks_total",
            "Players removed to make the session even",
        )?;
        registry.register(Box::new(odd_kicks_total.clone()))?;

        let empty_sessions_total = IntCounter::new(
            "race_ladder_empty_sessions_total",
            "Sessions closed without any match",
        )?;
        registry.register(Box::new(empty_sessions_total.clone()))?;

        let matches_created_total = IntCounter::new(
            "race_ladder_matches_created_total",
            "Total matches created",
        )?;
        registry.register(Box::new(matches_created_total.clone()))?;

        let matches_resolved_total = IntCounterVec::new(
            Opts::new(
                "race_ladder_matches_resolved_total",
                "Matches with both entries terminal",
            ),
            &["outcome"],
        )?;
        registry.register(Box::new(matches_resolved_total.clone()))?;

        Ok(Self {
            transitions_total,
            active_sessions,
            sessions_created_total,
            odd_kicks_total,
            empty_sessions_total,
            matches_created_total,
            matches_resolved_total,
        })
    }
}

impl PlayerMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let actions_total = IntCounterVec::new(
            Opts::new("race_ladder_player_actions_total", "Player actions handled"),
            &["action", "result"],
        )?;
        registry.register(Box::new(actions_total.clone()))?;

        let registered_total = IntCounter::new(
            "race_ladder_players_registered_total",
            "Players registered",
        )?;
        registry.register(Box::new(registered_total.clone()))?;

        Ok(Self {
            actions_total,
            registered_total,
        })
    }
}

impl RatingMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let updates_total = IntCounter::new(
            "race_ladder_rating_updates_total",
            "Glicko-2 updates applied",
        )?;
        registry.register(Box::new(updates_total.clone()))?;

        let decay_steps_total = IntCounter::new(
            "race_ladder_rating_decay_steps_total",
            "Inactivity decay steps applied",
        )?;
        registry.register(Box::new(decay_steps_total.clone()))?;

        let rating_distribution = Histogram::with_opts(
            HistogramOpts::new(
                "race_ladder_rating_distribution",
                "Distribution of player ratings after an update",
            )
            .buckets(vec![
                1000.0, 1200.0, 1400.0, 1500.0, 1600.0, 1800.0, 2000.0, 2200.0, 2500.0,
            ]),
        )?;
        registry.register(Box::new(rating_distribution.clone()))?;

        Ok(Self {
            updates_total,
            decay_steps_total,
            rating_distribution,
        })
    }
}

impl NotificationMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let enqueued_total = IntCounterVec::new(
            Opts::new(
                "race_ladder_notifications_enqueued_total",
                "Notifications accepted by the bus",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(enqueued_total.clone()))?;

        let dropped_total = IntCounterVec::new(
            Opts::new(
                "race_ladder_notifications_dropped_total",
                "Notifications dropped on a full bus",
            ),
            &["kind"],
        )?;
        registry.register(Box::new(dropped_total.clone()))?;

        let delivered_total = IntCounterVec::new(
            Opts::new(
                "race_ladder_notifications_delivered_total",
                "Notifications handed to a transport",
            ),
            &["transport"],
        )?;
        registry.register(Box::new(delivered_total.clone()))?;

        let delivery_errors_total = IntCounterVec::new(
            Opts::new(
                "race_ladder_notification_delivery_errors_total",
                "Notifications a transport failed to deliver",
            ),
            &["transport"],
        )?;
        registry.register(Box::new(delivery_errors_total.clone()))?;

        Ok(Self {
            enqueued_total,
            dropped_total,
            delivered_total,
            delivery_errors_total,
        })
    }
}

impl PerformanceMetrics {
    fn new(registry: &Registry) -> Result<Self> {
        let tick_duration = Histogram::with_opts(
            HistogramOpts::new(
                "race_ladder_tick_duration_seconds",
                "Duration of one phase advancement sweep",
            )
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]),
        )?;
        registry.register(Box::new(tick_duration.clone()))?;

        let tick_errors_total = IntCounter::new(
            "race_ladder_tick_errors_total",
            "Sessions that failed to advance during a sweep",
        )?;
        registry.register(Box::new(tick_errors_total.clone()))?;

        let action_duration = HistogramVec::new(
            HistogramOpts::new(
                "race_ladder_action_duration_seconds",
                "Duration of session manager operations",
            )
            .buckets(vec![0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 1.0]),
            &["action"],
        )?;
        registry.register(Box::new(action_duration.clone()))?;

        let uptime_seconds =
            IntGauge::new("race_ladder_uptime_seconds", "Service uptime in seconds")?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        let health_status = IntGauge::new(
            "race_ladder_health_status",
            "Health status (0=unhealthy, 1=degraded, 2=healthy)",
        )?;
        registry.register(Box::new(health_status.clone()))?;

        let component_health = IntGaugeVec::new(
            Opts::new("race_ladder_component_health", "Component health status"),
            &["component"],
        )?;
        registry.register(Box::new(component_health.clone()))?;

        Ok(Self {
            tick_duration,
            tick_errors_total,
            action_duration,
            uptime_seconds,
            health_status,
            component_health,
        })
    }
}

//! Periodic driver of the session lifecycle
//!
//! Runs `SessionManager::tick` on a fixed interval and the rating decay sweep
//! on a slower one. A tick that panics is contained to that tick; a store
//! outage stretches the delay until the next tick exponentially.

use crate::config::AppConfig;
use crate::error::{ladder_error, LadderError};
use crate::metrics::MetricsCollector;
use crate::session::manager::{SessionManager, TickReport};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    pub decay_sweep_interval: Duration,
    /// First delay after a store outage; doubled on every further failure
    pub store_retry_base: Duration,
    pub store_retry_max: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            decay_sweep_interval: Duration::from_secs(3600),
            store_retry_base: Duration::from_millis(500),
            store_retry_max: Duration::from_secs(30),
        }
    }
}

impl From<&AppConfig> for SchedulerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            tick_interval: config.tick_interval(),
            decay_sweep_interval: config.decay_sweep_interval(),
            store_retry_base: Duration::from_millis(config.scheduler.store_retry_base_ms),
            store_retry_max: Duration::from_millis(config.scheduler.store_retry_max_ms),
        }
    }
}

/// Result of one scheduler pass
#[derive(Debug)]
pub enum TickResult {
    Completed(TickReport),
    StoreUnavailable,
    Failed,
}

/// Delay before the next tick given the number of consecutive store outages
pub fn next_delay(config: &SchedulerConfig, outages: u32) -> Duration {
    if outages == 0 {
        return config.tick_interval;
    }
    let factor = 2u32.saturating_pow(outages - 1);
    config
        .store_retry_base
        .saturating_mul(factor)
        .min(config.store_retry_max)
}

pub struct Scheduler {
    manager: Arc<SessionManager>,
    config: SchedulerConfig,
    metrics: Option<Arc<MetricsCollector>>,
    is_running: Arc<RwLock<bool>>,
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(manager: Arc<SessionManager>, config: SchedulerConfig) -> Self {
        Self {
            manager,
            config,
            metrics: None,
            is_running: Arc::new(RwLock::new(false)),
            handles: Vec::new(),
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    /// Run a single pass in its own task so a panic cannot take the loop down
    pub async fn run_tick(
        manager: Arc<SessionManager>,
        metrics: Option<Arc<MetricsCollector>>,
    ) -> TickResult {
        let started = Instant::now();
        let outcome = tokio::spawn(async move { manager.tick().await }).await;

        let result = match outcome {
            Ok(Ok(report)) => {
                if report.created > 0 || report.transitions > 0 || report.failed > 0 {
                    debug!(
                        "Tick: {} sessions, {} created, {} transitions, {} failed",
                        report.sessions, report.created, report.transitions, report.failed
                    );
                }
                TickResult::Completed(report)
            }
            Ok(Err(e)) => {
                if matches!(ladder_error(&e), Some(LadderError::StoreUnavailable { .. })) {
                    warn!("Store unavailable during tick: {:#}", e);
                    TickResult::StoreUnavailable
                } else {
                    error!("Tick failed: {:#}", e);
                    TickResult::Failed
                }
            }
            Err(e) => {
                error!("Tick task aborted: {}", e);
                TickResult::Failed
            }
        };

        if let Some(metrics) = &metrics {
            let failed = match &result {
                TickResult::Completed(report) => report.failed,
                _ => 1,
            };
            metrics.record_tick(started.elapsed(), failed);
        }
        result
    }

    /// Spawn the tick and decay loops
    pub async fn start(&mut self) {
        if self.is_running().await {
            warn!("Scheduler already running");
            return;
        }
        *self.is_running.write().await = true;

        info!(
            "Starting scheduler (tick every {}ms, decay sweep every {}s)",
            self.config.tick_interval.as_millis(),
            self.config.decay_sweep_interval.as_secs()
        );

        let tick_task = {
            let manager = self.manager.clone();
            let metrics = self.metrics.clone();
            let config = self.config.clone();
            let is_running = self.is_running.clone();

            tokio::spawn(async move {
                let mut outages = 0u32;
                while *is_running.read().await {
                    match Self::run_tick(manager.clone(), metrics.clone()).await {
                        TickResult::StoreUnavailable => outages = outages.saturating_add(1),
                        TickResult::Completed(_) | TickResult::Failed => {
                            if outages > 0 {
                                info!("Store reachable again after {} failed ticks", outages);
                            }
                            outages = 0;
                        }
                    }
                    tokio::time::sleep(next_delay(&config, outages)).await;
                }
                info!("Tick loop stopped");
            })
        };

        let decay_task = {
            let manager = self.manager.clone();
            let period = self.config.decay_sweep_interval;
            let is_running = self.is_running.clone();

            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                while *is_running.read().await {
                    interval.tick().await;
                    if let Err(e) = manager.decay_sweep().await {
                        warn!("Rating decay sweep failed: {:#}", e);
                    }
                }
                info!("Decay loop stopped");
            })
        };

        self.handles.push(tick_task);
        self.handles.push(decay_task);
    }

    pub async fn stop(&mut self) {
        *self.is_running.write().await = false;
        for handle in self.handles.drain(..) {
            handle.abort();
        }
        info!("Scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::NotificationBus;
    use crate::rating::RatingEngine;
    use crate::store::{InMemoryStore, LadderStore};
    use crate::types::{League, LeagueSchedule};
    use crate::utils::{generate_id, ManualClock};
    use chrono::{TimeZone, Utc};

    fn config() -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_millis(100),
            decay_sweep_interval: Duration::from_secs(60),
            store_retry_base: Duration::from_millis(200),
            store_retry_max: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let config = config();
        assert_eq!(next_delay(&config, 0), Duration::from_millis(100));
        assert_eq!(next_delay(&config, 1), Duration::from_millis(200));
        assert_eq!(next_delay(&config, 2), Duration::from_millis(400));
        assert_eq!(next_delay(&config, 3), Duration::from_millis(800));
        assert_eq!(next_delay(&config, 4), Duration::from_secs(1));
        assert_eq!(next_delay(&config, 40), Duration::from_secs(1));
    }

    async fn manager_with_store() -> (Arc<SessionManager>, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        let anchor = Utc.with_ymd_and_hms(2024, 5, 1, 20, 0, 0).unwrap();
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
                    anchor,
                    interval_seconds: 86_400,
                },
                generator_settings: serde_json::Value::Null,
                generator_version: "v1".to_string(),
            })
            .await
            .unwrap();

        let (bus, _) = NotificationBus::new(16, 1, Duration::from_millis(10));
        let manager = SessionManager::new(store.clone(), Arc::new(bus), RatingEngine::default())
            .with_clock(Arc::new(ManualClock::new(anchor - chrono::Duration::hours(6))));
        (Arc::new(manager), store)
    }

    #[tokio::test]
    async fn test_tick_reports_store_outage() {
        let (manager, store) = manager_with_store().await;

        store.set_available(false);
        assert!(matches!(
            Scheduler::run_tick(manager.clone(), None).await,
            TickResult::StoreUnavailable
        ));

        store.set_available(true);
        match Scheduler::run_tick(manager, None).await {
            TickResult::Completed(report) => assert_eq!(report.created, 1),
            other => panic!("unexpected tick result {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let (manager, _) = manager_with_store().await;
        let mut scheduler = Scheduler::new(manager, config());

        scheduler.start().await;
        assert!(scheduler.is_running().await);

        scheduler.stop().await;
        assert!(!scheduler.is_running().await);
    }
}

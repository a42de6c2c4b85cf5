//! Main application state and service coordination
//!
//! Wires the store, session manager, notification bus, scheduler, HTTP server
//! and AMQP front-end together, and owns their background tasks.

use crate::amqp::connection::{AmqpConfig, AmqpConnection};
use crate::amqp::handlers::{CommandConsumer, LadderCommandHandler};
use crate::amqp::publisher::{AmqpNotificationTransport, PublisherConfig};
use crate::config::{AppConfig, LeagueConfig};
use crate::metrics::{HealthServer, HealthServerConfig, MetricsCollector, MetricsService};
use crate::notification::{
    spawn_dispatchers, DeliveryTransport, LogTransport, NotificationBus, NotificationReceiver,
};
use crate::rating::RatingEngine;
use crate::service::health::{HealthCheck, ServiceStatus};
use crate::session::{Scheduler, SchedulerConfig, SessionManager};
use crate::store::{InMemoryStore, LadderStore};
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::Duration;
use tracing::{debug, error, info, warn};

/// Service-level errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("AMQP connection error: {message}")]
    AmqpConnection { message: String },

    #[error("Service initialization error: {message}")]
    Initialization { message: String },

    #[error("Background task error: {message}")]
    BackgroundTask { message: String },
}

/// Insert configured leagues missing from the store; existing ones are kept as stored
pub async fn sync_leagues(
    store: &dyn LadderStore,
    leagues: &[LeagueConfig],
) -> crate::error::Result<usize> {
    let mut inserted = 0;
    for league in leagues {
        let short_code = league.short_code.to_lowercase();
        if store.league_by_short_code(&short_code).await?.is_some() {
            debug!("League {} already present", short_code);
            continue;
        }
        store.insert_league(league.clone().into_league()).await?;
        info!("Registered league {} ({})", league.name, short_code);
        inserted += 1;
    }
    Ok(inserted)
}

/// Main application state containing all service components
pub struct AppState {
    config: AppConfig,
    manager: Arc<SessionManager>,
    bus: Arc<NotificationBus>,
    /// Bus shards, handed to the dispatchers on start
    receivers: Vec<NotificationReceiver>,
    metrics_service: Arc<MetricsService>,
    status: Arc<ServiceStatus>,
    scheduler: Scheduler,
    amqp_connection: Option<Arc<AmqpConnection>>,
    command_consumer: Option<CommandConsumer>,
    background_tasks: Vec<JoinHandle<()>>,
}

impl AppState {
    /// Build every component; connects to the broker when AMQP is enabled
    pub async fn new(config: AppConfig) -> Result<Self, ServiceError> {
        info!("Initializing {} service", config.service.name);

        let collector = Arc::new(MetricsCollector::new().map_err(|e| {
            ServiceError::Initialization {
                message: format!("Failed to create metrics collector: {}", e),
            }
        })?);

        let store = Arc::new(InMemoryStore::new());
        let inserted = sync_leagues(&*store, &config.leagues)
            .await
            .map_err(|e| ServiceError::Configuration {
                message: format!("Failed to register leagues: {:#}", e),
            })?;
        info!("{} leagues configured", inserted);

        let (bus, receivers) = NotificationBus::new(
            config.notifications.capacity,
            config.notifications.shards,
            config.notification_send_timeout(),
        );
        let bus = Arc::new(bus.with_metrics(collector.clone()));

        let rating_engine =
            RatingEngine::new(config.rating.clone()).map_err(|e| ServiceError::Configuration {
                message: format!("Invalid rating configuration: {:#}", e),
            })?;

        let manager = Arc::new(
            SessionManager::new(store, bus.clone(), rating_engine)
                .with_metrics(collector.clone())
                .with_countdown_marks(config.notifications.countdown_marks_seconds.clone())
                .with_recent_window(chrono::Duration::hours(
                    config.scheduler.recent_session_hours,
                )),
        );

        let status = Arc::new(ServiceStatus::new(
            config.service.name.clone(),
            config.amqp.enabled,
        ));

        let health_server = HealthServer::new(
            HealthServerConfig {
                port: config.service.http_port,
                host: "0.0.0.0".to_string(),
            },
            collector.clone(),
        )
        .with_service(manager.clone(), status.clone());
        let metrics_service = Arc::new(MetricsService::new(collector.clone(), Arc::new(health_server)));

        let scheduler = Scheduler::new(manager.clone(), SchedulerConfig::from(&config))
            .with_metrics(collector);

        let amqp_connection = if config.amqp.enabled {
            let connection = Self::initialize_amqp(&config).await?;
            status.set_amqp_connected(true);
            Some(connection)
        } else {
            info!("AMQP disabled, notifications will only be logged");
            None
        };

        Ok(Self {
            config,
            manager,
            bus,
            receivers,
            metrics_service,
            status,
            scheduler,
            amqp_connection,
            command_consumer: None,
            background_tasks: Vec::new(),
        })
    }

    /// Start the HTTP server, notification delivery, command intake and the scheduler
    pub async fn start(&mut self) -> Result<(), ServiceError> {
        info!("Starting {} service", self.config.service.name);
        self.status.set_running(true).await;

        self.start_metrics_service().await;
        self.start_notification_delivery().await?;
        if self.amqp_connection.is_some() {
            self.start_command_consumption().await?;
        }
        self.scheduler.start().await;
        self.start_health_metrics_task();

        info!("{} service started", self.config.service.name);
        Ok(())
    }

    /// Stop intake first, then the scheduler, then delivery and the HTTP server
    pub async fn shutdown(&mut self) -> Result<(), ServiceError> {
        info!("Starting graceful shutdown");
        self.status.set_running(false).await;

        if let Some(consumer) = self.command_consumer.take() {
            match consumer.stop_consuming().await {
                Ok(()) => info!("Command consumption stopped"),
                Err(e) => warn!("Failed to stop command consumer: {:#}", e),
            }
        }

        self.scheduler.stop().await;

        // Let dispatchers drain what is already queued
        tokio::time::sleep(Duration::from_millis(200)).await;
        self.stop_background_tasks().await;

        if let Err(e) = self.metrics_service.stop().await {
            warn!("Failed to stop HTTP server: {:#}", e);
        }

        if let Some(connection) = self.amqp_connection.take() {
            match Arc::try_unwrap(connection) {
                Ok(connection) => {
                    if let Err(e) = connection.close().await {
                        warn!("Failed to close AMQP connection: {:#}", e);
                    }
                }
                Err(_) => debug!("AMQP connection still shared, leaving it to drop"),
            }
            self.status.set_amqp_connected(false);
        }

        info!("Shutdown completed");
        Ok(())
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub async fn is_running(&self) -> bool {
        self.status.is_running().await
    }

    pub fn manager(&self) -> Arc<SessionManager> {
        self.manager.clone()
    }

    pub fn status(&self) -> Arc<ServiceStatus> {
        self.status.clone()
    }

    pub fn metrics_service(&self) -> Arc<MetricsService> {
        self.metrics_service.clone()
    }

    /// Full health report of the running components
    pub async fn health(&self) -> anyhow::Result<HealthCheck> {
        HealthCheck::check(&self.status, &self.manager).await
    }

    async fn initialize_amqp(config: &AppConfig) -> Result<Arc<AmqpConnection>, ServiceError> {
        let amqp_config =
            AmqpConfig::from_app_config(config).map_err(|e| ServiceError::Configuration {
                message: format!("Failed to parse AMQP URL: {:#}", e),
            })?;
        info!(
            "Connecting to AMQP broker {}:{}",
            amqp_config.host, amqp_config.port
        );

        let connection =
            AmqpConnection::new(amqp_config)
                .await
                .map_err(|e| ServiceError::AmqpConnection {
                    message: format!("Failed to connect to AMQP: {:#}", e),
                })?;
        Ok(Arc::new(connection))
    }

    async fn start_metrics_service(&mut self) {
        let metrics_service = self.metrics_service.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = metrics_service.start().await {
                error!("HTTP server failed: {:#}", e);
            }
        });
        self.background_tasks.push(handle);

        // Give the server a moment to bind
        tokio::time::sleep(Duration::from_millis(100)).await;
        info!("HTTP server started on port {}", self.config.service.http_port);
    }

    async fn start_notification_delivery(&mut self) -> Result<(), ServiceError> {
        let transport: Arc<dyn DeliveryTransport> = match &self.amqp_connection {
            Some(connection) => {
                let channel =
                    connection
                        .open_channel()
                        .await
                        .map_err(|e| ServiceError::AmqpConnection {
                            message: format!("Failed to open publisher channel: {:#}", e),
                        })?;
                let publisher_config = PublisherConfig {
                    exchange: self.config.amqp.notification_exchange.clone(),
                    max_retries: self.config.amqp.max_retry_attempts,
                    retry_delay_ms: self.config.amqp.retry_delay_ms,
                    ..PublisherConfig::default()
                };
                Arc::new(
                    AmqpNotificationTransport::new(channel, publisher_config)
                        .await
                        .map_err(|e| ServiceError::Initialization {
                            message: format!("Failed to set up notification publisher: {:#}", e),
                        })?,
                )
            }
            None => Arc::new(LogTransport),
        };

        let receivers = std::mem::take(&mut self.receivers);
        let shards = receivers.len();
        let handles = spawn_dispatchers(
            receivers,
            transport.clone(),
            Some(self.metrics_service.collector()),
        );
        self.background_tasks.extend(handles);

        info!(
            "Notification delivery started: {} shards via {}",
            shards,
            transport.name()
        );
        Ok(())
    }

    async fn start_command_consumption(&mut self) -> Result<(), ServiceError> {
        let Some(connection) = &self.amqp_connection else {
            return Ok(());
        };
        let queue = self.config.amqp.command_queue.clone();

        let channel = connection
            .open_channel()
            .await
            .map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to open consumer channel: {:#}", e),
            })?;

        let queue_declare_args = amqprs::channel::QueueDeclareArguments::new(&queue)
            .durable(true)
            .auto_delete(false)
            .finish();
        channel
            .queue_declare(queue_declare_args)
            .await
            .map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to declare queue {}: {}", queue, e),
            })?;

        let handler = Arc::new(LadderCommandHandler::new(
            self.manager.clone(),
            self.bus.clone(),
            self.config.service.admin_ids.clone(),
        ));
        let consumer = CommandConsumer::new(handler, channel);
        consumer
            .start_consuming(&queue)
            .await
            .map_err(|e| ServiceError::AmqpConnection {
                message: format!("Failed to start consuming commands: {:#}", e),
            })?;

        self.command_consumer = Some(consumer);
        info!("Listening for player commands on {}", queue);
        Ok(())
    }

    fn start_health_metrics_task(&mut self) {
        let collector = self.metrics_service.collector();
        let status = self.status.clone();
        let manager = self.manager.clone();
        let connection = self.amqp_connection.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(30));

            while status.is_running().await {
                interval.tick().await;

                if let Some(connection) = &connection {
                    status.set_amqp_connected(connection.is_alive());
                }
                match HealthCheck::check(&status, &manager).await {
                    Ok(health) => {
                        collector.update_uptime(status.uptime());
                        collector.update_health_status(health.status.as_gauge());
                        for check in &health.checks {
                            collector.update_component_health(
                                &check.name,
                                check.status != crate::service::health::HealthStatus::Unhealthy,
                            );
                        }
                        debug!(
                            "Health: {} ({} active sessions)",
                            health.status, health.stats.active_sessions
                        );
                    }
                    Err(e) => warn!("Health check failed: {:#}", e),
                }
            }
        });
        self.background_tasks.push(handle);
    }

    async fn stop_background_tasks(&mut self) {
        let task_count = self.background_tasks.len();
        for task in self.background_tasks.drain(..) {
            task.abort();
        }
        debug!("Stopped {} background tasks", task_count);
    }
}

//! Bounded, sharded notification bus
//!
//! Each shard is a bounded mpsc channel drained by its own consumer. A
//! notification's ordering key (the session id) picks the shard, so
//! notifications for one session keep their send order while different
//! sessions are delivered in parallel.

use crate::metrics::MetricsCollector;
use crate::notification::types::Notification;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tracing::{debug, warn};
use uuid::Uuid;

/// Receiving half of one bus shard
pub type NotificationReceiver = mpsc::Receiver<Notification>;

/// Sink for notifications produced by the session manager
#[async_trait]
pub trait NotificationPublisher: Send + Sync {
    /// Queue a notification; returns whether it was accepted
    async fn publish(&self, notification: Notification) -> bool;
}

pub struct NotificationBus {
    shards: Vec<mpsc::Sender<Notification>>,
    send_timeout: Duration,
    next_unkeyed: AtomicUsize,
    metrics: Option<Arc<MetricsCollector>>,
}

impl NotificationBus {
    /// Create a bus with `shards` queues of `capacity` each, and their receivers
    pub fn new(
        capacity: usize,
        shards: usize,
        send_timeout: Duration,
    ) -> (Self, Vec<NotificationReceiver>) {
        let (senders, receivers): (Vec<_>, Vec<_>) = (0..shards.max(1))
            .map(|_| mpsc::channel(capacity.max(1)))
            .unzip();

        let bus = Self {
            shards: senders,
            send_timeout,
            next_unkeyed: AtomicUsize::new(0),
            metrics: None,
        };
        (bus, receivers)
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsCollector>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard index for an ordering key; unkeyed notifications are spread round-robin
    pub fn shard_for(&self, key: Option<Uuid>) -> usize {
        let shards = self.shards.len();
        match key {
            Some(key) => (key.as_u128() % shards as u128) as usize,
            None => self.next_unkeyed.fetch_add(1, Ordering::Relaxed) % shards,
        }
    }

    /// Enqueue a notification, waiting at most the send timeout on a full shard.
    ///
    /// A notification that cannot be queued in time is dropped and counted; the
    /// caller never fails because of delivery back-pressure.
    pub async fn send(&self, notification: Notification) -> bool {
        let kind = notification.kind_name();
        let shard = self.shard_for(notification.ordering_key);

        match self.shards[shard]
            .send_timeout(notification, self.send_timeout)
            .await
        {
            Ok(()) => {
                debug!("Queued {} notification on shard {}", kind, shard);
                if let Some(metrics) = &self.metrics {
                    metrics.record_notification_enqueued(kind);
                }
                true
            }
            Err(SendTimeoutError::Timeout(dropped)) => {
                warn!(
                    "Notification shard {} full for {:?}, dropping: {}",
                    shard,
                    self.send_timeout,
                    dropped.summary()
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_notification_dropped(kind);
                }
                false
            }
            Err(SendTimeoutError::Closed(dropped)) => {
                warn!(
                    "Notification shard {} closed, dropping: {}",
                    shard,
                    dropped.summary()
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_notification_dropped(kind);
                }
                false
            }
        }
    }
}

#[async_trait]
impl NotificationPublisher for NotificationBus {
    async fn publish(&self, notification: Notification) -> bool {
        self.send(notification).await
    }
}

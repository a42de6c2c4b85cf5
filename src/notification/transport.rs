//! Delivery transports and the per-shard dispatch loop

use crate::error::Result;
use crate::metrics::MetricsCollector;
use crate::notification::bus::NotificationReceiver;
use crate::notification::types::Notification;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

/// Final hop of a notification towards its recipient
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    /// Label used in logs and metrics
    fn name(&self) -> &'static str;

    async fn deliver(&self, notification: &Notification) -> Result<()>;
}

/// Transport that only writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogTransport;

#[async_trait]
impl DeliveryTransport for LogTransport {
    fn name(&self) -> &'static str {
        "log"
    }

    async fn deliver(&self, notification: &Notification) -> Result<()> {
        info!("Notification: {}", notification.summary());
        Ok(())
    }
}

/// Spawn one consumer per bus shard; each drains its shard in order until the bus is dropped
pub fn spawn_dispatchers(
    receivers: Vec<NotificationReceiver>,
    transport: Arc<dyn DeliveryTransport>,
    metrics: Option<Arc<MetricsCollector>>,
) -> Vec<JoinHandle<()>> {
    receivers
        .into_iter()
        .enumerate()
        .map(|(shard, receiver)| {
            let transport = transport.clone();
            let metrics = metrics.clone();
            tokio::spawn(async move {
                dispatch_shard(shard, receiver, transport, metrics).await;
            })
        })
        .collect()
}

async fn dispatch_shard(
    shard: usize,
    receiver: NotificationReceiver,
    transport: Arc<dyn DeliveryTransport>,
    metrics: Option<Arc<MetricsCollector>>,
) {
    debug!("Notification dispatcher for shard {} started", shard);
    let mut stream = ReceiverStream::new(receiver);

    while let Some(notification) = stream.next().await {
        let delivered = match transport.deliver(&notification).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "Transport {} failed to deliver {}: {:#}",
                    transport.name(),
                    notification.id,
                    e
                );
                false
            }
        };
        if let Some(metrics) = &metrics {
            metrics.record_delivery(transport.name(), delivered);
        }
    }

    debug!("Notification dispatcher for shard {} stopped", shard);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::bus::NotificationBus;
    use crate::notification::types::NotificationKind;
    use crate::utils::generate_id;
    use std::time::Duration;

    fn reply(text: &str) -> Notification {
        Notification::to_user(
            "user-1",
            NotificationKind::CommandReply {
                command: "join".to_string(),
                success: true,
            },
            text,
        )
    }

    #[tokio::test]
    async fn test_dispatcher_delivers_every_notification() {
        let mut transport = MockDeliveryTransport::new();
        transport.expect_name().return_const("mock");
        transport.expect_deliver().times(3).returning(|_| Ok(()));

        let metrics = Arc::new(MetricsCollector::new().expect("metrics"));
        let (bus, receivers) = NotificationBus::new(8, 2, Duration::from_millis(50));
        let handles = spawn_dispatchers(receivers, Arc::new(transport), Some(metrics.clone()));

        for text in ["a", "b", "c"] {
            assert!(bus.send(reply(text)).await);
        }
        drop(bus);
        for handle in handles {
            handle.await.expect("dispatcher task");
        }

        assert_eq!(
            metrics
                .notifications()
                .delivered_total
                .with_label_values(&["mock"])
                .get(),
            3
        );
    }

    #[tokio::test]
    async fn test_delivery_failure_keeps_dispatcher_running() {
        let mut transport = MockDeliveryTransport::new();
        transport.expect_name().return_const("mock");
        let mut calls = 0;
        transport.expect_deliver().times(2).returning(move |_| {
            calls += 1;
            if calls == 1 {
                Err(anyhow::anyhow!("recipient unreachable"))
            } else {
                Ok(())
            }
        });

        let metrics = Arc::new(MetricsCollector::new().expect("metrics"));
        let (bus, receivers) = NotificationBus::new(8, 1, Duration::from_millis(50));
        let handles = spawn_dispatchers(receivers, Arc::new(transport), Some(metrics.clone()));

        let key = generate_id();
        bus.send(reply("first").with_ordering_key(key)).await;
        bus.send(reply("second").with_ordering_key(key)).await;
        drop(bus);
        for handle in handles {
            handle.await.expect("dispatcher task");
        }

        let notifications = metrics.notifications();
        assert_eq!(
            notifications
                .delivery_errors_total
                .with_label_values(&["mock"])
                .get(),
            1
        );
        assert_eq!(
            notifications.delivered_total.with_label_values(&["mock"]).get(),
            1
        );
    }

    #[tokio::test]
    async fn test_log_transport_accepts_everything() {
        assert!(LogTransport.deliver(&reply("hello")).await.is_ok());
        assert_eq!(LogTransport.name(), "log");
    }
}

//! Notification transport publishing to an AMQP topic exchange

use crate::amqp::messages::{notification_routing_key, MessageEnvelope};
use crate::error::{LadderError, Result};
use crate::notification::{DeliveryTransport, Notification};
use amqprs::{
    channel::{BasicPublishArguments, Channel, ExchangeDeclareArguments},
    BasicProperties,
};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub exchange: String,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub enable_deduplication: bool,
    /// Remembered notification ids before the deduplication cache is reset
    pub deduplication_capacity: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            exchange: crate::amqp::messages::NOTIFICATION_EXCHANGE.to_string(),
            max_retries: 3,
            retry_delay_ms: 500,
            enable_deduplication: true,
            deduplication_capacity: 10_000,
        }
    }
}

/// Publishes each notification as JSON, routed by its kind
pub struct AmqpNotificationTransport {
    channel: Channel,
    config: PublisherConfig,
    published: Mutex<HashSet<String>>,
}

impl AmqpNotificationTransport {
    /// Declare the exchange and wrap the channel
    pub async fn new(channel: Channel, config: PublisherConfig) -> Result<Self> {
        let transport = Self {
            channel,
            config,
            published: Mutex::new(HashSet::new()),
        };
        transport.setup_exchange().await?;
        Ok(transport)
    }

    async fn setup_exchange(&self) -> Result<()> {
        let args = ExchangeDeclareArguments::new(&self.config.exchange, "topic")
            .durable(true)
            .finish();
        self.channel.exchange_declare(args).await.map_err(|e| {
            LadderError::AmqpConnectionFailed {
                message: format!(
                    "Failed to declare exchange {}: {}",
                    self.config.exchange, e
                ),
            }
        })?;

        info!("Declared notification exchange {}", self.config.exchange);
        Ok(())
    }

    fn already_published(&self, id: &str) -> Result<bool> {
        let published = self.published.lock().map_err(|_| LadderError::InternalError {
            message: "Failed to acquire published messages lock".to_string(),
        })?;
        Ok(published.contains(id))
    }

    fn remember(&self, id: String) -> Result<()> {
        let mut published = self.published.lock().map_err(|_| LadderError::InternalError {
            message: "Failed to acquire published messages lock".to_string(),
        })?;
        if published.len() >= self.config.deduplication_capacity {
            published.clear();
        }
        published.insert(id);
        Ok(())
    }

    async fn publish_with_retry(&self, envelope: &MessageEnvelope<Notification>) -> Result<()> {
        if self.config.enable_deduplication && self.already_published(&envelope.correlation_id)? {
            debug!(
                "Notification {} already published, skipping",
                envelope.correlation_id
            );
            return Ok(());
        }

        let payload = envelope.to_bytes()?;
        let mut retry_count = 0;
        let mut delay = Duration::from_millis(self.config.retry_delay_ms);

        loop {
            match self.try_publish(envelope, payload.clone()).await {
                Ok(()) => {
                    if self.config.enable_deduplication {
                        self.remember(envelope.correlation_id.clone())?;
                    }
                    debug!(
                        "Published notification {} with key {}",
                        envelope.correlation_id, envelope.routing_key
                    );
                    return Ok(());
                }
                Err(e) => {
                    retry_count += 1;
                    if retry_count > self.config.max_retries {
                        error!(
                            "Failed to publish notification {} after {} retries: {:#}",
                            envelope.correlation_id, self.config.max_retries, e
                        );
                        return Err(e);
                    }

                    warn!(
                        "Publish attempt {} failed for notification {}: {:#}. Retrying in {:?}",
                        retry_count, envelope.correlation_id, e, delay
                    );
                    sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(5));
                }
            }
        }
    }

    async fn try_publish(
        &self,
        envelope: &MessageEnvelope<Notification>,
        payload: Vec<u8>,
    ) -> Result<()> {
        let args = BasicPublishArguments::new(&self.config.exchange, &envelope.routing_key);
        let mut properties = BasicProperties::default();
        properties
            .with_message_id(&envelope.correlation_id)
            .with_timestamp(envelope.timestamp.timestamp() as u64)
            .with_content_type("application/json")
            .with_persistence(true);

        self.channel
            .basic_publish(properties, payload, args)
            .await
            .map_err(|e| LadderError::AmqpConnectionFailed {
                message: format!("Failed to publish message: {}", e),
            })?;

        Ok(())
    }

    pub fn cached_message_count(&self) -> usize {
        self.published
            .lock()
            .map(|cache| cache.len())
            .unwrap_or(0)
    }
}

/// Envelope for a notification; the notification id doubles as correlation id
pub fn notification_envelope(notification: &Notification) -> MessageEnvelope<Notification> {
    MessageEnvelope::new(
        notification.clone(),
        notification_routing_key(notification.kind_name()),
    )
    .with_correlation_id(notification.id.to_string())
}

#[async_trait]
impl DeliveryTransport for AmqpNotificationTransport {
    fn name(&self) -> &'static str {
        "amqp"
    }

    async fn deliver(&self, notification: &Notification) -> Result<()> {
        self.publish_with_retry(&notification_envelope(notification))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::NotificationKind;
    use crate::utils::generate_id;

    #[test]
    fn test_publisher_config_default() {
        let config = PublisherConfig::default();
        assert_eq!(config.exchange, "ladder.notifications");
        assert_eq!(config.max_retries, 3);
        assert!(config.enable_deduplication);
    }

    #[test]
    fn test_envelope_is_routed_by_kind() {
        let session_id = generate_id();
        let notification = Notification::to_channel(
            "announcements",
            NotificationKind::SessionEmpty { session_id },
            "Nobody joined.",
        )
        .with_ordering_key(session_id);

        let envelope = notification_envelope(&notification);

        assert_eq!(envelope.routing_key, "notification.session_empty");
        assert_eq!(envelope.correlation_id, notification.id.to_string());

        let json: serde_json::Value =
            serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(json["payload"]["kind"]["kind"], "session_empty");
        assert_eq!(json["payload"]["recipient"]["type"], "Channel");
    }
}

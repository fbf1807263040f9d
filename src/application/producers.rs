use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::application::services::ServiceError;
use crate::domain::Message;
use crate::infrastructure::config::AppConfig;
use crate::infrastructure::error::DeliveryError;
use crate::infrastructure::kafka_abstraction::{MessagePublisher, OutboundRecord};
use crate::infrastructure::kafka_dlq::DeadLetterStore;
use crate::infrastructure::kafka_metrics::DeliveryMetrics;
use crate::infrastructure::retrying_publisher::{PendingPublish, RetryingPublisher};
use crate::infrastructure::transactional_publisher::TransactionalPublisher;

const AT_LEAST_ONCE_ATTEMPTS: u32 = 3;
const EXACTLY_ONCE_ATTEMPTS: u32 = 3;
const EXACTLY_ONCE_BATCH_ATTEMPTS: u32 = 2;

/// Fire and forget: the send runs detached and its outcome is only logged.
pub struct AtMostOnceProducer {
    publisher: Arc<dyn MessagePublisher>,
    topic: String,
}

impl AtMostOnceProducer {
    pub fn new(publisher: Arc<dyn MessagePublisher>, topic: impl Into<String>) -> Self {
        Self {
            publisher,
            topic: topic.into(),
        }
    }

    pub fn send_message(&self, content: &str) -> Result<Message, ServiceError> {
        let message = Message::new(content)?;
        let payload = message.to_payload()?;
        let publisher = Arc::clone(&self.publisher);
        let topic = self.topic.clone();
        let key = message.id.clone();

        tokio::spawn(async move {
            if let Err(e) = publisher.publish(&topic, &key, &payload).await {
                warn!("Fire-and-forget message {} lost: {}", key, e);
            }
        });
        info!("Message sent in fire-and-forget mode: {}", message.id);
        Ok(message)
    }
}

pub struct AtLeastOnceProducer {
    publisher: RetryingPublisher,
    topic: String,
    max_attempts: u32,
}

impl AtLeastOnceProducer {
    pub fn new(publisher: RetryingPublisher, topic: impl Into<String>) -> Self {
        Self {
            publisher,
            topic: topic.into(),
            max_attempts: AT_LEAST_ONCE_ATTEMPTS,
        }
    }

    /// Producer for the at-least-once topic using the configured retry policy,
    /// send timeout and attempt count.
    pub fn from_config(
        config: &AppConfig,
        publisher: Arc<dyn MessagePublisher>,
        dead_letters: Arc<dyn DeadLetterStore>,
        metrics: Arc<DeliveryMetrics>,
    ) -> Self {
        let publisher = RetryingPublisher::new(
            publisher,
            dead_letters,
            config.retry.clone(),
            config.send_timeout,
            metrics,
        );
        Self::new(publisher, config.topics.at_least_once.clone())
            .with_max_attempts(config.retry_max_attempts)
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Single asynchronous send; the outcome is logged.
    pub fn send_message(&self, content: &str) -> Result<Message, ServiceError> {
        let message = Message::new(content)?;
        let payload = message.to_payload()?;
        let publisher = self.publisher.clone();
        let topic = self.topic.clone();
        let key = message.id.clone();

        tokio::spawn(async move {
            match publisher.publish_once(&topic, &key, &payload).await {
                Ok(position) => info!(
                    "Message sent successfully: {}, offset: {}",
                    key, position.offset
                ),
                Err(e) => error!("Failed to send message: {}: {}", key, e),
            }
        });
        Ok(message)
    }

    /// Send with bounded retries; after the last failure the message is dead-lettered.
    pub fn send_message_with_retry(
        &self,
        content: &str,
        max_attempts: u32,
    ) -> Result<(Message, PendingPublish), ServiceError> {
        let message = Message::new(content)?;
        let payload = message.to_payload()?;
        let pending =
            self.publisher
                .send_with_retry(self.topic.clone(), message.id.clone(), payload, max_attempts);
        Ok((message, pending))
    }

    /// `send_message_with_retry` with this producer's attempt count.
    pub fn send_message_reliably(
        &self,
        content: &str,
    ) -> Result<(Message, PendingPublish), ServiceError> {
        self.send_message_with_retry(content, self.max_attempts)
    }
}

/// Every send is its own broker transaction. Transient failures retry the
/// whole transaction.
pub struct ExactlyOnceProducer {
    publisher: Arc<TransactionalPublisher>,
    topic: String,
    retry_delay: Duration,
}

impl ExactlyOnceProducer {
    pub fn new(publisher: Arc<TransactionalPublisher>, topic: impl Into<String>) -> Self {
        Self {
            publisher,
            topic: topic.into(),
            retry_delay: Duration::from_secs(1),
        }
    }

    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    pub async fn send_message(&self, content: &str) -> Result<Message, ServiceError> {
        let message = Message::new(content)?;
        let record = OutboundRecord::new(&self.topic, &message.id, message.to_payload()?);

        self.publish_with_retry(&[record], EXACTLY_ONCE_ATTEMPTS, 2)
            .await?;
        info!("Message sent in transaction: {}", message.id);
        Ok(message)
    }

    /// All messages in one transaction: every one is delivered or none is.
    pub async fn send_messages_in_transaction(
        &self,
        contents: &[String],
    ) -> Result<Vec<Message>, ServiceError> {
        let messages = contents
            .iter()
            .map(Message::new)
            .collect::<Result<Vec<_>, _>>()?;
        let records = messages
            .iter()
            .map(|message| {
                Ok(OutboundRecord::new(
                    &self.topic,
                    &message.id,
                    message.to_payload()?,
                ))
            })
            .collect::<Result<Vec<_>, serde_json::Error>>()?;

        self.publish_with_retry(&records, EXACTLY_ONCE_BATCH_ATTEMPTS, 1)
            .await?;
        info!("Batch of {} messages sent in transaction", messages.len());
        Ok(messages)
    }

    async fn publish_with_retry(
        &self,
        records: &[OutboundRecord],
        attempts: u32,
        multiplier: u32,
    ) -> Result<(), DeliveryError> {
        let mut delay = self.retry_delay;
        let mut attempt = 1;
        loop {
            match self.publisher.publish_all(records).await {
                Ok(_) => return Ok(()),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    warn!(
                        "Transaction attempt {}/{} failed, retrying in {:?}: {}",
                        attempt, attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                    delay *= multiplier;
                    attempt += 1;
                }
                Err(e) => {
                    error!("Transaction failed after {} attempts: {}", attempt, e);
                    return Err(e);
                }
            }
        }
    }
}

use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

use crate::domain::{DomainChange, EventType, Message, MessageError};
use crate::infrastructure::error::{DeliveryError, PersistenceError};
use crate::infrastructure::kafka_abstraction::DeliveryPosition;
use crate::infrastructure::outbox::{MessageRepository, OutboxStore};
use crate::infrastructure::transactional_publisher::TransactionalPublisher;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Domain writes through the outbox: every change is stored together with the
/// event that the relay will publish.
#[derive(Clone)]
pub struct MessageService {
    store: Arc<dyn OutboxStore>,
    repository: Arc<dyn MessageRepository>,
}

impl MessageService {
    pub fn new(store: Arc<dyn OutboxStore>, repository: Arc<dyn MessageRepository>) -> Self {
        Self { store, repository }
    }

    pub async fn create_message(&self, content: &str) -> Result<Message, ServiceError> {
        let message = Message::new(content)?;
        let entry = self
            .store
            .append(DomainChange::Create(message.clone()), EventType::MessageCreated)
            .await?;
        info!("Message {} created, outbox entry {}", message.id, entry.id);
        Ok(message)
    }

    pub async fn update_message(&self, id: &str, content: &str) -> Result<Message, ServiceError> {
        if content.trim().is_empty() {
            return Err(MessageError::EmptyContent.into());
        }
        let entry = self
            .store
            .append(
                DomainChange::Update {
                    id: id.to_string(),
                    content: content.to_string(),
                },
                EventType::MessageUpdated,
            )
            .await
            .map_err(|e| not_found_as_message_error(id, e))?;
        info!("Message {} updated, outbox entry {}", id, entry.id);
        Ok(entry.snapshot()?)
    }

    pub async fn delete_message(&self, id: &str) -> Result<Message, ServiceError> {
        let entry = self
            .store
            .append(
                DomainChange::Delete { id: id.to_string() },
                EventType::MessageDeleted,
            )
            .await
            .map_err(|e| not_found_as_message_error(id, e))?;
        info!("Message {} deleted, outbox entry {}", id, entry.id);
        Ok(entry.snapshot()?)
    }

    pub async fn get_message(&self, id: &str) -> Result<Message, ServiceError> {
        self.repository
            .find_message(id)
            .await?
            .ok_or_else(|| MessageError::NotFound(id.to_string()).into())
    }
}

fn not_found_as_message_error(id: &str, error: PersistenceError) -> ServiceError {
    match error {
        PersistenceError::NotFound(_) => MessageError::NotFound(id.to_string()).into(),
        other => other.into(),
    }
}

/// Stores a message locally and publishes it in a broker transaction.
///
/// The local write and the broker transaction commit independently: when the
/// publish fails the message stays stored. Use the outbox when both must agree.
pub struct DirectTransactionService {
    messages: MessageService,
    publisher: Arc<TransactionalPublisher>,
    topic: String,
}

impl DirectTransactionService {
    pub fn new(
        messages: MessageService,
        publisher: Arc<TransactionalPublisher>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            messages,
            publisher,
            topic: topic.into(),
        }
    }

    pub async fn send_message(
        &self,
        content: &str,
    ) -> Result<(Message, DeliveryPosition), ServiceError> {
        let message = self.messages.create_message(content).await?;
        let payload = message.to_payload()?;

        let mut tx = self.publisher.begin().await?;
        let position = match tx.publish(&self.topic, &message.id, &payload).await {
            Ok(position) => position,
            Err(e) => {
                error!(
                    "Message {} stored but not published to {}: {}",
                    message.id, self.topic, e
                );
                if let Err(abort_error) = tx.abort().await {
                    error!("Abort failed: {}", abort_error);
                }
                return Err(e.into());
            }
        };
        tx.commit().await?;

        info!(
            "Message {} published to {} at offset {}",
            message.id, self.topic, position.offset
        );
        Ok((message, position))
    }
}

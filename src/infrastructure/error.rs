use std::time::Duration;
use thiserror::Error;

/// Failures on the broker side of a delivery.
#[derive(Debug, Error)]
pub enum DeliveryError {
    /// Network or broker unavailability. Retryable.
    #[error("Transient publish failure: {0}")]
    TransientPublishFailure(String),
    /// Malformed payload or configuration. Not retryable, routed to dead-letter.
    #[error("Permanent publish failure: {0}")]
    PermanentPublishFailure(String),
    /// Broker or local rollback. Triggers redelivery.
    #[error("Transaction aborted: {0}")]
    TransactionAborted(String),
    #[error("Timed out after {0:?}")]
    TimeoutExceeded(Duration),
    /// Another producer instance with the same transactional id has taken over.
    #[error("Producer fenced: {0}")]
    ProducerFenced(String),
    #[error("Consumer error: {0}")]
    Consumer(String),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

impl DeliveryError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeliveryError::TransientPublishFailure(_)
                | DeliveryError::TimeoutExceeded(_)
                | DeliveryError::TransactionAborted(_)
        )
    }
}

impl From<rdkafka::error::KafkaError> for DeliveryError {
    fn from(error: rdkafka::error::KafkaError) -> Self {
        use rdkafka::error::{KafkaError, RDKafkaErrorCode};

        match &error {
            KafkaError::MessageProduction(code) => match code {
                RDKafkaErrorCode::MessageSizeTooLarge
                | RDKafkaErrorCode::InvalidMessage
                | RDKafkaErrorCode::InvalidTopic
                | RDKafkaErrorCode::TopicAuthorizationFailed => {
                    DeliveryError::PermanentPublishFailure(error.to_string())
                }
                _ => DeliveryError::TransientPublishFailure(error.to_string()),
            },
            KafkaError::Transaction(rd_error) => {
                if rd_error.is_fatal() {
                    DeliveryError::ProducerFenced(error.to_string())
                } else {
                    DeliveryError::TransactionAborted(error.to_string())
                }
            }
            KafkaError::ClientCreation(_) | KafkaError::ClientConfig(..) => {
                DeliveryError::PermanentPublishFailure(error.to_string())
            }
            KafkaError::MessageConsumption(_)
            | KafkaError::ConsumerCommit(_)
            | KafkaError::Subscription(_) => DeliveryError::Consumer(error.to_string()),
            _ => DeliveryError::TransientPublishFailure(error.to_string()),
        }
    }
}

/// Failures of the local datastore.
#[derive(Debug, Error)]
pub enum PersistenceError {
    #[error("Database error: {0}")]
    Database(#[source] sqlx::Error),
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// Unique key violation.
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Datastore unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for PersistenceError {
    fn from(error: sqlx::Error) -> Self {
        match &error {
            sqlx::Error::RowNotFound => PersistenceError::NotFound(error.to_string()),
            sqlx::Error::Database(db_error) if db_error.is_unique_violation() => {
                PersistenceError::Conflict(db_error.message().to_string())
            }
            _ => PersistenceError::Database(error),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Inconsistent delivery configuration: {0}")]
    Inconsistent(String),
    #[error("Invalid value for {key}: {value}")]
    Invalid { key: String, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_failures_are_retryable() {
        assert!(DeliveryError::TransientPublishFailure("down".into()).is_retryable());
        assert!(DeliveryError::TimeoutExceeded(Duration::from_secs(10)).is_retryable());
        assert!(DeliveryError::TransactionAborted("rollback".into()).is_retryable());
        assert!(!DeliveryError::PermanentPublishFailure("bad".into()).is_retryable());
        assert!(!DeliveryError::ProducerFenced("zombie".into()).is_retryable());
    }
}

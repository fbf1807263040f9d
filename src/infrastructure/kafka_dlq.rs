use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::sync::{Arc, Mutex};
use tracing::{error, info};

use crate::infrastructure::kafka_abstraction::MessagePublisher;

/// A payload the publisher or consumer gave up on, kept for manual handling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub message_id: String,
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
    pub attempts: u32,
    pub failure_reason: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        message_id: impl Into<String>,
        topic: impl Into<String>,
        key: impl Into<String>,
        payload: Vec<u8>,
        attempts: u32,
        failure_reason: impl Into<String>,
    ) -> Self {
        Self {
            message_id: message_id.into(),
            topic: topic.into(),
            key: key.into(),
            payload,
            attempts,
            failure_reason: failure_reason.into(),
            failed_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    async fn store(&self, letter: DeadLetter) -> Result<()>;
}

/// Publishes dead letters as JSON to the dead-letter topic.
#[derive(Clone)]
pub struct TopicDeadLetterQueue {
    publisher: Arc<dyn MessagePublisher>,
    topic: String,
}

impl TopicDeadLetterQueue {
    pub fn new(publisher: Arc<dyn MessagePublisher>, topic: impl Into<String>) -> Self {
        Self {
            publisher,
            topic: topic.into(),
        }
    }
}

#[async_trait]
impl DeadLetterStore for TopicDeadLetterQueue {
    async fn store(&self, letter: DeadLetter) -> Result<()> {
        let body = serde_json::to_vec(&letter).context("Failed to serialize dead letter")?;
        self.publisher
            .publish(&self.topic, &letter.message_id, &body)
            .await
            .with_context(|| format!("Failed to publish dead letter {}", letter.message_id))?;
        info!(
            "Dead letter {} from {} sent to {} after {} attempts",
            letter.message_id, letter.topic, self.topic, letter.attempts
        );
        Ok(())
    }
}

#[derive(Clone)]
pub struct PostgresDeadLetterStore {
    pool: PgPool,
}

impl PostgresDeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterStore for PostgresDeadLetterStore {
    async fn store(&self, letter: DeadLetter) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dead_letters
                (message_id, topic, message_key, payload, attempts, failure_reason, failed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(&letter.message_id)
        .bind(&letter.topic)
        .bind(&letter.key)
        .bind(&letter.payload)
        .bind(letter.attempts as i32)
        .bind(&letter.failure_reason)
        .bind(letter.failed_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to store dead letter {}: {}", letter.message_id, e);
            anyhow::anyhow!("Failed to insert into dead_letters: {}", e)
        })?;
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct InMemoryDeadLetterStore {
    letters: Arc<Mutex<Vec<DeadLetter>>>,
}

impl InMemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn store(&self, letter: DeadLetter) -> Result<()> {
        self.letters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(letter);
        Ok(())
    }
}

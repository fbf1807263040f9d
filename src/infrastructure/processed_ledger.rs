use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};

use crate::domain::{Message, ProcessedRecord};
use crate::infrastructure::error::PersistenceError;

/// Persistent record of message ids whose side effect has been applied.
///
/// `Tx` is a local transaction. The handler's side effect and
/// [`record_processed`](ProcessedLedger::record_processed) share one `Tx`, so they
/// commit or roll back together.
#[async_trait]
pub trait ProcessedLedger: Send + Sync {
    type Tx: Send + 'static;

    async fn begin(&self) -> Result<Self::Tx, PersistenceError>;

    async fn is_processed(&self, message_id: &str) -> Result<bool, PersistenceError>;

    /// Fails with [`PersistenceError::Conflict`] when the id is already recorded.
    async fn record_processed(
        &self,
        tx: &mut Self::Tx,
        message_id: &str,
    ) -> Result<ProcessedRecord, PersistenceError>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), PersistenceError>;

    async fn rollback(&self, tx: Self::Tx) -> Result<(), PersistenceError>;
}

/// A side effect applied to a consumed message inside a ledger transaction.
#[async_trait]
pub trait MessageHandler<Tx: Send>: Send + Sync {
    async fn apply(&self, tx: &mut Tx, message: &Message) -> anyhow::Result<()>;
}

#[derive(Clone)]
pub struct PostgresProcessedLedger {
    pool: PgPool,
}

impl PostgresProcessedLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProcessedLedger for PostgresProcessedLedger {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Tx, PersistenceError> {
        Ok(self.pool.begin().await?)
    }

    async fn is_processed(&self, message_id: &str) -> Result<bool, PersistenceError> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM processed_messages WHERE message_id = $1)",
        )
        .bind(message_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn record_processed(
        &self,
        tx: &mut Self::Tx,
        message_id: &str,
    ) -> Result<ProcessedRecord, PersistenceError> {
        let record = ProcessedRecord::new(message_id);
        sqlx::query("INSERT INTO processed_messages (message_id, processed_at) VALUES ($1, $2)")
            .bind(&record.message_id)
            .bind(record.processed_at)
            .execute(&mut **tx)
            .await?;
        Ok(record)
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), PersistenceError> {
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), PersistenceError> {
        tx.rollback().await?;
        Ok(())
    }
}

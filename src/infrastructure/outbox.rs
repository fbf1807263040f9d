use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use tracing::debug;

use crate::domain::{DomainChange, EventType, Message, OutboxEntry, MESSAGE_AGGREGATE_TYPE};
use crate::infrastructure::error::PersistenceError;

/// Durable ledger of domain changes awaiting publication.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Applies `change` to the domain table and records the matching outbox entry in
    /// one local transaction. Either both rows are written or neither is.
    async fn append(
        &self,
        change: DomainChange,
        event_type: EventType,
    ) -> Result<OutboxEntry, PersistenceError>;

    /// Unprocessed entries, oldest first (ties broken by id). Takes no row locks.
    async fn poll_unprocessed(&self, limit: i64) -> Result<Vec<OutboxEntry>, PersistenceError>;

    /// Flags the entry as relayed. Calling it again is a no-op.
    async fn mark_processed(&self, entry_id: i64) -> Result<(), PersistenceError>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn find_message(&self, id: &str) -> Result<Option<Message>, PersistenceError>;
}

const OUTBOX_COLUMNS: &str =
    "id, aggregate_id, aggregate_type, event_type, payload, created_at, processed";

type MessageRow = (String, String, DateTime<Utc>);

fn into_message((id, content, timestamp): MessageRow) -> Message {
    Message {
        id,
        content,
        timestamp,
    }
}

#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Writes the domain side of `change`; returns the snapshot to publish.
async fn write_message(
    conn: &mut PgConnection,
    change: &DomainChange,
) -> Result<Message, PersistenceError> {
    let row: Option<MessageRow> = match change {
        DomainChange::Create(message) => Some(
            sqlx::query_as(
                r#"
                INSERT INTO messages (id, content, "timestamp")
                VALUES ($1, $2, $3)
                RETURNING id, content, "timestamp"
                "#,
            )
            .bind(&message.id)
            .bind(&message.content)
            .bind(message.timestamp)
            .fetch_one(&mut *conn)
            .await?,
        ),
        DomainChange::Update { id, content } => {
            sqlx::query_as(
                r#"
                UPDATE messages SET content = $2, "timestamp" = $3
                WHERE id = $1
                RETURNING id, content, "timestamp"
                "#,
            )
            .bind(id)
            .bind(content)
            .bind(Utc::now())
            .fetch_optional(&mut *conn)
            .await?
        }
        DomainChange::Delete { id } => {
            sqlx::query_as(
                r#"
                DELETE FROM messages WHERE id = $1
                RETURNING id, content, "timestamp"
                "#,
            )
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?
        }
    };

    row.map(into_message)
        .ok_or_else(|| PersistenceError::NotFound(format!("message {}", change.aggregate_id())))
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn append(
        &self,
        change: DomainChange,
        event_type: EventType,
    ) -> Result<OutboxEntry, PersistenceError> {
        let mut tx = self.pool.begin().await?;

        let snapshot = write_message(&mut tx, &change).await?;
        let payload = serde_json::to_string(&snapshot)?;

        let entry: OutboxEntry = sqlx::query_as(&format!(
            r#"
            INSERT INTO outbox_events (aggregate_id, aggregate_type, event_type, payload, created_at, processed)
            VALUES ($1, $2, $3, $4, $5, FALSE)
            RETURNING {}
            "#,
            OUTBOX_COLUMNS
        ))
        .bind(&snapshot.id)
        .bind(MESSAGE_AGGREGATE_TYPE)
        .bind(event_type.as_ref())
        .bind(&payload)
        .bind(Utc::now())
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        debug!(
            "Outbox: appended entry {} ({}) for message {}",
            entry.id, entry.event_type, entry.aggregate_id
        );
        Ok(entry)
    }

    async fn poll_unprocessed(&self, limit: i64) -> Result<Vec<OutboxEntry>, PersistenceError> {
        let entries = sqlx::query_as::<_, OutboxEntry>(&format!(
            r#"
            SELECT {}
            FROM outbox_events
            WHERE processed = FALSE
            ORDER BY created_at ASC, id ASC
            LIMIT $1
            "#,
            OUTBOX_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(entries)
    }

    async fn mark_processed(&self, entry_id: i64) -> Result<(), PersistenceError> {
        let result =
            sqlx::query("UPDATE outbox_events SET processed = TRUE WHERE id = $1 AND processed = FALSE")
                .bind(entry_id)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            debug!("Outbox: entry {} already processed", entry_id);
        }
        Ok(())
    }
}

#[async_trait]
impl MessageRepository for PostgresOutboxStore {
    async fn find_message(&self, id: &str) -> Result<Option<Message>, PersistenceError> {
        let row: Option<MessageRow> =
            sqlx::query_as(r#"SELECT id, content, "timestamp" FROM messages WHERE id = $1"#)
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(into_message))
    }
}

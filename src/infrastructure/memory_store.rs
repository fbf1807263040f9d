//! In-memory datastore with the same transactional contracts as the Postgres stores.
//!
//! Ledger transactions stage their writes and apply them on commit, so a rolled
//! back or failed transaction leaves nothing behind. Fault switches let tests
//! fail the outbox write, the relay's `mark_processed` or a ledger commit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::{
    DomainChange, EventType, Message, OutboxEntry, ProcessedRecord, MESSAGE_AGGREGATE_TYPE,
};
use crate::infrastructure::error::PersistenceError;
use crate::infrastructure::outbox::{MessageRepository, OutboxStore};
use crate::infrastructure::processed_ledger::ProcessedLedger;

#[derive(Default)]
struct Tables {
    messages: HashMap<String, Message>,
    outbox: Vec<OutboxEntry>,
    last_outbox_id: i64,
    processed: HashMap<String, ProcessedRecord>,
    /// Applied side effects per key, written by handlers through [`MemoryTransaction`].
    effects: HashMap<String, usize>,
}

impl Tables {
    fn push_outbox(
        &mut self,
        aggregate_id: &str,
        event_type: &str,
        payload: String,
        created_at: DateTime<Utc>,
    ) -> OutboxEntry {
        self.last_outbox_id += 1;
        let entry = OutboxEntry {
            id: self.last_outbox_id,
            aggregate_id: aggregate_id.to_string(),
            aggregate_type: MESSAGE_AGGREGATE_TYPE.to_string(),
            event_type: event_type.to_string(),
            payload,
            created_at,
            processed: false,
        };
        self.outbox.push(entry.clone());
        entry
    }
}

#[derive(Default)]
struct Faults {
    fail_outbox_writes: AtomicBool,
    fail_next_mark_processed: AtomicUsize,
    fail_next_commits: AtomicUsize,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Staged writes of one ledger transaction.
#[derive(Debug, Default)]
pub struct MemoryTransaction {
    processed: Vec<ProcessedRecord>,
    effects: Vec<String>,
}

impl MemoryTransaction {
    /// Stages a side effect under `key`; visible through
    /// [`MemoryDatastore::effect_count`] once the transaction commits.
    pub fn record_effect(&mut self, key: impl Into<String>) {
        self.effects.push(key.into());
    }
}

#[derive(Clone, Default)]
pub struct MemoryDatastore {
    tables: Arc<Mutex<Tables>>,
    faults: Arc<Faults>,
}

impl MemoryDatastore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every `append` fails after the domain write was staged.
    pub fn fail_outbox_writes(&self, fail: bool) {
        self.faults.fail_outbox_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_next_mark_processed(&self) {
        self.faults
            .fail_next_mark_processed
            .fetch_add(1, Ordering::SeqCst);
    }

    pub fn fail_next_commits(&self, count: usize) {
        self.faults.fail_next_commits.store(count, Ordering::SeqCst);
    }

    /// Inserts an outbox entry directly with an explicit creation time.
    pub async fn seed_outbox(
        &self,
        message: &Message,
        event_type: &str,
        created_at: DateTime<Utc>,
    ) -> Result<OutboxEntry, PersistenceError> {
        let payload = serde_json::to_string(message)?;
        let mut tables = self.tables.lock().await;
        Ok(tables.push_outbox(&message.id, event_type, payload, created_at))
    }

    pub async fn outbox_entries(&self) -> Vec<OutboxEntry> {
        self.tables.lock().await.outbox.clone()
    }

    pub async fn message(&self, id: &str) -> Option<Message> {
        self.tables.lock().await.messages.get(id).cloned()
    }

    pub async fn message_count(&self) -> usize {
        self.tables.lock().await.messages.len()
    }

    pub async fn processed_count(&self, message_id: &str) -> usize {
        usize::from(self.tables.lock().await.processed.contains_key(message_id))
    }

    pub async fn processed_total(&self) -> usize {
        self.tables.lock().await.processed.len()
    }

    pub async fn effect_count(&self, key: &str) -> usize {
        self.tables
            .lock()
            .await
            .effects
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl OutboxStore for MemoryDatastore {
    async fn append(
        &self,
        change: DomainChange,
        event_type: EventType,
    ) -> Result<OutboxEntry, PersistenceError> {
        let mut tables = self.tables.lock().await;

        let snapshot = match &change {
            DomainChange::Create(message) => {
                if tables.messages.contains_key(&message.id) {
                    return Err(PersistenceError::Conflict(format!(
                        "message {} already exists",
                        message.id
                    )));
                }
                message.clone()
            }
            DomainChange::Update { id, content } => tables
                .messages
                .get(id)
                .map(|current| current.with_content(content.clone()))
                .ok_or_else(|| PersistenceError::NotFound(format!("message {}", id)))?,
            DomainChange::Delete { id } => tables
                .messages
                .get(id)
                .cloned()
                .ok_or_else(|| PersistenceError::NotFound(format!("message {}", id)))?,
        };

        if self.faults.fail_outbox_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::Unavailable(
                "outbox write failed".to_string(),
            ));
        }
        let payload = serde_json::to_string(&snapshot)?;

        match &change {
            DomainChange::Delete { id } => {
                tables.messages.remove(id);
            }
            _ => {
                tables
                    .messages
                    .insert(snapshot.id.clone(), snapshot.clone());
            }
        }
        let entry = tables.push_outbox(&snapshot.id, event_type.as_ref(), payload, Utc::now());
        debug!(
            "MemoryDatastore: appended entry {} ({}) for {}",
            entry.id, entry.event_type, entry.aggregate_id
        );
        Ok(entry)
    }

    async fn poll_unprocessed(&self, limit: i64) -> Result<Vec<OutboxEntry>, PersistenceError> {
        let tables = self.tables.lock().await;
        let mut entries: Vec<OutboxEntry> = tables
            .outbox
            .iter()
            .filter(|entry| !entry.processed)
            .cloned()
            .collect();
        entries.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        entries.truncate(limit.max(0) as usize);
        Ok(entries)
    }

    async fn mark_processed(&self, entry_id: i64) -> Result<(), PersistenceError> {
        if take_one(&self.faults.fail_next_mark_processed) {
            return Err(PersistenceError::Unavailable(format!(
                "could not mark outbox entry {}",
                entry_id
            )));
        }
        let mut tables = self.tables.lock().await;
        if let Some(entry) = tables.outbox.iter_mut().find(|entry| entry.id == entry_id) {
            entry.processed = true;
        }
        Ok(())
    }
}

#[async_trait]
impl MessageRepository for MemoryDatastore {
    async fn find_message(&self, id: &str) -> Result<Option<Message>, PersistenceError> {
        Ok(self.tables.lock().await.messages.get(id).cloned())
    }
}

#[async_trait]
impl ProcessedLedger for MemoryDatastore {
    type Tx = MemoryTransaction;

    async fn begin(&self) -> Result<Self::Tx, PersistenceError> {
        Ok(MemoryTransaction::default())
    }

    async fn is_processed(&self, message_id: &str) -> Result<bool, PersistenceError> {
        Ok(self.tables.lock().await.processed.contains_key(message_id))
    }

    async fn record_processed(
        &self,
        tx: &mut Self::Tx,
        message_id: &str,
    ) -> Result<ProcessedRecord, PersistenceError> {
        let already_staged = tx.processed.iter().any(|r| r.message_id == message_id);
        if already_staged || self.tables.lock().await.processed.contains_key(message_id) {
            return Err(PersistenceError::Conflict(format!(
                "message {} already processed",
                message_id
            )));
        }
        let record = ProcessedRecord::new(message_id);
        tx.processed.push(record.clone());
        Ok(record)
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), PersistenceError> {
        if take_one(&self.faults.fail_next_commits) {
            return Err(PersistenceError::Unavailable(
                "commit failed".to_string(),
            ));
        }

        let mut tables = self.tables.lock().await;
        if let Some(duplicate) = tx
            .processed
            .iter()
            .find(|r| tables.processed.contains_key(&r.message_id))
        {
            return Err(PersistenceError::Conflict(format!(
                "message {} already processed",
                duplicate.message_id
            )));
        }

        for record in tx.processed {
            tables.processed.insert(record.message_id.clone(), record);
        }
        for key in tx.effects {
            *tables.effects.entry(key).or_insert(0) += 1;
        }
        Ok(())
    }

    async fn rollback(&self, _tx: Self::Tx) -> Result<(), PersistenceError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn failed_outbox_write_leaves_no_domain_row() {
        let store = MemoryDatastore::new();
        store.fail_outbox_writes(true);
        let message = Message::new("hello").unwrap();

        let result = store
            .append(DomainChange::Create(message.clone()), EventType::MessageCreated)
            .await;

        assert!(result.is_err());
        assert!(store.message(&message.id).await.is_none());
        assert!(store.outbox_entries().await.is_empty());
    }

    #[tokio::test]
    async fn rolled_back_transaction_discards_staged_writes() {
        let store = MemoryDatastore::new();
        let mut tx = store.begin().await.unwrap();
        tx.record_effect("m-1");
        store.record_processed(&mut tx, "m-1").await.unwrap();
        store.rollback(tx).await.unwrap();

        assert_eq!(store.processed_count("m-1").await, 0);
        assert_eq!(store.effect_count("m-1").await, 0);
    }

    #[tokio::test]
    async fn second_commit_of_the_same_id_conflicts() {
        let store = MemoryDatastore::new();
        let mut first = store.begin().await.unwrap();
        let mut second = store.begin().await.unwrap();
        store.record_processed(&mut first, "m-1").await.unwrap();
        store.record_processed(&mut second, "m-1").await.unwrap();

        store.commit(first).await.unwrap();
        assert!(matches!(
            store.commit(second).await,
            Err(PersistenceError::Conflict(_))
        ));
        assert_eq!(store.processed_count("m-1").await, 1);
    }
}

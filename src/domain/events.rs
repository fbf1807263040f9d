use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum_macros::{AsRefStr, Display, EnumString};

use crate::domain::Message;

pub const MESSAGE_AGGREGATE_TYPE: &str = "Message";

/// Event types written to the outbox. Stored as their `SCREAMING_SNAKE_CASE` name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    MessageCreated,
    MessageUpdated,
    MessageDeleted,
}

impl EventType {
    /// Parses a stored event type; `None` for types this build does not know.
    pub fn parse(raw: &str) -> Option<Self> {
        EventType::from_str(raw).ok()
    }
}

/// A row of `outbox_events`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboxEntry {
    pub id: i64,
    pub aggregate_id: String,
    pub aggregate_type: String,
    pub event_type: String,
    pub payload: String,
    pub created_at: DateTime<Utc>,
    pub processed: bool,
}

impl OutboxEntry {
    /// Decodes the record snapshot captured when the entry was written.
    pub fn snapshot(&self) -> Result<Message, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

/// A row of `processed_messages`: the side effect for `message_id` has been applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProcessedRecord {
    pub message_id: String,
    pub processed_at: DateTime<Utc>,
}

impl ProcessedRecord {
    pub fn new(message_id: impl Into<String>) -> Self {
        Self {
            message_id: message_id.into(),
            processed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_types_use_their_stored_names() {
        assert_eq!(EventType::MessageCreated.to_string(), "MESSAGE_CREATED");
        assert_eq!(EventType::MessageDeleted.as_ref(), "MESSAGE_DELETED");
        assert_eq!(
            EventType::parse("MESSAGE_UPDATED"),
            Some(EventType::MessageUpdated)
        );
        assert_eq!(EventType::parse("ACCOUNT_CLOSED"), None);
    }
}

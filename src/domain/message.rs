use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// The business record synchronised to the broker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MessageError {
    #[error("Message content cannot be empty")]
    EmptyContent,
    #[error("Message not found: {0}")]
    NotFound(String),
}

impl Message {
    pub fn new(content: impl Into<String>) -> Result<Self, MessageError> {
        let content = content.into();
        if content.trim().is_empty() {
            return Err(MessageError::EmptyContent);
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            content,
            timestamp: Utc::now(),
        })
    }

    pub fn with_content(&self, content: impl Into<String>) -> Self {
        Self {
            id: self.id.clone(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }
}

/// A mutation of the `messages` table, handed to the outbox write path.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainChange {
    Create(Message),
    Update { id: String, content: String },
    Delete { id: String },
}

impl DomainChange {
    pub fn aggregate_id(&self) -> &str {
        match self {
            DomainChange::Create(message) => &message.id,
            DomainChange::Update { id, .. } | DomainChange::Delete { id } => id,
        }
    }
}

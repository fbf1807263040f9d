use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::domain::EventType;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaConfig {
    pub bootstrap_servers: String,
    pub client_id: String,
    /// Stable identity of this process; part of the transactional id.
    pub instance_id: String,
    pub auto_offset_reset: String,
    pub session_timeout_ms: i32,
    pub heartbeat_interval_ms: i32,
    pub max_poll_interval_ms: i32,
    pub request_timeout_ms: i32,
    pub transaction_timeout_ms: i32,
    pub security_protocol: String,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            client_id: "delivery-semantics".to_string(),
            instance_id: "local".to_string(),
            auto_offset_reset: "earliest".to_string(),
            session_timeout_ms: 10000,
            heartbeat_interval_ms: 3000,
            max_poll_interval_ms: 300000,
            request_timeout_ms: 30000,
            transaction_timeout_ms: 60000,
            security_protocol: "PLAINTEXT".to_string(),
        }
    }
}

impl KafkaConfig {
    /// `<client-id>-tx-<instance-id>`: survives restarts so the broker can fence
    /// a previous incarnation of this instance.
    pub fn transactional_id(&self) -> String {
        format!("{}-tx-{}", self.client_id, self.instance_id)
    }

    /// Upper bound for blocking transaction calls (init/commit/abort).
    pub fn transaction_call_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms.max(0) as u64)
    }
}

/// Logical topic names, each overridable by configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicConfig {
    pub at_least_once: String,
    pub at_most_once: String,
    pub exactly_once: String,
    pub transaction: String,
    pub message_created: String,
    pub message_updated: String,
    pub message_deleted: String,
    pub default_topic: String,
    pub dead_letter: String,
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            at_least_once: "at-least-once-topic".to_string(),
            at_most_once: "at-most-once-topic".to_string(),
            exactly_once: "exactly-once-topic".to_string(),
            transaction: "transaction-topic".to_string(),
            message_created: "message-created-topic".to_string(),
            message_updated: "message-updated-topic".to_string(),
            message_deleted: "message-deleted-topic".to_string(),
            default_topic: "default-topic".to_string(),
            dead_letter: "dead-letter-topic".to_string(),
        }
    }
}

impl TopicConfig {
    /// Topic for a stored outbox event type. Unknown types go to the default topic.
    pub fn topic_for_event(&self, event_type: &str) -> &str {
        match EventType::parse(event_type) {
            Some(EventType::MessageCreated) => &self.message_created,
            Some(EventType::MessageUpdated) => &self.message_updated,
            Some(EventType::MessageDeleted) => &self.message_deleted,
            None => {
                tracing::warn!(
                    "Unmapped event type {:?}, routing to {}",
                    event_type,
                    self.default_topic
                );
                &self.default_topic
            }
        }
    }

    pub fn all(&self) -> Vec<&str> {
        vec![
            &self.at_least_once,
            &self.at_most_once,
            &self.exactly_once,
            &self.transaction,
            &self.message_created,
            &self.message_updated,
            &self.message_deleted,
            &self.default_topic,
            &self.dead_letter,
        ]
    }
}

/// Settings used when creating the delivery topics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KafkaTopicConfig {
    pub partitions: i32,
    pub replication_factor: i32,
    pub min_insync_replicas: i32,
    pub cleanup_policy: String,
    pub retention_ms: i64,
    pub segment_bytes: i64,
    pub max_message_bytes: i32,
}

impl Default for KafkaTopicConfig {
    fn default() -> Self {
        Self {
            partitions: 3,
            replication_factor: 3,
            min_insync_replicas: 2,
            cleanup_policy: "delete".to_string(),
            retention_ms: 7 * 24 * 60 * 60 * 1000, // 7 days
            segment_bytes: 1073741824,
            max_message_bytes: 1000000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_types_map_to_their_topics() {
        let topics = TopicConfig::default();
        assert_eq!(topics.topic_for_event("MESSAGE_CREATED"), "message-created-topic");
        assert_eq!(topics.topic_for_event("MESSAGE_UPDATED"), "message-updated-topic");
        assert_eq!(topics.topic_for_event("MESSAGE_DELETED"), "message-deleted-topic");
        assert_eq!(topics.topic_for_event("SOMETHING_ELSE"), "default-topic");
        assert_eq!(topics.topic_for_event(""), "default-topic");
    }

    #[test]
    fn transactional_id_is_stable_per_instance() {
        let config = KafkaConfig {
            client_id: "orders".to_string(),
            instance_id: "node-1".to_string(),
            ..Default::default()
        };
        assert_eq!(config.transactional_id(), "orders-tx-node-1");
        assert_eq!(config.transactional_id(), config.clone().transactional_id());
    }
}

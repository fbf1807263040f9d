pub mod config;
pub mod dedup_cache;
pub mod dedup_consumer;
pub mod delivery_consumer;
pub mod delivery_mode;
pub mod error;
pub mod kafka_abstraction;
pub mod kafka_config;
pub mod kafka_dlq;
pub mod kafka_metrics;
pub mod logging;
pub mod memory_broker;
pub mod memory_store;
pub mod outbox;
pub mod outbox_poller;
pub mod processed_ledger;
pub mod retrying_publisher;
pub mod shutdown;
pub mod transactional_publisher;

pub use config::AppConfig;
pub use dedup_cache::DedupCache;
pub use dedup_consumer::{ConsumeOutcome, DeduplicatingConsumer};
pub use delivery_consumer::{ConsumerPool, ConsumerPoolConfig, MessageConsumer};
pub use delivery_mode::{AckMode, DeliveryGuarantee, DeliveryMode, IsolationLevel};
pub use error::{ConfigError, DeliveryError, PersistenceError};
pub use kafka_abstraction::{
    KafkaProducer, KafkaSubscriber, KafkaTransactionalProducer, MessagePublisher,
    MessageSubscriber, TransactionalProducer,
};
pub use kafka_config::{KafkaConfig, TopicConfig};
pub use kafka_dlq::{DeadLetter, DeadLetterStore, PostgresDeadLetterStore, TopicDeadLetterQueue};
pub use kafka_metrics::DeliveryMetrics;
pub use memory_broker::{ConsumerSettings, InMemoryBroker};
pub use memory_store::MemoryDatastore;
pub use outbox::{MessageRepository, OutboxStore, PostgresOutboxStore};
pub use outbox_poller::{OutboxRelay, RelayConfig};
pub use processed_ledger::{MessageHandler, PostgresProcessedLedger, ProcessedLedger};
pub use retrying_publisher::{RetryPolicy, RetryingPublisher};
pub use shutdown::{Shutdown, ShutdownManager};
pub use transactional_publisher::TransactionalPublisher;

pub mod application;
pub mod domain;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{LoggingHandler, MessageService};
pub use domain::{Message, MessageError};
pub use infrastructure::{
    AppConfig, DeliveryError, DeliveryMode, InMemoryBroker, KafkaConfig, MemoryDatastore,
    OutboxRelay, PersistenceError, TopicConfig,
};

pub mod handlers;
pub mod producers;
pub mod services;

pub use handlers::LoggingHandler;
pub use producers::{AtLeastOnceProducer, AtMostOnceProducer, ExactlyOnceProducer};
pub use services::{DirectTransactionService, MessageService, ServiceError};

use async_trait::async_trait;
use tracing::info;

use crate::domain::Message;
use crate::infrastructure::processed_ledger::MessageHandler;

/// Logs each consumed message. Works inside any ledger transaction type.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

#[async_trait]
impl<Tx: Send + 'static> MessageHandler<Tx> for LoggingHandler {
    async fn apply(&self, _tx: &mut Tx, message: &Message) -> anyhow::Result<()> {
        info!(
            "Processing message with ID: {}, content length: {}",
            message.id,
            message.content.len()
        );
        Ok(())
    }
}

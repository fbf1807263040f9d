use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::domain::Message;
use crate::infrastructure::dedup_cache::DedupCache;
use crate::infrastructure::error::{DeliveryError, PersistenceError};
use crate::infrastructure::kafka_abstraction::Delivery;
use crate::infrastructure::kafka_dlq::{DeadLetter, DeadLetterStore};
use crate::infrastructure::kafka_metrics::DeliveryMetrics;
use crate::infrastructure::processed_ledger::{MessageHandler, ProcessedLedger};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// The side effect ran and the delivery was acknowledged.
    Applied,
    /// Already processed; acknowledged without running the side effect.
    Duplicate,
    /// Lost on purpose (at-most-once).
    Dropped,
    /// Undecodable; parked in the dead-letter store and acknowledged.
    DeadLettered,
}

/// Parks a payload that is not a [`Message`] and acknowledges it so it does not
/// block its partition.
pub(crate) async fn dead_letter_undecodable(
    dead_letters: &dyn DeadLetterStore,
    metrics: &DeliveryMetrics,
    delivery: &Delivery,
    reason: &serde_json::Error,
) -> Result<ConsumeOutcome, DeliveryError> {
    let record = &delivery.record;
    let reference = record
        .key
        .clone()
        .unwrap_or_else(|| format!("{}-{}-{}", record.topic, record.partition, record.offset));
    error!(
        "Undecodable record {}:{}@{} ({}): {}",
        record.topic, record.partition, record.offset, reference, reason
    );

    let letter = DeadLetter::new(
        reference.clone(),
        record.topic.clone(),
        reference,
        record.payload.clone(),
        1,
        format!("undecodable payload: {}", reason),
    );
    dead_letters
        .store(letter)
        .await
        .map_err(|e| DeliveryError::Consumer(format!("dead-letter store failed: {:#}", e)))?;
    DeliveryMetrics::incr(&metrics.dead_lettered);

    delivery.acknowledge().await?;
    Ok(ConsumeOutcome::DeadLettered)
}

/// Applies each message id's side effect at most once, on top of at-least-once delivery.
///
/// The ledger is the source of truth; the cache only saves ledger reads. The side
/// effect and the ledger row share one local transaction, and the delivery is
/// acknowledged only after that transaction commits.
pub struct DeduplicatingConsumer<L: ProcessedLedger, H> {
    ledger: Arc<L>,
    handler: Arc<H>,
    cache: Arc<DedupCache>,
    dead_letters: Arc<dyn DeadLetterStore>,
    metrics: Arc<DeliveryMetrics>,
}

impl<L, H> DeduplicatingConsumer<L, H>
where
    L: ProcessedLedger + 'static,
    H: MessageHandler<L::Tx> + 'static,
{
    pub fn new(
        ledger: Arc<L>,
        handler: Arc<H>,
        cache: Arc<DedupCache>,
        dead_letters: Arc<dyn DeadLetterStore>,
        metrics: Arc<DeliveryMetrics>,
    ) -> Self {
        Self {
            ledger,
            handler,
            cache,
            dead_letters,
            metrics,
        }
    }

    pub fn cache(&self) -> &DedupCache {
        &self.cache
    }

    /// An `Err` means nothing was committed and the delivery was not acknowledged.
    pub async fn handle(&self, delivery: &Delivery) -> Result<ConsumeOutcome, DeliveryError> {
        let message = match Message::from_payload(&delivery.record.payload) {
            Ok(message) => message,
            Err(e) => {
                return dead_letter_undecodable(
                    self.dead_letters.as_ref(),
                    &self.metrics,
                    delivery,
                    &e,
                )
                .await
            }
        };

        if self.is_duplicate(&message.id).await? {
            return self.skip(delivery, &message.id).await;
        }

        let mut tx = self.ledger.begin().await?;

        if let Err(e) = self.handler.apply(&mut tx, &message).await {
            self.discard(tx, &message.id).await;
            DeliveryMetrics::incr(&self.metrics.apply_failures);
            return Err(DeliveryError::Consumer(format!(
                "handler failed for message {}: {:#}",
                message.id, e
            )));
        }

        match self.ledger.record_processed(&mut tx, &message.id).await {
            Ok(_) => {}
            Err(PersistenceError::Conflict(_)) => {
                self.discard(tx, &message.id).await;
                return self.skip(delivery, &message.id).await;
            }
            Err(e) => {
                self.discard(tx, &message.id).await;
                DeliveryMetrics::incr(&self.metrics.apply_failures);
                return Err(e.into());
            }
        }

        match self.ledger.commit(tx).await {
            Ok(()) => {}
            Err(PersistenceError::Conflict(_)) => return self.skip(delivery, &message.id).await,
            Err(e) => {
                DeliveryMetrics::incr(&self.metrics.apply_failures);
                return Err(e.into());
            }
        }

        self.cache.insert(message.id.clone());
        DeliveryMetrics::incr(&self.metrics.messages_applied);
        info!("Processed message {} exactly once", message.id);

        if let Err(e) = delivery.acknowledge().await {
            DeliveryMetrics::incr(&self.metrics.ack_failures);
            warn!(
                "Message {} committed but not acknowledged; its redelivery will be skipped: {}",
                message.id, e
            );
        }
        Ok(ConsumeOutcome::Applied)
    }

    async fn is_duplicate(&self, message_id: &str) -> Result<bool, DeliveryError> {
        if self.cache.contains(message_id) {
            return Ok(true);
        }
        if self.ledger.is_processed(message_id).await? {
            self.cache.insert(message_id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn skip(
        &self,
        delivery: &Delivery,
        message_id: &str,
    ) -> Result<ConsumeOutcome, DeliveryError> {
        self.cache.insert(message_id);
        DeliveryMetrics::incr(&self.metrics.duplicates_skipped);
        warn!("Duplicate message detected and skipped: {}", message_id);

        if let Err(e) = delivery.acknowledge().await {
            DeliveryMetrics::incr(&self.metrics.ack_failures);
            warn!("Acknowledgment of duplicate {} failed: {}", message_id, e);
        }
        Ok(ConsumeOutcome::Duplicate)
    }

    async fn discard(&self, tx: L::Tx, message_id: &str) {
        if let Err(e) = self.ledger.rollback(tx).await {
            error!("Rollback for message {} failed: {}", message_id, e);
        } else {
            debug!("Rolled back processing of message {}", message_id);
        }
    }
}

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, warn};

use crate::infrastructure::error::DeliveryError;
use crate::infrastructure::kafka_abstraction::{
    DeliveryPosition, OutboundRecord, TransactionalProducer,
};

pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Publishes records inside broker transactions, one transaction at a time.
///
/// A transaction is opened with [`begin`](Self::begin) and must be finished with
/// [`PublishTransaction::commit`] or [`PublishTransaction::abort`]; nothing is
/// committed implicitly. Concurrent callers wait for the transaction in flight.
pub struct TransactionalPublisher {
    producer: Arc<dyn TransactionalProducer>,
    in_flight: Mutex<()>,
    send_timeout: Duration,
    /// Set when a transaction was dropped unfinished.
    dangling: AtomicBool,
}

impl TransactionalPublisher {
    pub fn new(producer: Arc<dyn TransactionalProducer>, send_timeout: Duration) -> Self {
        Self {
            producer,
            in_flight: Mutex::new(()),
            send_timeout,
            dangling: AtomicBool::new(false),
        }
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    pub async fn begin(&self) -> Result<PublishTransaction<'_>, DeliveryError> {
        let guard = self.in_flight.lock().await;

        if self.dangling.swap(false, Ordering::SeqCst) {
            warn!("TransactionalPublisher: aborting transaction left open by a previous caller");
            if let Err(e) = self.producer.abort_transaction().await {
                warn!("TransactionalPublisher: abort of abandoned transaction failed: {}", e);
            }
        }

        self.producer.begin_transaction().await?;
        Ok(PublishTransaction {
            publisher: self,
            _guard: guard,
            finished: false,
        })
    }

    /// Publishes every record in one transaction. Any failure aborts the whole set.
    pub async fn publish_all(
        &self,
        records: &[OutboundRecord],
    ) -> Result<Vec<DeliveryPosition>, DeliveryError> {
        let mut tx = self.begin().await?;
        let mut positions = Vec::with_capacity(records.len());

        for record in records {
            match tx.publish(&record.topic, &record.key, &record.payload).await {
                Ok(position) => positions.push(position),
                Err(e) => {
                    error!(
                        "TransactionalPublisher: publish of {} to {} failed: {}",
                        record.key, record.topic, e
                    );
                    if let Err(abort_error) = tx.abort().await {
                        warn!("TransactionalPublisher: abort failed: {}", abort_error);
                    }
                    return Err(e);
                }
            }
        }

        tx.commit().await?;
        Ok(positions)
    }
}

/// An open broker transaction. Holds the publisher's in-flight slot until finished.
pub struct PublishTransaction<'a> {
    publisher: &'a TransactionalPublisher,
    _guard: MutexGuard<'a, ()>,
    finished: bool,
}

impl PublishTransaction<'_> {
    /// Sends one record and waits for the broker's acknowledgment, bounded by the send timeout.
    pub async fn publish(
        &mut self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<DeliveryPosition, DeliveryError> {
        let timeout = self.publisher.send_timeout;
        let position = tokio::time::timeout(timeout, self.publisher.producer.send(topic, key, payload))
            .await
            .map_err(|_| DeliveryError::TimeoutExceeded(timeout))??;
        debug!(
            "TransactionalPublisher: {} staged at {}:{}@{}",
            key, topic, position.partition, position.offset
        );
        Ok(position)
    }

    pub async fn commit(mut self) -> Result<(), DeliveryError> {
        self.finished = true;
        let producer = &self.publisher.producer;

        if let Err(e) = producer.commit_transaction().await {
            error!("TransactionalPublisher: commit failed: {}", e);
            if !matches!(e, DeliveryError::ProducerFenced(_)) {
                if let Err(abort_error) = producer.abort_transaction().await {
                    warn!("TransactionalPublisher: abort after failed commit failed: {}", abort_error);
                }
            }
            return Err(e);
        }
        Ok(())
    }

    pub async fn abort(mut self) -> Result<(), DeliveryError> {
        self.finished = true;
        self.publisher.producer.abort_transaction().await
    }
}

impl Drop for PublishTransaction<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.publisher.dangling.store(true, Ordering::SeqCst);
        }
    }
}

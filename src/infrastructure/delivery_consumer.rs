use anyhow::{Context, Result};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::Message;
use crate::infrastructure::dedup_cache::DedupCache;
use crate::infrastructure::dedup_consumer::{
    dead_letter_undecodable, ConsumeOutcome, DeduplicatingConsumer,
};
use crate::infrastructure::delivery_mode::{DeliveryGuarantee, DeliveryMode};
use crate::infrastructure::error::DeliveryError;
use crate::infrastructure::kafka_abstraction::{Delivery, MessageSubscriber, Subscription};
use crate::infrastructure::kafka_dlq::DeadLetterStore;
use crate::infrastructure::kafka_metrics::DeliveryMetrics;
use crate::infrastructure::processed_ledger::{MessageHandler, ProcessedLedger};

/// Consumes records with the guarantee of the configured [`DeliveryMode`].
///
/// - at-most-once acknowledges on receipt, before applying; failures are dropped.
/// - at-least-once applies, commits, then acknowledges; failures are not
///   acknowledged and come back.
/// - exactly-once goes through the [`DeduplicatingConsumer`].
pub struct MessageConsumer<L: ProcessedLedger, H> {
    guarantee: DeliveryGuarantee,
    ledger: Arc<L>,
    handler: Arc<H>,
    dedup: DeduplicatingConsumer<L, H>,
    dead_letters: Arc<dyn DeadLetterStore>,
    metrics: Arc<DeliveryMetrics>,
}

impl<L, H> MessageConsumer<L, H>
where
    L: ProcessedLedger + 'static,
    H: MessageHandler<L::Tx> + 'static,
{
    pub fn new(
        mode: &DeliveryMode,
        ledger: Arc<L>,
        handler: Arc<H>,
        cache: Arc<DedupCache>,
        dead_letters: Arc<dyn DeadLetterStore>,
        metrics: Arc<DeliveryMetrics>,
    ) -> Self {
        let dedup = DeduplicatingConsumer::new(
            Arc::clone(&ledger),
            Arc::clone(&handler),
            cache,
            Arc::clone(&dead_letters),
            Arc::clone(&metrics),
        );
        Self {
            guarantee: mode.guarantee,
            ledger,
            handler,
            dedup,
            dead_letters,
            metrics,
        }
    }

    pub fn guarantee(&self) -> DeliveryGuarantee {
        self.guarantee
    }

    pub async fn handle(&self, delivery: &Delivery) -> Result<ConsumeOutcome, DeliveryError> {
        DeliveryMetrics::incr(&self.metrics.messages_consumed);
        match self.guarantee {
            DeliveryGuarantee::AtMostOnce => Ok(self.handle_at_most_once(delivery).await),
            DeliveryGuarantee::AtLeastOnce => self.handle_at_least_once(delivery).await,
            DeliveryGuarantee::ExactlyOnce => self.dedup.handle(delivery).await,
        }
    }

    async fn handle_at_most_once(&self, delivery: &Delivery) -> ConsumeOutcome {
        if let Err(e) = delivery.acknowledge().await {
            DeliveryMetrics::incr(&self.metrics.ack_failures);
            warn!("At-most-once acknowledgment failed: {}", e);
        }

        let outcome = match Message::from_payload(&delivery.record.payload) {
            Ok(message) => self.apply(&message).await.map(|_| message.id),
            Err(e) => Err(DeliveryError::Consumer(format!("undecodable payload: {}", e))),
        };

        match outcome {
            Ok(id) => {
                DeliveryMetrics::incr(&self.metrics.messages_applied);
                info!("Processed message {} with at-most-once semantics", id);
                ConsumeOutcome::Applied
            }
            Err(e) => {
                DeliveryMetrics::incr(&self.metrics.messages_dropped);
                error!(
                    "Message at {}:{}@{} lost (at-most-once): {}",
                    delivery.record.topic, delivery.record.partition, delivery.record.offset, e
                );
                ConsumeOutcome::Dropped
            }
        }
    }

    async fn handle_at_least_once(
        &self,
        delivery: &Delivery,
    ) -> Result<ConsumeOutcome, DeliveryError> {
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

        if let Err(e) = self.apply(&message).await {
            DeliveryMetrics::incr(&self.metrics.apply_failures);
            return Err(e);
        }
        DeliveryMetrics::incr(&self.metrics.messages_applied);
        info!("Processed message {} with at-least-once semantics", message.id);

        if let Err(e) = delivery.acknowledge().await {
            DeliveryMetrics::incr(&self.metrics.ack_failures);
            warn!(
                "Message {} applied but not acknowledged; it may be applied again: {}",
                message.id, e
            );
        }
        Ok(ConsumeOutcome::Applied)
    }

    /// Runs the side effect in its own local transaction, without a ledger record.
    async fn apply(&self, message: &Message) -> Result<(), DeliveryError> {
        let mut tx = self.ledger.begin().await?;
        if let Err(e) = self.handler.apply(&mut tx, message).await {
            if let Err(rollback_error) = self.ledger.rollback(tx).await {
                error!("Rollback for message {} failed: {}", message.id, rollback_error);
            }
            return Err(DeliveryError::Consumer(format!(
                "handler failed for message {}: {:#}",
                message.id, e
            )));
        }
        self.ledger.commit(tx).await?;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerPoolConfig {
    pub topic: String,
    pub group_id: String,
    pub workers: usize,
    pub poll_timeout: Duration,
    /// Pause after a failed record or poll before polling again.
    pub retry_backoff: Duration,
}

impl ConsumerPoolConfig {
    pub fn new(topic: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            group_id: group_id.into(),
            workers: 3,
            poll_timeout: Duration::from_millis(100),
            retry_backoff: Duration::from_millis(300),
        }
    }
}

/// N workers in one consumer group, each with its own subscription.
pub struct ConsumerPool<L: ProcessedLedger, H> {
    subscriber: Arc<dyn MessageSubscriber>,
    consumer: Arc<MessageConsumer<L, H>>,
    config: ConsumerPoolConfig,
}

impl<L, H> ConsumerPool<L, H>
where
    L: ProcessedLedger + 'static,
    H: MessageHandler<L::Tx> + 'static,
{
    pub fn new(
        subscriber: Arc<dyn MessageSubscriber>,
        consumer: Arc<MessageConsumer<L, H>>,
        config: ConsumerPoolConfig,
    ) -> Self {
        Self {
            subscriber,
            consumer,
            config,
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run(shutdown))
    }

    /// Subscribes every worker, then runs them until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let workers = self.config.workers.max(1);
        let mut handles = Vec::with_capacity(workers);

        for worker in 0..workers {
            let subscription = self
                .subscriber
                .subscribe(&self.config.topic, &self.config.group_id)
                .await
                .with_context(|| {
                    format!(
                        "Failed to subscribe worker {} to {}",
                        worker, self.config.topic
                    )
                })?;
            handles.push(tokio::spawn(run_worker(
                worker,
                subscription,
                Arc::clone(&self.consumer),
                shutdown.clone(),
                self.config.clone(),
            )));
        }
        info!(
            "ConsumerPool: {} {} workers consuming {} as {}",
            workers,
            self.consumer.guarantee(),
            self.config.topic,
            self.config.group_id
        );

        for result in join_all(handles).await {
            if let Err(e) = result {
                error!("ConsumerPool: worker terminated abnormally: {}", e);
            }
        }
        info!("ConsumerPool stopped.");
        Ok(())
    }
}

async fn run_worker<L, H>(
    worker: usize,
    mut subscription: Box<dyn Subscription>,
    consumer: Arc<MessageConsumer<L, H>>,
    shutdown: CancellationToken,
    config: ConsumerPoolConfig,
) where
    L: ProcessedLedger + 'static,
    H: MessageHandler<L::Tx> + 'static,
{
    debug!("Worker {} started", worker);
    loop {
        let polled = tokio::select! {
            _ = shutdown.cancelled() => break,
            polled = subscription.poll(config.poll_timeout) => polled,
        };

        let delivery = match polled {
            Ok(Some(delivery)) => delivery,
            Ok(None) => continue,
            Err(e) => {
                error!("Worker {}: poll failed: {}", worker, e);
                pause(&shutdown, config.retry_backoff).await;
                continue;
            }
        };

        match consumer.handle(&delivery).await {
            Ok(outcome) => debug!(
                "Worker {}: {}:{}@{} -> {:?}",
                worker,
                delivery.record.topic,
                delivery.record.partition,
                delivery.record.offset,
                outcome
            ),
            Err(e) => {
                warn!(
                    "Worker {}: {}:{}@{} failed, will be redelivered: {}",
                    worker,
                    delivery.record.topic,
                    delivery.record.partition,
                    delivery.record.offset,
                    e
                );
                if let Err(rewind_error) = subscription.rewind(&delivery.record).await {
                    error!("Worker {}: rewind failed: {}", worker, rewind_error);
                }
                pause(&shutdown, config.retry_backoff).await;
            }
        }
    }
    debug!("Worker {} stopped", worker);
}

async fn pause(shutdown: &CancellationToken, duration: Duration) {
    tokio::select! {
        _ = shutdown.cancelled() => {}
        _ = tokio::time::sleep(duration) => {}
    }
}

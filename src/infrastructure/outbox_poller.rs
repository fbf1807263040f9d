use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use crate::domain::OutboxEntry;
use crate::infrastructure::error::{DeliveryError, PersistenceError};
use crate::infrastructure::kafka_config::TopicConfig;
use crate::infrastructure::kafka_metrics::DeliveryMetrics;
use crate::infrastructure::outbox::OutboxStore;
use crate::infrastructure::transactional_publisher::TransactionalPublisher;

#[derive(Clone, Debug)]
pub struct RelayConfig {
    pub poll_interval: Duration,
    pub batch_size: i64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(15),
            batch_size: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Polling,
    Publishing,
}

const IDLE: u8 = 0;
const POLLING: u8 = 1;
const PUBLISHING: u8 = 2;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayReport {
    pub polled: usize,
    pub relayed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// A previous tick was still running.
    Skipped,
    Completed(RelayReport),
}

/// Returns the relay to `Idle` however the tick ends.
struct TickGuard<'a>(&'a AtomicU8);

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(IDLE, Ordering::SeqCst);
    }
}

/// Moves unprocessed outbox entries to the broker.
///
/// Each entry is published in its own broker transaction and marked processed only
/// after the commit. A crash in between republishes the entry on a later tick, so
/// delivery is at-least-once and consumers deduplicate by message id.
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    publisher: Arc<TransactionalPublisher>,
    topics: TopicConfig,
    config: RelayConfig,
    state: AtomicU8,
    metrics: Arc<DeliveryMetrics>,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        publisher: Arc<TransactionalPublisher>,
        topics: TopicConfig,
        config: RelayConfig,
        metrics: Arc<DeliveryMetrics>,
    ) -> Self {
        Self {
            store,
            publisher,
            topics,
            config,
            state: AtomicU8::new(IDLE),
            metrics,
        }
    }

    pub fn state(&self) -> RelayState {
        match self.state.load(Ordering::SeqCst) {
            POLLING => RelayState::Polling,
            PUBLISHING => RelayState::Publishing,
            _ => RelayState::Idle,
        }
    }

    /// Runs one relay pass unless another one is in progress.
    pub async fn tick(&self) -> Result<TickOutcome, PersistenceError> {
        if self
            .state
            .compare_exchange(IDLE, POLLING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            DeliveryMetrics::incr(&self.metrics.relay_ticks_skipped);
            debug!("OutboxRelay: previous tick still running, skipping");
            return Ok(TickOutcome::Skipped);
        }
        let _guard = TickGuard(&self.state);
        DeliveryMetrics::incr(&self.metrics.relay_ticks);

        let entries = self.store.poll_unprocessed(self.config.batch_size).await?;
        let mut report = RelayReport {
            polled: entries.len(),
            ..Default::default()
        };
        if entries.is_empty() {
            return Ok(TickOutcome::Completed(report));
        }

        self.state.store(PUBLISHING, Ordering::SeqCst);
        info!("OutboxRelay: fetched {} entries for relay", entries.len());

        for entry in &entries {
            let started = Instant::now();
            match self.relay_entry(entry).await {
                Ok(()) => {
                    report.relayed += 1;
                    DeliveryMetrics::incr(&self.metrics.entries_relayed);
                    self.metrics.record_relay_latency(started.elapsed());
                }
                Err(e) => {
                    report.failed += 1;
                    DeliveryMetrics::incr(&self.metrics.relay_failures);
                    error!(
                        "OutboxRelay: entry {} ({} for {}) not relayed, will retry next tick: {}",
                        entry.id, entry.event_type, entry.aggregate_id, e
                    );
                }
            }
        }

        Ok(TickOutcome::Completed(report))
    }

    async fn relay_entry(&self, entry: &OutboxEntry) -> Result<(), DeliveryError> {
        let message = entry.snapshot().map_err(|e| {
            DeliveryError::PermanentPublishFailure(format!("undecodable payload: {}", e))
        })?;
        let topic = self.topics.topic_for_event(&entry.event_type);

        let mut tx = self.publisher.begin().await?;
        if let Err(e) = tx.publish(topic, &message.id, entry.payload.as_bytes()).await {
            if let Err(abort_error) = tx.abort().await {
                warn!("OutboxRelay: abort for entry {} failed: {}", entry.id, abort_error);
            }
            return Err(e);
        }
        tx.commit().await?;

        if let Err(e) = self.store.mark_processed(entry.id).await {
            error!(
                "OutboxRelay: entry {} published to {} but not marked processed; it will be published again",
                entry.id, topic
            );
            return Err(e.into());
        }
        debug!("OutboxRelay: entry {} relayed to {}", entry.id, topic);
        Ok(())
    }

    /// Ticks every `poll_interval` until `shutdown` fires. Ticks run on their own
    /// tasks, so a slow tick never holds up the timer. Returns once the tick in
    /// flight at shutdown has finished.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!("OutboxRelay started with config: {:?}", self.config);
        let ticks = TaskTracker::new();

        let mut interval = tokio::time::interval(self.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("OutboxRelay received shutdown signal. Exiting.");
                    break;
                }
                _ = interval.tick() => {
                    let relay = Arc::clone(&self);
                    ticks.spawn(async move {
                        match relay.tick().await {
                            Ok(TickOutcome::Completed(report)) if report.polled > 0 => {
                                info!(
                                    "OutboxRelay: tick relayed {}/{} entries ({} failed)",
                                    report.relayed, report.polled, report.failed
                                );
                            }
                            Ok(_) => {}
                            Err(e) => error!("OutboxRelay: error polling outbox: {}", e),
                        }
                    });
                }
            }
        }

        ticks.close();
        if !ticks.is_empty() {
            info!("OutboxRelay: waiting for the running tick to finish");
        }
        ticks.wait().await;
        info!("OutboxRelay stopped.");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DomainChange, EventType, Message};
    use crate::infrastructure::memory_broker::InMemoryBroker;
    use crate::infrastructure::memory_store::MemoryDatastore;
    use crate::infrastructure::transactional_publisher::DEFAULT_SEND_TIMEOUT;
    use async_trait::async_trait;
    use tokio::sync::Notify;

    /// Holds `poll_unprocessed` until released.
    struct GatedStore {
        inner: MemoryDatastore,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl OutboxStore for GatedStore {
        async fn append(
            &self,
            change: DomainChange,
            event_type: EventType,
        ) -> Result<OutboxEntry, PersistenceError> {
            self.inner.append(change, event_type).await
        }

        async fn poll_unprocessed(&self, limit: i64) -> Result<Vec<OutboxEntry>, PersistenceError> {
            self.entered.notify_one();
            self.release.notified().await;
            self.inner.poll_unprocessed(limit).await
        }

        async fn mark_processed(&self, entry_id: i64) -> Result<(), PersistenceError> {
            self.inner.mark_processed(entry_id).await
        }
    }

    async fn gated_relay(
        config: RelayConfig,
    ) -> (Arc<GatedStore>, InMemoryBroker, Arc<OutboxRelay>) {
        let store = Arc::new(GatedStore {
            inner: MemoryDatastore::new(),
            entered: Notify::new(),
            release: Notify::new(),
        });
        store
            .append(
                DomainChange::Create(Message::new("hello").unwrap()),
                EventType::MessageCreated,
            )
            .await
            .unwrap();

        let broker = InMemoryBroker::new();
        let publisher = Arc::new(TransactionalPublisher::new(
            Arc::new(broker.transactional_producer("relay")),
            DEFAULT_SEND_TIMEOUT,
        ));
        let relay = Arc::new(OutboxRelay::new(
            store.clone(),
            publisher,
            TopicConfig::default(),
            config,
            Arc::new(DeliveryMetrics::default()),
        ));
        (store, broker, relay)
    }

    #[tokio::test]
    async fn overlapping_tick_is_skipped() {
        let (store, broker, relay) = gated_relay(RelayConfig::default()).await;

        let running = {
            let relay = Arc::clone(&relay);
            tokio::spawn(async move { relay.tick().await })
        };
        store.entered.notified().await;
        assert_eq!(relay.state(), RelayState::Polling);
        assert_eq!(relay.tick().await.unwrap(), TickOutcome::Skipped);

        store.release.notify_one();
        let outcome = running.await.unwrap().unwrap();
        assert_eq!(
            outcome,
            TickOutcome::Completed(RelayReport {
                polled: 1,
                relayed: 1,
                failed: 0
            })
        );
        assert_eq!(relay.state(), RelayState::Idle);
        assert_eq!(broker.committed_records("message-created-topic").len(), 1);
    }

    #[tokio::test]
    async fn shutdown_waits_for_the_running_tick() {
        let (store, broker, relay) = gated_relay(RelayConfig {
            poll_interval: Duration::from_millis(10),
            batch_size: 10,
        })
        .await;
        let shutdown = CancellationToken::new();
        let mut running = tokio::spawn(Arc::clone(&relay).run(shutdown.clone()));

        store.entered.notified().await;
        shutdown.cancel();
        assert!(
            tokio::time::timeout(Duration::from_millis(50), &mut running)
                .await
                .is_err(),
            "run returned while a tick was still publishing"
        );

        store.release.notify_one();
        tokio::time::timeout(Duration::from_secs(1), running)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(relay.state(), RelayState::Idle);
        assert_eq!(broker.committed_records("message-created-topic").len(), 1);
        assert!(store.inner.outbox_entries().await.iter().all(|e| e.processed));
    }
}

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use delivery_semantics::domain::Message;
use delivery_semantics::infrastructure::dedup_consumer::ConsumeOutcome;
use delivery_semantics::infrastructure::kafka_abstraction::{
    MessagePublisher, MessageSubscriber, TransactionalProducer,
};
use delivery_semantics::infrastructure::kafka_dlq::InMemoryDeadLetterStore;
use delivery_semantics::infrastructure::memory_store::MemoryTransaction;
use delivery_semantics::infrastructure::{
    ConsumerPool, ConsumerPoolConfig, ConsumerSettings, DedupCache, DeliveryError,
    DeliveryMetrics, DeliveryMode, InMemoryBroker, IsolationLevel, MemoryDatastore,
    MessageConsumer, MessageHandler, TransactionalPublisher,
};

const TOPIC: &str = "orders";
const GROUP: &str = "billing";

/// Records one effect per message; fails the first `failures` calls.
struct FlakyHandler {
    failures: AtomicUsize,
    calls: AtomicUsize,
}

impl FlakyHandler {
    fn reliable() -> Self {
        Self::failing(0)
    }

    fn failing(failures: usize) -> Self {
        Self {
            failures: AtomicUsize::new(failures),
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessageHandler<MemoryTransaction> for FlakyHandler {
    async fn apply(&self, tx: &mut MemoryTransaction, message: &Message) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("handler crashed on {}", message.id);
        }
        tx.record_effect(message.id.clone());
        Ok(())
    }
}

fn consumer(
    mode: &DeliveryMode,
    store: &MemoryDatastore,
    handler: Arc<FlakyHandler>,
) -> MessageConsumer<MemoryDatastore, FlakyHandler> {
    MessageConsumer::new(
        mode,
        Arc::new(store.clone()),
        handler,
        Arc::new(DedupCache::new(1000, Duration::from_secs(60))),
        Arc::new(InMemoryDeadLetterStore::new()),
        Arc::new(DeliveryMetrics::default()),
    )
}

async fn publish(broker: &InMemoryBroker, content: &str) -> Message {
    let message = Message::new(content).unwrap();
    broker
        .publish(TOPIC, &message.id, &message.to_payload().unwrap())
        .await
        .unwrap();
    message
}

#[tokio::test]
async fn exactly_once_failed_commit_is_redelivered_and_applied_once() {
    let mode = DeliveryMode::exactly_once();
    let broker = InMemoryBroker::with_partitions(1);
    let store = MemoryDatastore::new();
    let handler = Arc::new(FlakyHandler::reliable());
    let consumer = consumer(&mode, &store, Arc::clone(&handler));
    let message = publish(&broker, "charge").await;

    let mut subscription = broker
        .subscriber(ConsumerSettings::for_mode(&mode))
        .subscribe(TOPIC, GROUP)
        .await
        .unwrap();

    store.fail_next_commits(1);
    let delivery = subscription.poll(Duration::from_millis(20)).await.unwrap().unwrap();
    assert!(consumer.handle(&delivery).await.is_err());
    assert_eq!(store.processed_count(&message.id).await, 0);
    assert_eq!(broker.committed_offset(GROUP, TOPIC, 0), Some(0));

    subscription.rewind(&delivery.record).await.unwrap();
    let redelivered = subscription.poll(Duration::from_millis(20)).await.unwrap().unwrap();
    assert_eq!(redelivered.record.offset, delivery.record.offset);
    assert_eq!(
        consumer.handle(&redelivered).await.unwrap(),
        ConsumeOutcome::Applied
    );

    assert_eq!(handler.calls(), 2);
    assert_eq!(store.effect_count(&message.id).await, 1);
    assert_eq!(store.processed_count(&message.id).await, 1);
    assert_eq!(broker.committed_offset(GROUP, TOPIC, 0), Some(1));
}

#[tokio::test]
async fn exactly_once_restart_with_empty_cache_consults_the_ledger() {
    let mode = DeliveryMode::exactly_once();
    let broker = InMemoryBroker::with_partitions(1);
    let store = MemoryDatastore::new();
    let message = publish(&broker, "ship").await;
    let settings = ConsumerSettings::for_mode(&mode);

    let first = consumer(&mode, &store, Arc::new(FlakyHandler::reliable()));
    let mut subscription = broker.subscriber(settings).subscribe(TOPIC, "first").await.unwrap();
    let delivery = subscription.poll(Duration::from_millis(20)).await.unwrap().unwrap();
    assert_eq!(first.handle(&delivery).await.unwrap(), ConsumeOutcome::Applied);

    let restarted_handler = Arc::new(FlakyHandler::reliable());
    let restarted = consumer(&mode, &store, Arc::clone(&restarted_handler));
    let mut replay = broker.subscriber(settings).subscribe(TOPIC, "replay").await.unwrap();
    let delivery = replay.poll(Duration::from_millis(20)).await.unwrap().unwrap();

    assert_eq!(
        restarted.handle(&delivery).await.unwrap(),
        ConsumeOutcome::Duplicate
    );
    assert_eq!(restarted_handler.calls(), 0);
    assert_eq!(store.effect_count(&message.id).await, 1);
}

#[tokio::test]
async fn at_most_once_failure_is_never_redelivered() {
    let mode = DeliveryMode::at_most_once();
    let broker = InMemoryBroker::with_partitions(1);
    let store = MemoryDatastore::new();
    let consumer = consumer(&mode, &store, Arc::new(FlakyHandler::failing(1)));
    let message = publish(&broker, "best effort").await;
    let subscriber = broker.subscriber(ConsumerSettings::for_mode(&mode));

    let mut subscription = subscriber.subscribe(TOPIC, GROUP).await.unwrap();
    let delivery = subscription.poll(Duration::from_millis(20)).await.unwrap().unwrap();
    assert_eq!(
        consumer.handle(&delivery).await.unwrap(),
        ConsumeOutcome::Dropped
    );
    drop(subscription);

    let mut restarted = subscriber.subscribe(TOPIC, GROUP).await.unwrap();
    assert!(restarted.poll(Duration::from_millis(20)).await.unwrap().is_none());
    assert_eq!(store.effect_count(&message.id).await, 0);
    assert_eq!(broker.committed_offset(GROUP, TOPIC, 0), Some(1));
}

#[tokio::test]
async fn at_least_once_failure_is_redelivered_after_restart() {
    let mode = DeliveryMode::at_least_once();
    let broker = InMemoryBroker::with_partitions(1);
    let store = MemoryDatastore::new();
    let consumer = consumer(&mode, &store, Arc::new(FlakyHandler::failing(1)));
    let message = publish(&broker, "retry me").await;
    let subscriber = broker.subscriber(ConsumerSettings::for_mode(&mode));

    let mut subscription = subscriber.subscribe(TOPIC, GROUP).await.unwrap();
    let delivery = subscription.poll(Duration::from_millis(20)).await.unwrap().unwrap();
    assert!(matches!(
        consumer.handle(&delivery).await,
        Err(DeliveryError::Consumer(_))
    ));
    drop(delivery);
    drop(subscription);

    let mut restarted = subscriber.subscribe(TOPIC, GROUP).await.unwrap();
    let delivery = restarted.poll(Duration::from_millis(20)).await.unwrap().unwrap();
    assert_eq!(
        consumer.handle(&delivery).await.unwrap(),
        ConsumeOutcome::Applied
    );
    assert_eq!(store.effect_count(&message.id).await, 1);
    assert_eq!(broker.committed_offset(GROUP, TOPIC, 0), Some(1));
}

#[tokio::test]
async fn at_least_once_lost_acknowledgment_applies_twice() {
    let mode = DeliveryMode::at_least_once();
    let broker = InMemoryBroker::with_partitions(1);
    let store = MemoryDatastore::new();
    let consumer = consumer(&mode, &store, Arc::new(FlakyHandler::reliable()));
    let message = publish(&broker, "twice").await;
    let subscriber = broker.subscriber(ConsumerSettings::for_mode(&mode));

    broker.fail_next_acks(1);
    let mut subscription = subscriber.subscribe(TOPIC, GROUP).await.unwrap();
    let delivery = subscription.poll(Duration::from_millis(20)).await.unwrap().unwrap();
    assert_eq!(
        consumer.handle(&delivery).await.unwrap(),
        ConsumeOutcome::Applied
    );
    drop(delivery);
    drop(subscription);

    let mut restarted = subscriber.subscribe(TOPIC, GROUP).await.unwrap();
    let delivery = restarted.poll(Duration::from_millis(20)).await.unwrap().unwrap();
    consumer.handle(&delivery).await.unwrap();

    assert_eq!(store.effect_count(&message.id).await, 2);
}

#[tokio::test]
async fn exactly_once_lost_acknowledgment_is_skipped_on_redelivery() {
    let mode = DeliveryMode::exactly_once();
    let broker = InMemoryBroker::with_partitions(1);
    let store = MemoryDatastore::new();
    let handler = Arc::new(FlakyHandler::reliable());
    let message = publish(&broker, "charge once").await;
    let subscriber = broker.subscriber(ConsumerSettings::for_mode(&mode));

    broker.fail_next_acks(1);
    let mut subscription = subscriber.subscribe(TOPIC, GROUP).await.unwrap();
    let delivery = subscription.poll(Duration::from_millis(20)).await.unwrap().unwrap();
    assert_eq!(
        consumer(&mode, &store, Arc::clone(&handler))
            .handle(&delivery)
            .await
            .unwrap(),
        ConsumeOutcome::Applied
    );
    assert_eq!(broker.committed_offset(GROUP, TOPIC, 0), Some(0));
    drop(delivery);
    drop(subscription);

    // A new instance starts with an empty cache, so the ledger catches it.
    let restarted = consumer(&mode, &store, Arc::clone(&handler));
    let mut resubscribed = subscriber.subscribe(TOPIC, GROUP).await.unwrap();
    let delivery = resubscribed.poll(Duration::from_millis(20)).await.unwrap().unwrap();
    assert_eq!(delivery.record.offset, 0);
    assert_eq!(
        restarted.handle(&delivery).await.unwrap(),
        ConsumeOutcome::Duplicate
    );

    assert_eq!(handler.calls(), 1);
    assert_eq!(store.effect_count(&message.id).await, 1);
    assert_eq!(store.processed_count(&message.id).await, 1);
    assert_eq!(broker.committed_offset(GROUP, TOPIC, 0), Some(1));
}

#[tokio::test]
async fn read_committed_consumers_never_see_aborted_records() {
    let broker = InMemoryBroker::with_partitions(1);
    let publisher = TransactionalPublisher::new(
        Arc::new(broker.transactional_producer("tx-1")),
        Duration::from_secs(1),
    );

    let mut aborted = publisher.begin().await.unwrap();
    aborted.publish(TOPIC, "a", b"aborted").await.unwrap();
    aborted.abort().await.unwrap();

    let mut committed = publisher.begin().await.unwrap();
    committed.publish(TOPIC, "b", b"committed").await.unwrap();
    committed.commit().await.unwrap();

    let mut subscription = broker
        .subscriber(ConsumerSettings::for_mode(&DeliveryMode::exactly_once()))
        .subscribe(TOPIC, GROUP)
        .await
        .unwrap();
    let delivery = subscription.poll(Duration::from_millis(20)).await.unwrap().unwrap();
    assert_eq!(delivery.record.payload, b"committed");
    assert!(subscription.poll(Duration::from_millis(20)).await.unwrap().is_none());

    let mut dirty = broker
        .subscriber(ConsumerSettings {
            isolation: IsolationLevel::ReadUncommitted,
            auto_commit: true,
        })
        .subscribe(TOPIC, "dirty")
        .await
        .unwrap();
    let first = dirty.poll(Duration::from_millis(20)).await.unwrap().unwrap();
    assert_eq!(first.record.payload, b"aborted");
}

#[tokio::test]
async fn zombie_producer_is_fenced_and_its_records_stay_invisible() {
    let broker = InMemoryBroker::with_partitions(1);
    let zombie = TransactionalPublisher::new(
        Arc::new(broker.transactional_producer("relay-tx")),
        Duration::from_secs(1),
    );

    let mut tx = zombie.begin().await.unwrap();
    tx.publish(TOPIC, "late", b"from zombie").await.unwrap();

    let successor = broker.transactional_producer("relay-tx");
    assert!(matches!(
        tx.commit().await,
        Err(DeliveryError::ProducerFenced(_))
    ));

    successor.begin_transaction().await.unwrap();
    successor.send(TOPIC, "fresh", b"from successor").await.unwrap();
    successor.commit_transaction().await.unwrap();

    let mut subscription = broker
        .subscriber(ConsumerSettings::for_mode(&DeliveryMode::exactly_once()))
        .subscribe(TOPIC, GROUP)
        .await
        .unwrap();
    let delivery = subscription.poll(Duration::from_millis(20)).await.unwrap().unwrap();
    assert_eq!(delivery.record.payload, b"from successor");
    assert!(subscription.poll(Duration::from_millis(20)).await.unwrap().is_none());
}

async fn wait_until<F, Fut>(mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn consumer_pool_applies_every_message_once_across_partitions() {
    let mode = DeliveryMode::exactly_once();
    let broker = InMemoryBroker::with_partitions(3);
    let store = MemoryDatastore::new();
    let consumer = Arc::new(consumer(&mode, &store, Arc::new(FlakyHandler::reliable())));

    let mut messages = Vec::new();
    for i in 0..9 {
        let message = publish(&broker, &format!("message {}", i)).await;
        broker
            .publish(TOPIC, &message.id, &message.to_payload().unwrap())
            .await
            .unwrap();
        messages.push(message);
    }

    let mut config = ConsumerPoolConfig::new(TOPIC, GROUP);
    config.poll_timeout = Duration::from_millis(10);
    config.retry_backoff = Duration::from_millis(10);
    let token = CancellationToken::new();
    let pool = ConsumerPool::new(
        Arc::new(broker.subscriber(ConsumerSettings::for_mode(&mode))),
        consumer,
        config,
    )
    .spawn(token.clone());

    let all_applied = wait_until(|| {
        let store = store.clone();
        async move { store.processed_total().await == 9 }
    })
    .await;
    let drained = wait_until(|| {
        let broker = broker.clone();
        async move {
            (0..3)
                .map(|p| broker.committed_offset(GROUP, TOPIC, p).unwrap_or(0))
                .sum::<i64>()
                == 18
        }
    })
    .await;

    token.cancel();
    pool.await.unwrap().unwrap();
    assert!(all_applied);
    assert!(drained);
    for message in &messages {
        assert_eq!(store.effect_count(&message.id).await, 1);
    }
}

#[tokio::test]
async fn consumer_pool_retries_failed_records() {
    let mode = DeliveryMode::at_least_once();
    let broker = InMemoryBroker::with_partitions(1);
    let store = MemoryDatastore::new();
    let handler = Arc::new(FlakyHandler::failing(2));
    let consumer = Arc::new(consumer(&mode, &store, Arc::clone(&handler)));
    let message = publish(&broker, "eventually").await;

    let mut config = ConsumerPoolConfig::new(TOPIC, GROUP);
    config.workers = 1;
    config.poll_timeout = Duration::from_millis(10);
    config.retry_backoff = Duration::from_millis(10);
    let token = CancellationToken::new();
    let pool = ConsumerPool::new(
        Arc::new(broker.subscriber(ConsumerSettings::for_mode(&mode))),
        consumer,
        config,
    )
    .spawn(token.clone());

    let applied = wait_until(|| {
        let store = store.clone();
        let id = message.id.clone();
        async move { store.effect_count(&id).await == 1 }
    })
    .await;

    token.cancel();
    pool.await.unwrap().unwrap();
    assert!(applied);
    assert_eq!(handler.calls(), 3);
    assert_eq!(broker.committed_offset(GROUP, TOPIC, 0), Some(1));
}

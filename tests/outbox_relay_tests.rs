use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;

use delivery_semantics::application::{MessageService, ServiceError};
use delivery_semantics::domain::{Message, MessageError};
use delivery_semantics::infrastructure::dedup_consumer::{ConsumeOutcome, DeduplicatingConsumer};
use delivery_semantics::infrastructure::kafka_abstraction::MessageSubscriber;
use delivery_semantics::infrastructure::kafka_dlq::InMemoryDeadLetterStore;
use delivery_semantics::infrastructure::memory_store::MemoryTransaction;
use delivery_semantics::infrastructure::outbox_poller::{RelayReport, TickOutcome};
use delivery_semantics::infrastructure::{
    ConsumerSettings, DedupCache, DeliveryMetrics, DeliveryMode, InMemoryBroker, MemoryDatastore,
    MessageHandler, OutboxRelay, RelayConfig, TopicConfig, TransactionalPublisher,
};

struct CountingHandler;

#[async_trait::async_trait]
impl MessageHandler<MemoryTransaction> for CountingHandler {
    async fn apply(&self, tx: &mut MemoryTransaction, message: &Message) -> anyhow::Result<()> {
        tx.record_effect(message.id.clone());
        Ok(())
    }
}

fn relay(store: &MemoryDatastore, broker: &InMemoryBroker) -> OutboxRelay {
    relay_with_config(store, broker, RelayConfig::default())
}

fn relay_with_config(
    store: &MemoryDatastore,
    broker: &InMemoryBroker,
    config: RelayConfig,
) -> OutboxRelay {
    let publisher = TransactionalPublisher::new(
        Arc::new(broker.transactional_producer("relay-tx")),
        Duration::from_secs(1),
    );
    OutboxRelay::new(
        Arc::new(store.clone()),
        Arc::new(publisher),
        TopicConfig::default(),
        config,
        Arc::new(DeliveryMetrics::default()),
    )
}

fn service(store: &MemoryDatastore) -> MessageService {
    MessageService::new(Arc::new(store.clone()), Arc::new(store.clone()))
}

fn completed(outcome: TickOutcome) -> RelayReport {
    match outcome {
        TickOutcome::Completed(report) => report,
        TickOutcome::Skipped => panic!("tick was skipped"),
    }
}

fn keys(broker: &InMemoryBroker, topic: &str) -> Vec<String> {
    broker
        .committed_records(topic)
        .into_iter()
        .filter_map(|record| record.key)
        .collect()
}

#[tokio::test]
async fn entries_are_relayed_in_creation_order() {
    let store = MemoryDatastore::new();
    let broker = InMemoryBroker::with_partitions(1);
    let base = Utc::now();

    let first = Message::new("first").unwrap();
    let second = Message::new("second").unwrap();
    let third = Message::new("third").unwrap();
    store
        .seed_outbox(&third, "MESSAGE_CREATED", base + ChronoDuration::seconds(3))
        .await
        .unwrap();
    store
        .seed_outbox(&first, "MESSAGE_CREATED", base + ChronoDuration::seconds(1))
        .await
        .unwrap();
    store
        .seed_outbox(&second, "MESSAGE_CREATED", base + ChronoDuration::seconds(2))
        .await
        .unwrap();

    let report = completed(relay(&store, &broker).tick().await.unwrap());

    assert_eq!(report.relayed, 3);
    assert_eq!(
        keys(&broker, "message-created-topic"),
        vec![first.id, second.id, third.id]
    );
    assert!(store.outbox_entries().await.iter().all(|e| e.processed));
}

#[tokio::test]
async fn failed_outbox_write_rolls_back_the_domain_write() {
    let store = MemoryDatastore::new();
    store.fail_outbox_writes(true);

    let result = service(&store).create_message("never stored").await;

    assert!(matches!(result, Err(ServiceError::Persistence(_))));
    assert_eq!(store.message_count().await, 0);
    assert!(store.outbox_entries().await.is_empty());
}

#[tokio::test]
async fn crash_before_mark_processed_republishes_and_consumer_applies_once() {
    let store = MemoryDatastore::new();
    let broker = InMemoryBroker::with_partitions(1);
    let relay = relay(&store, &broker);
    let message = service(&store).create_message("hello").await.unwrap();

    store.fail_next_mark_processed();
    let first = completed(relay.tick().await.unwrap());
    assert_eq!(first.failed, 1);
    assert!(!store.outbox_entries().await[0].processed);

    let second = completed(relay.tick().await.unwrap());
    assert_eq!(second.relayed, 1);
    assert!(store.outbox_entries().await[0].processed);
    assert_eq!(
        keys(&broker, "message-created-topic"),
        vec![message.id.clone(), message.id.clone()]
    );

    let downstream = MemoryDatastore::new();
    let consumer = DeduplicatingConsumer::new(
        Arc::new(downstream.clone()),
        Arc::new(CountingHandler),
        Arc::new(DedupCache::new(100, Duration::from_secs(60))),
        Arc::new(InMemoryDeadLetterStore::new()),
        Arc::new(DeliveryMetrics::default()),
    );
    let mut subscription = broker
        .subscriber(ConsumerSettings::for_mode(&DeliveryMode::exactly_once()))
        .subscribe("message-created-topic", "projection")
        .await
        .unwrap();

    let mut outcomes = Vec::new();
    while let Some(delivery) = subscription.poll(Duration::from_millis(20)).await.unwrap() {
        outcomes.push(consumer.handle(&delivery).await.unwrap());
    }

    assert_eq!(outcomes, vec![ConsumeOutcome::Applied, ConsumeOutcome::Duplicate]);
    assert_eq!(downstream.effect_count(&message.id).await, 1);
    assert_eq!(downstream.processed_count(&message.id).await, 1);
}

#[tokio::test]
async fn failing_entry_does_not_block_later_entries() {
    let store = MemoryDatastore::new();
    let broker = InMemoryBroker::with_partitions(1);
    let relay = relay(&store, &broker);
    let service = service(&store);
    let poisoned = service.create_message("one").await.unwrap();
    let second = service.create_message("two").await.unwrap();
    let third = service.create_message("three").await.unwrap();

    broker.fail_next_publishes(1);
    let report = completed(relay.tick().await.unwrap());
    assert_eq!(
        report,
        RelayReport {
            polled: 3,
            relayed: 2,
            failed: 1
        }
    );
    assert_eq!(
        keys(&broker, "message-created-topic"),
        vec![second.id.clone(), third.id.clone()]
    );

    let retry = completed(relay.tick().await.unwrap());
    assert_eq!(retry.relayed, 1);
    assert_eq!(
        keys(&broker, "message-created-topic"),
        vec![second.id, third.id, poisoned.id]
    );
    assert!(store.outbox_entries().await.iter().all(|e| e.processed));
}

#[tokio::test]
async fn every_change_is_routed_to_its_event_topic() {
    let store = MemoryDatastore::new();
    let broker = InMemoryBroker::with_partitions(1);
    let service = service(&store);

    let created = service.create_message("draft").await.unwrap();
    let updated = service.update_message(&created.id, "final").await.unwrap();
    let deleted = service.delete_message(&created.id).await.unwrap();
    assert_eq!(updated.content, "final");
    assert_eq!(deleted.content, "final");
    assert!(store.message(&created.id).await.is_none());

    let report = completed(relay(&store, &broker).tick().await.unwrap());
    assert_eq!(report.relayed, 3);

    for topic in [
        "message-created-topic",
        "message-updated-topic",
        "message-deleted-topic",
    ] {
        let records = broker.committed_records(topic);
        assert_eq!(records.len(), 1, "{}", topic);
        assert_eq!(records[0].key.as_deref(), Some(created.id.as_str()));
    }
    let deleted_payload = Message::from_payload(
        &broker.committed_records("message-deleted-topic")[0].payload,
    )
    .unwrap();
    assert_eq!(deleted_payload, deleted);
}

#[tokio::test]
async fn changes_to_unknown_messages_are_rejected_without_outbox_entries() {
    let store = MemoryDatastore::new();
    let service = service(&store);

    let update = service.update_message("missing", "content").await;
    let delete = service.delete_message("missing").await;

    assert!(matches!(
        update,
        Err(ServiceError::Message(MessageError::NotFound(_)))
    ));
    assert!(matches!(
        delete,
        Err(ServiceError::Message(MessageError::NotFound(_)))
    ));
    assert!(store.outbox_entries().await.is_empty());
}

#[tokio::test]
async fn empty_outbox_tick_publishes_nothing() {
    let store = MemoryDatastore::new();
    let broker = InMemoryBroker::with_partitions(1);

    let report = completed(relay(&store, &broker).tick().await.unwrap());

    assert_eq!(report, RelayReport::default());
    assert_eq!(broker.publish_attempts(), 0);
}

#[tokio::test]
async fn running_relay_drains_the_outbox_until_shutdown() {
    let store = MemoryDatastore::new();
    let broker = InMemoryBroker::with_partitions(1);
    let relay = Arc::new(relay_with_config(
        &store,
        &broker,
        RelayConfig {
            poll_interval: Duration::from_millis(20),
            batch_size: 10,
        },
    ));
    let token = tokio_util::sync::CancellationToken::new();
    let handle = tokio::spawn(Arc::clone(&relay).run(token.clone()));

    let message = service(&store).create_message("scheduled").await.unwrap();

    let mut drained = false;
    for _ in 0..100 {
        if store.outbox_entries().await.iter().all(|e| e.processed) {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    token.cancel();
    handle.await.unwrap();
    assert!(drained);
    assert_eq!(keys(&broker, "message-created-topic"), vec![message.id]);
}

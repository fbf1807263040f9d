use async_trait::async_trait;
use rdkafka::{
    client::ClientContext,
    config::ClientConfig,
    consumer::{CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer},
    error::KafkaResult,
    producer::{FutureProducer, FutureRecord, Producer},
    util::Timeout,
    Message, Offset, TopicPartitionList,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::infrastructure::delivery_mode::{AckMode, DeliveryMode};
use crate::infrastructure::error::DeliveryError;
use crate::infrastructure::kafka_config::KafkaConfig;

/// Where the broker stored a published record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryPosition {
    pub partition: i32,
    pub offset: i64,
}

/// A record headed for the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundRecord {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
}

impl OutboundRecord {
    pub fn new(topic: impl Into<String>, key: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            topic: topic.into(),
            key: key.into(),
            payload,
        }
    }
}

/// A record handed to a consumer.
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumedRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Vec<u8>,
}

/// A consumed record together with the handle that acknowledges it.
pub struct Delivery {
    pub record: ConsumedRecord,
    pub ack: Box<dyn AckHandle>,
}

impl Delivery {
    pub async fn acknowledge(&self) -> Result<(), DeliveryError> {
        self.ack.acknowledge().await
    }
}

impl std::fmt::Debug for Delivery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delivery")
            .field("record", &self.record)
            .finish_non_exhaustive()
    }
}

/// Non-transactional publish.
#[async_trait]
pub trait MessagePublisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<DeliveryPosition, DeliveryError>;
}

/// Broker-native transaction primitives. One transaction at a time per instance.
#[async_trait]
pub trait TransactionalProducer: Send + Sync {
    async fn begin_transaction(&self) -> Result<(), DeliveryError>;

    async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<DeliveryPosition, DeliveryError>;

    async fn commit_transaction(&self) -> Result<(), DeliveryError>;

    async fn abort_transaction(&self) -> Result<(), DeliveryError>;
}

#[async_trait]
pub trait MessageSubscriber: Send + Sync {
    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
    ) -> Result<Box<dyn Subscription>, DeliveryError>;
}

#[async_trait]
pub trait Subscription: Send {
    /// Waits up to `timeout` for the next record; `None` when nothing arrived.
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Delivery>, DeliveryError>;

    /// Moves the read position of the record's partition back so it is delivered again.
    async fn rewind(&mut self, record: &ConsumedRecord) -> Result<(), DeliveryError>;
}

#[async_trait]
pub trait AckHandle: Send + Sync {
    async fn acknowledge(&self) -> Result<(), DeliveryError>;
}

fn producer_client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", &config.bootstrap_servers)
        .set("client.id", &config.client_id)
        .set("security.protocol", &config.security_protocol)
        .set("request.timeout.ms", config.request_timeout_ms.to_string());
    client
}

#[derive(Clone)]
pub struct KafkaProducer {
    producer: FutureProducer,
    queue_timeout: Duration,
}

impl KafkaProducer {
    /// Producer tuned for `mode` (acks, retries, idempotence).
    pub fn new(config: &KafkaConfig, mode: &DeliveryMode) -> Result<Self, DeliveryError> {
        let mut client = producer_client_config(config);
        for (key, value) in mode.producer_properties() {
            client.set(key, value);
        }

        info!(
            "KafkaProducer: creating {} producer for {}",
            mode.guarantee, config.bootstrap_servers
        );
        let producer: FutureProducer = client.create()?;

        Ok(Self {
            producer,
            queue_timeout: Duration::from_secs(5),
        })
    }
}

#[async_trait]
impl MessagePublisher for KafkaProducer {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<DeliveryPosition, DeliveryError> {
        self.producer
            .send(
                FutureRecord::to(topic).key(key).payload(payload),
                Timeout::After(self.queue_timeout),
            )
            .await
            .map(|(partition, offset)| DeliveryPosition { partition, offset })
            .map_err(|(e, _)| DeliveryError::from(e))
    }
}

/// Transactional producer: idempotent, `acks=all`, one in-flight request,
/// unlimited retries and a stable `transactional.id`.
pub struct KafkaTransactionalProducer {
    producer: FutureProducer,
    transactional_id: String,
    call_timeout: Duration,
}

impl KafkaTransactionalProducer {
    /// Creates the producer and registers its transactional id with the broker,
    /// which fences any older producer using the same id.
    pub async fn new(config: &KafkaConfig) -> Result<Self, DeliveryError> {
        let transactional_id = config.transactional_id();
        let mut client = producer_client_config(config);
        client
            .set("transactional.id", &transactional_id)
            .set("enable.idempotence", "true")
            .set("acks", "all")
            .set("retries", i32::MAX.to_string())
            .set("max.in.flight.requests.per.connection", "1")
            .set(
                "transaction.timeout.ms",
                config.transaction_timeout_ms.to_string(),
            );

        let producer: FutureProducer = client.create()?;
        let this = Self {
            producer,
            transactional_id,
            call_timeout: config.transaction_call_timeout(),
        };

        let timeout = this.call_timeout;
        this.run_blocking(move |producer| producer.init_transactions(timeout))
            .await?;
        info!(
            "KafkaTransactionalProducer: initialized transactional id {}",
            this.transactional_id
        );
        Ok(this)
    }

    pub fn transactional_id(&self) -> &str {
        &self.transactional_id
    }

    // init/commit/abort block the calling thread until the broker answers.
    async fn run_blocking<F>(&self, call: F) -> Result<(), DeliveryError>
    where
        F: FnOnce(FutureProducer) -> KafkaResult<()> + Send + 'static,
    {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || call(producer))
            .await
            .map_err(|e| {
                DeliveryError::TransactionAborted(format!("transaction call did not finish: {}", e))
            })??;
        Ok(())
    }
}

#[async_trait]
impl TransactionalProducer for KafkaTransactionalProducer {
    async fn begin_transaction(&self) -> Result<(), DeliveryError> {
        self.producer.begin_transaction()?;
        Ok(())
    }

    async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<DeliveryPosition, DeliveryError> {
        self.producer
            .send(
                FutureRecord::to(topic).key(key).payload(payload),
                Timeout::After(self.call_timeout),
            )
            .await
            .map(|(partition, offset)| DeliveryPosition { partition, offset })
            .map_err(|(e, _)| DeliveryError::from(e))
    }

    async fn commit_transaction(&self) -> Result<(), DeliveryError> {
        let timeout = self.call_timeout;
        self.run_blocking(move |producer| producer.commit_transaction(timeout))
            .await
    }

    async fn abort_transaction(&self) -> Result<(), DeliveryError> {
        let timeout = self.call_timeout;
        self.run_blocking(move |producer| producer.abort_transaction(timeout))
            .await
    }
}

struct LoggingConsumerContext;

impl ClientContext for LoggingConsumerContext {}

impl ConsumerContext for LoggingConsumerContext {
    fn pre_rebalance(
        &self,
        _consumer: &rdkafka::consumer::BaseConsumer<Self>,
        rebalance: &Rebalance,
    ) {
        info!("Pre-rebalance: {:?}", rebalance);
    }

    fn post_rebalance(
        &self,
        _consumer: &rdkafka::consumer::BaseConsumer<Self>,
        rebalance: &Rebalance,
    ) {
        info!("Post-rebalance: {:?}", rebalance);
    }
}

type LoggingConsumer = StreamConsumer<LoggingConsumerContext>;

/// Creates one group member per `subscribe` call, configured by the delivery mode.
#[derive(Clone)]
pub struct KafkaSubscriber {
    config: KafkaConfig,
    mode: DeliveryMode,
}

impl KafkaSubscriber {
    pub fn new(config: KafkaConfig, mode: DeliveryMode) -> Self {
        Self { config, mode }
    }
}

#[async_trait]
impl MessageSubscriber for KafkaSubscriber {
    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
    ) -> Result<Box<dyn Subscription>, DeliveryError> {
        info!(
            "KafkaSubscriber: subscribing to {} as {} (mode: {}, isolation: {})",
            topic, group_id, self.mode.guarantee, self.mode.isolation
        );

        let mut client = ClientConfig::new();
        client
            .set("bootstrap.servers", &self.config.bootstrap_servers)
            .set("client.id", &self.config.client_id)
            .set("security.protocol", &self.config.security_protocol)
            .set("group.id", group_id)
            .set("auto.offset.reset", &self.config.auto_offset_reset)
            .set("enable.partition.eof", "false")
            .set(
                "session.timeout.ms",
                self.config.session_timeout_ms.to_string(),
            )
            .set(
                "heartbeat.interval.ms",
                self.config.heartbeat_interval_ms.to_string(),
            )
            .set(
                "max.poll.interval.ms",
                self.config.max_poll_interval_ms.to_string(),
            )
            .set("partition.assignment.strategy", "cooperative-sticky");
        for (key, value) in self.mode.consumer_properties() {
            client.set(key, value);
        }

        let consumer: LoggingConsumer = client.create_with_context(LoggingConsumerContext)?;
        consumer.subscribe(&[topic])?;

        let commit_mode = match self.mode.ack_mode {
            AckMode::ManualImmediate => Some(CommitMode::Sync),
            AckMode::Manual => Some(CommitMode::Async),
            AckMode::None => None,
        };

        Ok(Box::new(KafkaSubscription {
            consumer: Arc::new(consumer),
            commit_mode,
        }))
    }
}

struct KafkaSubscription {
    consumer: Arc<LoggingConsumer>,
    /// `None` when the client commits offsets on its own.
    commit_mode: Option<CommitMode>,
}

#[async_trait]
impl Subscription for KafkaSubscription {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Delivery>, DeliveryError> {
        let message = match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_) => return Ok(None),
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(message)) => message,
        };

        let record = ConsumedRecord {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            key: message
                .key()
                .map(|key| String::from_utf8_lossy(key).into_owned()),
            payload: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        };
        debug!(
            "KafkaSubscription: received {}:{}@{}",
            record.topic, record.partition, record.offset
        );

        let ack: Box<dyn AckHandle> = match self.commit_mode {
            Some(mode) => Box::new(KafkaAckHandle {
                consumer: Arc::clone(&self.consumer),
                topic: record.topic.clone(),
                partition: record.partition,
                offset: record.offset,
                mode,
            }),
            None => Box::new(AutoCommitAck),
        };

        Ok(Some(Delivery { record, ack }))
    }

    async fn rewind(&mut self, record: &ConsumedRecord) -> Result<(), DeliveryError> {
        self.consumer.seek(
            &record.topic,
            record.partition,
            Offset::Offset(record.offset),
            Duration::from_secs(5),
        )?;
        debug!(
            "KafkaSubscription: rewound {}:{} to {}",
            record.topic, record.partition, record.offset
        );
        Ok(())
    }
}

struct KafkaAckHandle {
    consumer: Arc<LoggingConsumer>,
    topic: String,
    partition: i32,
    offset: i64,
    mode: CommitMode,
}

#[async_trait]
impl AckHandle for KafkaAckHandle {
    async fn acknowledge(&self) -> Result<(), DeliveryError> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(&self.topic, self.partition, Offset::Offset(self.offset + 1))?;
        self.consumer.commit(&offsets, self.mode)?;
        debug!(
            "KafkaAckHandle: committed {}:{}@{}",
            self.topic,
            self.partition,
            self.offset + 1
        );
        Ok(())
    }
}

/// Acknowledgment is implicit: the client already stored and auto-commits the offset.
struct AutoCommitAck;

#[async_trait]
impl AckHandle for AutoCommitAck {
    async fn acknowledge(&self) -> Result<(), DeliveryError> {
        Ok(())
    }
}

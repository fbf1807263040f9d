//! In-process broker implementing the same traits as the Kafka adapters.
//!
//! Records live in per-topic partitioned logs. Consumer groups keep committed
//! offsets, and every subscription reads from its own positions, which start at
//! the group's committed offsets. Dropping a subscription and subscribing again
//! therefore replays everything that was never acknowledged, the same way a
//! restarted Kafka consumer does.
//!
//! Transactional records stay pending until their producer commits. A
//! read-committed subscription stops at the first pending record of a partition
//! and skips aborted ones; read-uncommitted sees everything.
//!
//! Registering a transactional id again bumps its epoch: the pending records of
//! the older producer are aborted and every later call it makes fails with
//! [`DeliveryError::ProducerFenced`].

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::infrastructure::delivery_mode::{DeliveryMode, IsolationLevel};
use crate::infrastructure::error::DeliveryError;
use crate::infrastructure::kafka_abstraction::{
    AckHandle, ConsumedRecord, Delivery, DeliveryPosition, MessagePublisher, MessageSubscriber,
    Subscription, TransactionalProducer,
};

const DEFAULT_PARTITIONS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
enum RecordStatus {
    Committed,
    Pending { producer: String, epoch: u64 },
    Aborted,
}

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<String>,
    payload: Vec<u8>,
    status: RecordStatus,
}

#[derive(Debug)]
struct GroupState {
    committed: Vec<i64>,
    members: Vec<u64>,
}

impl GroupState {
    /// Partitions owned by `member`: round-robin over the current member list.
    fn assignment(&self, member: u64, partitions: usize) -> Vec<usize> {
        match self.members.iter().position(|m| *m == member) {
            Some(index) => (0..partitions)
                .filter(|p| p % self.members.len() == index)
                .collect(),
            None => Vec::new(),
        }
    }
}

#[derive(Default)]
struct BrokerInner {
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    /// Keyed by (group id, topic).
    groups: HashMap<(String, String), GroupState>,
    epochs: HashMap<String, u64>,
    next_member: u64,
}

impl BrokerInner {
    fn partitions_mut(&mut self, topic: &str, count: usize) -> &mut Vec<Vec<StoredRecord>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); count])
    }

    fn resolve_pending(&mut self, producer: &str, epoch: u64, outcome: RecordStatus) -> usize {
        let mut resolved = 0;
        for partitions in self.topics.values_mut() {
            for record in partitions.iter_mut().flatten() {
                let owned = matches!(
                    &record.status,
                    RecordStatus::Pending { producer: p, epoch: e } if p == producer && *e == epoch
                );
                if owned {
                    record.status = outcome.clone();
                    resolved += 1;
                }
            }
        }
        resolved
    }

    /// Aborts pending records of every epoch of `producer` older than `epoch`.
    fn abort_older_epochs(&mut self, producer: &str, epoch: u64) -> usize {
        let mut aborted = 0;
        for partitions in self.topics.values_mut() {
            for record in partitions.iter_mut().flatten() {
                let stale = matches!(
                    &record.status,
                    RecordStatus::Pending { producer: p, epoch: e } if p == producer && *e < epoch
                );
                if stale {
                    record.status = RecordStatus::Aborted;
                    aborted += 1;
                }
            }
        }
        aborted
    }
}

struct Shared {
    partitions: usize,
    inner: Mutex<BrokerInner>,
    arrivals: Notify,
    fail_next_publishes: AtomicUsize,
    reject_publishes: AtomicBool,
    fail_next_commits: AtomicUsize,
    fail_next_acks: AtomicUsize,
    publish_attempts: AtomicUsize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BrokerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn partition_for(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions as u64) as usize
    }

    /// Counts the attempt and applies injected faults.
    fn check_publish_faults(&self) -> Result<(), DeliveryError> {
        self.publish_attempts.fetch_add(1, Ordering::SeqCst);
        if self.reject_publishes.load(Ordering::SeqCst) {
            return Err(DeliveryError::PermanentPublishFailure(
                "record rejected by broker".to_string(),
            ));
        }
        if take_one(&self.fail_next_publishes) {
            return Err(DeliveryError::TransientPublishFailure(
                "broker unavailable".to_string(),
            ));
        }
        Ok(())
    }

    fn append(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
        status: RecordStatus,
    ) -> DeliveryPosition {
        let partition = self.partition_for(key);
        let offset = {
            let mut inner = self.lock();
            let log = &mut inner.partitions_mut(topic, self.partitions)[partition];
            log.push(StoredRecord {
                key: Some(key.to_string()),
                payload: payload.to_vec(),
                status,
            });
            (log.len() - 1) as i64
        };
        self.arrivals.notify_waiters();
        DeliveryPosition {
            partition: partition as i32,
            offset,
        }
    }
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

/// Consumer behaviour for in-memory subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsumerSettings {
    pub isolation: IsolationLevel,
    /// Commit the offset as soon as a record is handed out.
    pub auto_commit: bool,
}

impl ConsumerSettings {
    pub fn for_mode(mode: &DeliveryMode) -> Self {
        Self {
            isolation: mode.isolation,
            auto_commit: !mode.ack_mode.is_manual(),
        }
    }
}

#[derive(Clone)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    pub fn with_partitions(partitions: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                partitions: partitions.max(1),
                inner: Mutex::new(BrokerInner::default()),
                arrivals: Notify::new(),
                fail_next_publishes: AtomicUsize::new(0),
                reject_publishes: AtomicBool::new(false),
                fail_next_commits: AtomicUsize::new(0),
                fail_next_acks: AtomicUsize::new(0),
                publish_attempts: AtomicUsize::new(0),
            }),
        }
    }

    /// Registers `transactional_id`, fencing any producer registered before with the same id.
    pub fn transactional_producer(
        &self,
        transactional_id: impl Into<String>,
    ) -> InMemoryTransactionalProducer {
        let transactional_id = transactional_id.into();
        let (epoch, aborted) = {
            let mut inner = self.shared.lock();
            let epoch = {
                let entry = inner.epochs.entry(transactional_id.clone()).or_insert(0);
                *entry += 1;
                *entry
            };
            (epoch, inner.abort_older_epochs(&transactional_id, epoch))
        };
        if aborted > 0 {
            info!(
                "InMemoryBroker: fenced {} (epoch {}), aborted {} pending records",
                transactional_id, epoch, aborted
            );
        }
        self.shared.arrivals.notify_waiters();

        InMemoryTransactionalProducer {
            shared: Arc::clone(&self.shared),
            transactional_id,
            epoch,
            in_transaction: AtomicBool::new(false),
        }
    }

    pub fn subscriber(&self, settings: ConsumerSettings) -> InMemorySubscriber {
        InMemorySubscriber {
            shared: Arc::clone(&self.shared),
            settings,
        }
    }

    /// The next `count` publishes or transactional sends fail transiently.
    pub fn fail_next_publishes(&self, count: usize) {
        self.shared
            .fail_next_publishes
            .store(count, Ordering::SeqCst);
    }

    /// While set, every publish fails permanently.
    pub fn reject_publishes(&self, reject: bool) {
        self.shared.reject_publishes.store(reject, Ordering::SeqCst);
    }

    /// The next `count` transaction commits abort instead.
    pub fn fail_next_commits(&self, count: usize) {
        self.shared.fail_next_commits.store(count, Ordering::SeqCst);
    }

    /// The next `count` acknowledgments fail without committing the offset.
    pub fn fail_next_acks(&self, count: usize) {
        self.shared.fail_next_acks.store(count, Ordering::SeqCst);
    }

    pub fn publish_attempts(&self) -> usize {
        self.shared.publish_attempts.load(Ordering::SeqCst)
    }

    /// Every record of `topic` regardless of transaction state, partition by partition.
    pub fn records(&self, topic: &str) -> Vec<ConsumedRecord> {
        self.collect(topic, |_| true)
    }

    pub fn committed_records(&self, topic: &str) -> Vec<ConsumedRecord> {
        self.collect(topic, |status| *status == RecordStatus::Committed)
    }

    pub fn committed_offset(&self, group_id: &str, topic: &str, partition: i32) -> Option<i64> {
        let inner = self.shared.lock();
        inner
            .groups
            .get(&(group_id.to_string(), topic.to_string()))
            .and_then(|group| group.committed.get(partition as usize).copied())
    }

    fn collect(&self, topic: &str, filter: impl Fn(&RecordStatus) -> bool) -> Vec<ConsumedRecord> {
        let inner = self.shared.lock();
        let Some(partitions) = inner.topics.get(topic) else {
            return Vec::new();
        };
        partitions
            .iter()
            .enumerate()
            .flat_map(|(partition, log)| {
                log.iter()
                    .enumerate()
                    .filter(|(_, record)| filter(&record.status))
                    .map(move |(offset, record)| ConsumedRecord {
                        topic: topic.to_string(),
                        partition: partition as i32,
                        offset: offset as i64,
                        key: record.key.clone(),
                        payload: record.payload.clone(),
                    })
            })
            .collect()
    }
}

#[async_trait]
impl MessagePublisher for InMemoryBroker {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<DeliveryPosition, DeliveryError> {
        self.shared.check_publish_faults()?;
        let position = self
            .shared
            .append(topic, key, payload, RecordStatus::Committed);
        debug!(
            "InMemoryBroker: published {} to {}:{}@{}",
            key, topic, position.partition, position.offset
        );
        Ok(position)
    }
}

pub struct InMemoryTransactionalProducer {
    shared: Arc<Shared>,
    transactional_id: String,
    epoch: u64,
    in_transaction: AtomicBool,
}

impl InMemoryTransactionalProducer {
    pub fn transactional_id(&self) -> &str {
        &self.transactional_id
    }

    fn ensure_current(&self, inner: &BrokerInner) -> Result<(), DeliveryError> {
        match inner.epochs.get(&self.transactional_id) {
            Some(current) if *current == self.epoch => Ok(()),
            _ => Err(DeliveryError::ProducerFenced(format!(
                "{} epoch {} has been superseded",
                self.transactional_id, self.epoch
            ))),
        }
    }

    fn finish(&self, outcome: RecordStatus) -> Result<usize, DeliveryError> {
        let resolved = {
            let mut inner = self.shared.lock();
            self.ensure_current(&inner)?;
            inner.resolve_pending(&self.transactional_id, self.epoch, outcome)
        };
        self.in_transaction.store(false, Ordering::SeqCst);
        self.shared.arrivals.notify_waiters();
        Ok(resolved)
    }
}

#[async_trait]
impl TransactionalProducer for InMemoryTransactionalProducer {
    async fn begin_transaction(&self) -> Result<(), DeliveryError> {
        self.ensure_current(&self.shared.lock())?;
        if self.in_transaction.swap(true, Ordering::SeqCst) {
            return Err(DeliveryError::TransactionAborted(
                "transaction already in progress".to_string(),
            ));
        }
        Ok(())
    }

    async fn send(
        &self,
        topic: &str,
        key: &str,
        payload: &[u8],
    ) -> Result<DeliveryPosition, DeliveryError> {
        self.ensure_current(&self.shared.lock())?;
        if !self.in_transaction.load(Ordering::SeqCst) {
            return Err(DeliveryError::TransactionAborted(
                "no transaction in progress".to_string(),
            ));
        }
        self.shared.check_publish_faults()?;
        Ok(self.shared.append(
            topic,
            key,
            payload,
            RecordStatus::Pending {
                producer: self.transactional_id.clone(),
                epoch: self.epoch,
            },
        ))
    }

    async fn commit_transaction(&self) -> Result<(), DeliveryError> {
        if take_one(&self.shared.fail_next_commits) {
            self.finish(RecordStatus::Aborted)?;
            return Err(DeliveryError::TransactionAborted(
                "commit rejected by broker".to_string(),
            ));
        }
        let committed = self.finish(RecordStatus::Committed)?;
        debug!(
            "InMemoryBroker: {} committed {} records",
            self.transactional_id, committed
        );
        Ok(())
    }

    async fn abort_transaction(&self) -> Result<(), DeliveryError> {
        let aborted = self.finish(RecordStatus::Aborted)?;
        debug!(
            "InMemoryBroker: {} aborted {} records",
            self.transactional_id, aborted
        );
        Ok(())
    }
}

#[derive(Clone)]
pub struct InMemorySubscriber {
    shared: Arc<Shared>,
    settings: ConsumerSettings,
}

#[async_trait]
impl MessageSubscriber for InMemorySubscriber {
    async fn subscribe(
        &self,
        topic: &str,
        group_id: &str,
    ) -> Result<Box<dyn Subscription>, DeliveryError> {
        let group_key = (group_id.to_string(), topic.to_string());
        let member = {
            let mut inner = self.shared.lock();
            inner.partitions_mut(topic, self.shared.partitions);
            let member = inner.next_member;
            inner.next_member += 1;
            let partitions = self.shared.partitions;
            inner
                .groups
                .entry(group_key.clone())
                .or_insert_with(|| GroupState {
                    committed: vec![0; partitions],
                    members: Vec::new(),
                })
                .members
                .push(member);
            member
        };
        debug!(
            "InMemoryBroker: member {} joined {} on {}",
            member, group_id, topic
        );

        Ok(Box::new(InMemorySubscription {
            shared: Arc::clone(&self.shared),
            settings: self.settings,
            group_key,
            member,
            positions: HashMap::new(),
            cursor: 0,
        }))
    }
}

struct InMemorySubscription {
    shared: Arc<Shared>,
    settings: ConsumerSettings,
    group_key: (String, String),
    member: u64,
    positions: HashMap<usize, i64>,
    cursor: usize,
}

impl InMemorySubscription {
    fn next_delivery(&mut self) -> Option<Delivery> {
        let partitions = self.shared.partitions;
        let mut guard = self.shared.lock();
        let BrokerInner { topics, groups, .. } = &mut *guard;
        let group = groups.get_mut(&self.group_key)?;
        let log = topics.get(&self.group_key.1)?;

        let assigned = group.assignment(self.member, partitions);
        self.positions.retain(|p, _| assigned.contains(p));
        for partition in &assigned {
            self.positions
                .entry(*partition)
                .or_insert(group.committed[*partition]);
        }

        let count = assigned.len();
        for step in 0..count {
            let partition = assigned[(self.cursor + step) % count];
            let records = &log[partition];
            let Some(position) = self.positions.get_mut(&partition) else {
                continue;
            };

            let mut offset = *position;
            let mut found = None;
            while let Some(record) = records.get(offset as usize) {
                match (&record.status, self.settings.isolation) {
                    (RecordStatus::Pending { .. }, IsolationLevel::ReadCommitted) => break,
                    (RecordStatus::Aborted, IsolationLevel::ReadCommitted) => offset += 1,
                    _ => {
                        found = Some(record);
                        break;
                    }
                }
            }

            let Some(record) = found else {
                *position = offset;
                continue;
            };
            *position = offset + 1;
            self.cursor = (self.cursor + step + 1) % count;
            if self.settings.auto_commit {
                group.committed[partition] = offset + 1;
            }

            let consumed = ConsumedRecord {
                topic: self.group_key.1.clone(),
                partition: partition as i32,
                offset,
                key: record.key.clone(),
                payload: record.payload.clone(),
            };
            let ack = MemoryAck {
                shared: Arc::clone(&self.shared),
                group_key: self.group_key.clone(),
                partition,
                offset,
                manual: !self.settings.auto_commit,
            };
            return Some(Delivery {
                record: consumed,
                ack: Box::new(ack),
            });
        }
        None
    }
}

#[async_trait]
impl Subscription for InMemorySubscription {
    async fn poll(&mut self, timeout: Duration) -> Result<Option<Delivery>, DeliveryError> {
        let deadline = tokio::time::Instant::now() + timeout;
        let shared = Arc::clone(&self.shared);
        loop {
            let arrived = shared.arrivals.notified();
            if let Some(delivery) = self.next_delivery() {
                return Ok(Some(delivery));
            }
            tokio::select! {
                _ = arrived => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn rewind(&mut self, record: &ConsumedRecord) -> Result<(), DeliveryError> {
        let partition = record.partition as usize;
        if let Some(position) = self.positions.get_mut(&partition) {
            *position = (*position).min(record.offset);
        }
        Ok(())
    }
}

impl Drop for InMemorySubscription {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        if let Some(group) = inner.groups.get_mut(&self.group_key) {
            group.members.retain(|m| *m != self.member);
        }
    }
}

struct MemoryAck {
    shared: Arc<Shared>,
    group_key: (String, String),
    partition: usize,
    offset: i64,
    manual: bool,
}

#[async_trait]
impl AckHandle for MemoryAck {
    async fn acknowledge(&self) -> Result<(), DeliveryError> {
        if !self.manual {
            return Ok(());
        }
        if take_one(&self.shared.fail_next_acks) {
            warn!(
                "InMemoryBroker: acknowledgment of {}:{}@{} failed",
                self.group_key.1, self.partition, self.offset
            );
            return Err(DeliveryError::Consumer(
                "offset commit failed".to_string(),
            ));
        }
        let mut inner = self.shared.lock();
        if let Some(group) = inner.groups.get_mut(&self.group_key) {
            // A late ack from a previous owner never moves the group backwards.
            let committed = &mut group.committed[self.partition];
            *committed = (*committed).max(self.offset + 1);
        }
        Ok(())
    }
}

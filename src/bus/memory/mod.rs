//! In-memory partitioned-log broker.
//!
//! Models the parts of a Kafka cluster the messaging substrate relies on:
//! - topics split into partitions, append-only, offsets from 0
//! - key routing (same key, same partition)
//! - per (topic, group) committed offsets that survive consumer restarts
//! - group membership with round-robin partition assignment; joining or
//!   leaving a group reassigns partitions
//!
//! Ideal for local development and testing without external dependencies.
//! Faults can be injected to exercise retry and backoff paths.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::Notify;
use tracing::{debug, info};

use super::{
    Broker, BrokerConsumer, BrokerProducer, ConsumerError, OffsetReset, PublishError, Record,
    RecordMetadata, RecordPosition,
};
use crate::config::MemoryConfig;

/// Default partition count for auto-created topics.
pub const DEFAULT_PARTITIONS: u32 = 3;

/// Default maximum payload size (1 MiB, Kafka's `message.max.bytes`).
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 1024 * 1024;

/// Configuration for the in-memory broker.
#[derive(Debug, Clone)]
pub struct InMemoryConfig {
    /// Partitions given to topics created on first use.
    pub default_partitions: u32,
    /// Create unknown topics on publish/subscribe instead of failing.
    pub auto_create_topics: bool,
    /// Payloads larger than this are rejected as fatal.
    pub max_message_bytes: usize,
    /// Start position for groups with no committed offset.
    pub initial_offset: OffsetReset,
}

impl Default for InMemoryConfig {
    fn default() -> Self {
        Self {
            default_partitions: DEFAULT_PARTITIONS,
            auto_create_topics: true,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            initial_offset: OffsetReset::Earliest,
        }
    }
}

impl InMemoryConfig {
    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.default_partitions = partitions.max(1);
        self
    }

    pub fn with_auto_create(mut self, enabled: bool) -> Self {
        self.auto_create_topics = enabled;
        self
    }

    pub fn with_max_message_bytes(mut self, limit: usize) -> Self {
        self.max_message_bytes = limit;
        self
    }

    pub fn with_initial_offset(mut self, reset: OffsetReset) -> Self {
        self.initial_offset = reset;
        self
    }
}

impl From<&MemoryConfig> for InMemoryConfig {
    fn from(config: &MemoryConfig) -> Self {
        Self {
            default_partitions: config.default_partitions.max(1),
            auto_create_topics: config.auto_create_topics,
            max_message_bytes: config.max_message_bytes,
            initial_offset: config.initial_offset,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredRecord {
    key: Option<Bytes>,
    payload: Bytes,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct GroupKey {
    topic: String,
    group_id: String,
}

#[derive(Debug, Default)]
struct GroupState {
    /// Next offset to read, per partition.
    committed: HashMap<i32, i64>,
    members: BTreeSet<u64>,
    generation: u64,
}

impl GroupState {
    fn assignment(&self, member_id: u64, partitions: u32) -> Vec<i32> {
        let Some(index) = self.members.iter().position(|m| *m == member_id) else {
            return Vec::new();
        };
        let members = self.members.len() as u32;
        (0..partitions)
            .filter(|p| p % members == index as u32)
            .map(|p| p as i32)
            .collect()
    }
}

#[derive(Debug, Default)]
struct Inner {
    topics: HashMap<String, Vec<Vec<StoredRecord>>>,
    groups: HashMap<GroupKey, GroupState>,
}

#[derive(Debug, Default)]
struct Faults {
    publish: VecDeque<PublishError>,
    poll: VecDeque<ConsumerError>,
}

struct BrokerState {
    config: InMemoryConfig,
    inner: Mutex<Inner>,
    faults: Mutex<Faults>,
    appended: Notify,
    next_member: AtomicU64,
    round_robin: AtomicU64,
}

impl BrokerState {
    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn faults(&self) -> MutexGuard<'_, Faults> {
        self.faults.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Partition count of `topic`, creating it when allowed.
    fn ensure_topic(&self, inner: &mut Inner, topic: &str) -> Option<u32> {
        if let Some(partitions) = inner.topics.get(topic) {
            return Some(partitions.len() as u32);
        }
        if !self.config.auto_create_topics {
            return None;
        }
        let count = self.config.default_partitions.max(1);
        inner
            .topics
            .insert(topic.to_string(), vec![Vec::new(); count as usize]);
        info!(topic = %topic, partitions = count, "Auto-created topic");
        Some(count)
    }

    fn partition_for(&self, key: Option<&[u8]>, partitions: u32) -> i32 {
        let slot = match key {
            Some(key) => {
                let digest = Sha256::digest(key);
                u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]) as u64
            }
            None => self.round_robin.fetch_add(1, Ordering::Relaxed),
        };
        (slot % partitions as u64) as i32
    }
}

/// In-memory broker shared by every producer and consumer created from it.
///
/// Cloning is cheap and yields a handle to the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new(InMemoryConfig::default())
    }
}

impl InMemoryBroker {
    pub fn new(config: InMemoryConfig) -> Self {
        debug!(
            default_partitions = config.default_partitions,
            auto_create_topics = config.auto_create_topics,
            "In-memory broker initialized"
        );
        Self {
            state: Arc::new(BrokerState {
                config,
                inner: Mutex::new(Inner::default()),
                faults: Mutex::new(Faults::default()),
                appended: Notify::new(),
                next_member: AtomicU64::new(1),
                round_robin: AtomicU64::new(0),
            }),
        }
    }

    /// Create a topic with an explicit partition count. No-op if it exists.
    pub fn create_topic(&self, topic: &str, partitions: u32) {
        let mut inner = self.state.inner();
        inner
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions.max(1) as usize]);
    }

    pub fn topic_exists(&self, topic: &str) -> bool {
        self.state.inner().topics.contains_key(topic)
    }

    pub fn partition_count(&self, topic: &str) -> Option<u32> {
        self.state
            .inner()
            .topics
            .get(topic)
            .map(|p| p.len() as u32)
    }

    /// Offset the next record appended to the partition will receive.
    pub fn end_offset(&self, topic: &str, partition: i32) -> Option<i64> {
        self.state
            .inner()
            .topics
            .get(topic)
            .and_then(|p| p.get(partition as usize))
            .map(|log| log.len() as i64)
    }

    /// All records currently retained in one partition.
    pub fn records(&self, topic: &str, partition: i32) -> Vec<Record> {
        let inner = self.state.inner();
        let Some(log) = inner
            .topics
            .get(topic)
            .and_then(|p| p.get(partition as usize))
        else {
            return Vec::new();
        };
        log.iter()
            .enumerate()
            .map(|(offset, stored)| to_record(topic, partition, offset as i64, stored))
            .collect()
    }

    /// Committed offset (next offset to read) for a group on a partition.
    pub fn committed_offset(&self, topic: &str, group_id: &str, partition: i32) -> Option<i64> {
        let key = GroupKey {
            topic: topic.to_string(),
            group_id: group_id.to_string(),
        };
        self.state
            .inner()
            .groups
            .get(&key)
            .and_then(|g| g.committed.get(&partition).copied())
    }

    /// Number of live consumers in a group.
    pub fn group_members(&self, topic: &str, group_id: &str) -> usize {
        let key = GroupKey {
            topic: topic.to_string(),
            group_id: group_id.to_string(),
        };
        self.state
            .inner()
            .groups
            .get(&key)
            .map(|g| g.members.len())
            .unwrap_or(0)
    }

    /// Fail the next publish with `error` instead of appending.
    pub fn fail_next_publish(&self, error: PublishError) {
        self.state.faults().publish.push_back(error);
    }

    /// Fail the next poll (on any consumer) with `error`.
    pub fn fail_next_poll(&self, error: ConsumerError) {
        self.state.faults().poll.push_back(error);
    }

    fn append(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        payload: &[u8],
    ) -> std::result::Result<RecordMetadata, PublishError> {
        if let Some(error) = self.state.faults().publish.pop_front() {
            return Err(error);
        }

        if payload.len() > self.state.config.max_message_bytes {
            return Err(PublishError::Fatal(format!(
                "Message size {} exceeds limit of {} bytes",
                payload.len(),
                self.state.config.max_message_bytes
            )));
        }

        let metadata = {
            let mut inner = self.state.inner();
            let partitions = self
                .state
                .ensure_topic(&mut inner, topic)
                .ok_or_else(|| {
                    PublishError::Fatal(format!(
                        "Unknown topic '{}' and auto-creation is disabled",
                        topic
                    ))
                })?;
            let partition = self.state.partition_for(key, partitions);
            let timestamp = Utc::now();
            let log = inner
                .topics
                .get_mut(topic)
                .and_then(|p| p.get_mut(partition as usize))
                .ok_or_else(|| PublishError::Fatal(format!("Partition {} missing", partition)))?;
            log.push(StoredRecord {
                key: key.map(Bytes::copy_from_slice),
                payload: Bytes::copy_from_slice(payload),
                timestamp,
            });
            RecordMetadata {
                topic: topic.to_string(),
                partition,
                offset: log.len() as i64 - 1,
                timestamp,
            }
        };

        self.state.appended.notify_waiters();
        Ok(metadata)
    }
}

fn to_record(topic: &str, partition: i32, offset: i64, stored: &StoredRecord) -> Record {
    Record {
        topic: topic.to_string(),
        partition,
        offset,
        key: stored.key.clone(),
        payload: stored.payload.clone(),
        timestamp: stored.timestamp,
    }
}

#[async_trait]
impl Broker for InMemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn producer(&self) -> std::result::Result<Arc<dyn BrokerProducer>, PublishError> {
        Ok(Arc::new(InMemoryProducer {
            broker: self.clone(),
        }))
    }

    async fn consumer(
        &self,
        group_id: &str,
    ) -> std::result::Result<Box<dyn BrokerConsumer>, ConsumerError> {
        Ok(Box::new(InMemoryConsumer::new(self.clone(), group_id)))
    }
}

/// Producer handle. Appends are synchronous, so there is never anything to flush.
pub struct InMemoryProducer {
    broker: InMemoryBroker,
}

#[async_trait]
impl BrokerProducer for InMemoryProducer {
    async fn send(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        payload: &[u8],
    ) -> std::result::Result<RecordMetadata, PublishError> {
        self.broker.append(topic, key, payload)
    }

    async fn flush(&self, _timeout: Duration) -> std::result::Result<(), PublishError> {
        Ok(())
    }
}

/// Consumer handle bound to one group.
pub struct InMemoryConsumer {
    broker: InMemoryBroker,
    member_id: u64,
    group_id: String,
    topic: Option<String>,
    /// Group generation the fetch positions were computed for.
    generation: Option<u64>,
    /// Fetch position per assigned partition.
    positions: BTreeMap<i32, i64>,
    /// Rotates the first partition served per poll.
    cursor: usize,
    closed: bool,
}

impl InMemoryConsumer {
    fn new(broker: InMemoryBroker, group_id: &str) -> Self {
        let member_id = broker.state.next_member.fetch_add(1, Ordering::Relaxed);
        Self {
            broker,
            member_id,
            group_id: group_id.to_string(),
            topic: None,
            generation: None,
            positions: BTreeMap::new(),
            cursor: 0,
            closed: false,
        }
    }

    fn group_key(&self, topic: &str) -> GroupKey {
        GroupKey {
            topic: topic.to_string(),
            group_id: self.group_id.clone(),
        }
    }

    fn leave_group(&mut self) {
        if let Some(topic) = self.topic.take() {
            let key = self.group_key(&topic);
            let mut inner = self.broker.state.inner();
            if let Some(group) = inner.groups.get_mut(&key) {
                if group.members.remove(&self.member_id) {
                    group.generation += 1;
                }
            }
            drop(inner);
            debug!(
                topic = %topic,
                group_id = %self.group_id,
                member_id = self.member_id,
                "Left consumer group"
            );
        }
        self.positions.clear();
        self.generation = None;
    }

    /// Recompute assignment if the group changed, then read up to `max` records.
    fn fetch(&mut self, topic: &str, max: usize) -> Vec<Record> {
        let reset = self.broker.state.config.initial_offset;
        let key = self.group_key(topic);
        let mut inner = self.broker.state.inner();
        let Inner { topics, groups } = &mut *inner;
        let Some(partitions) = topics.get(topic) else {
            return Vec::new();
        };
        let group = groups.entry(key).or_default();

        if self.generation != Some(group.generation) {
            let assigned = group.assignment(self.member_id, partitions.len() as u32);
            self.positions = assigned
                .into_iter()
                .map(|p| {
                    let start = group.committed.get(&p).copied().unwrap_or(match reset {
                        OffsetReset::Earliest => 0,
                        OffsetReset::Latest => partitions[p as usize].len() as i64,
                    });
                    (p, start)
                })
                .collect();
            self.generation = Some(group.generation);
            debug!(
                topic = %topic,
                group_id = %self.group_id,
                member_id = self.member_id,
                assignment = ?self.positions.keys().collect::<Vec<_>>(),
                "Partitions assigned"
            );
        }

        let assigned: Vec<i32> = self.positions.keys().copied().collect();
        if assigned.is_empty() {
            return Vec::new();
        }

        let mut records = Vec::new();
        let start = self.cursor % assigned.len();
        self.cursor = self.cursor.wrapping_add(1);
        for partition in assigned.iter().cycle().skip(start).take(assigned.len()) {
            if records.len() >= max {
                break;
            }
            let log = &partitions[*partition as usize];
            let Some(position) = self.positions.get_mut(partition) else {
                continue;
            };
            while records.len() < max && (*position as usize) < log.len() {
                records.push(to_record(
                    topic,
                    *partition,
                    *position,
                    &log[*position as usize],
                ));
                *position += 1;
            }
        }
        records
    }
}

#[async_trait]
impl BrokerConsumer for InMemoryConsumer {
    async fn subscribe(&mut self, topic: &str) -> std::result::Result<(), ConsumerError> {
        if self.closed {
            return Err(ConsumerError::Connection("Consumer is closed".to_string()));
        }
        if self.topic.as_deref() == Some(topic) {
            return Ok(());
        }
        self.leave_group();

        {
            let mut inner = self.broker.state.inner();
            self.broker
                .state
                .ensure_topic(&mut inner, topic)
                .ok_or_else(|| {
                    ConsumerError::Subscribe(format!(
                        "Unknown topic '{}' and auto-creation is disabled",
                        topic
                    ))
                })?;
            let group = inner.groups.entry(self.group_key(topic)).or_default();
            group.members.insert(self.member_id);
            group.generation += 1;
        }

        self.topic = Some(topic.to_string());
        self.generation = None;
        debug!(
            topic = %topic,
            group_id = %self.group_id,
            member_id = self.member_id,
            "Joined consumer group"
        );
        Ok(())
    }

    async fn poll(
        &mut self,
        timeout: Duration,
        max_records: usize,
    ) -> std::result::Result<Vec<Record>, ConsumerError> {
        if self.closed {
            return Err(ConsumerError::Connection("Consumer is closed".to_string()));
        }
        let topic = self
            .topic
            .clone()
            .ok_or_else(|| ConsumerError::Subscribe("Consumer is not subscribed".to_string()))?;

        if let Some(error) = self.broker.state.faults().poll.pop_front() {
            return Err(error);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        let state = Arc::clone(&self.broker.state);
        loop {
            // Register for wakeups before reading so an append between the
            // read and the wait is not missed.
            let appended = state.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            let records = self.fetch(&topic, max_records.max(1));
            if !records.is_empty() {
                return Ok(records);
            }

            if tokio::time::timeout_at(deadline, appended).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn commit(&mut self, record: &Record) -> std::result::Result<(), ConsumerError> {
        let topic = self
            .topic
            .clone()
            .ok_or_else(|| ConsumerError::Commit("Consumer is not subscribed".to_string()))?;
        if record.topic != topic {
            return Err(ConsumerError::Commit(format!(
                "Record from '{}' committed on a consumer of '{}'",
                record.topic, topic
            )));
        }

        let key = self.group_key(&topic);
        let mut inner = self.broker.state.inner();
        let partitions = inner.topics.get(&topic).map(|p| p.len() as u32).unwrap_or(0);
        let group = inner.groups.entry(key).or_default();
        if !group
            .assignment(self.member_id, partitions)
            .contains(&record.partition)
        {
            return Err(ConsumerError::Revoked {
                topic,
                partition: record.partition,
            });
        }

        let next = record.offset + 1;
        let committed = group.committed.entry(record.partition).or_insert(next);
        if *committed < next {
            *committed = next;
        }
        Ok(())
    }

    async fn seek(&mut self, position: &RecordPosition) -> std::result::Result<(), ConsumerError> {
        match self.positions.get_mut(&position.partition) {
            Some(current) if self.topic.as_deref() == Some(position.topic.as_str()) => {
                *current = position.offset;
                Ok(())
            }
            _ => Err(ConsumerError::Revoked {
                topic: position.topic.clone(),
                partition: position.partition,
            }),
        }
    }

    async fn close(&mut self) -> std::result::Result<(), ConsumerError> {
        if !self.closed {
            self.leave_group();
            self.closed = true;
        }
        Ok(())
    }
}

impl Drop for InMemoryConsumer {
    fn drop(&mut self) {
        if !self.closed {
            self.leave_group();
        }
    }
}

//! Broker abstraction for asynchronous event delivery.
//!
//! This module contains:
//! - `Record` / `RecordMetadata`: what travels through a topic
//! - `Broker`, `BrokerProducer`, `BrokerConsumer`: the seams a backend implements
//! - Error taxonomy for the publish and consume paths
//! - Implementations: in-memory (always available), Kafka (`--features kafka`)
//!
//! Within one partition records are totally ordered by offset. A consumer
//! group's committed offset is the offset of the next record to read and
//! never decreases.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{info, warn};

use crate::config::{MessagingConfig, MessagingType};

mod error;
#[cfg(feature = "kafka")]
pub mod kafka;
pub mod memory;

pub use error::{ConsumerError, PublishError};
#[cfg(feature = "kafka")]
pub use kafka::{KafkaBroker, KafkaBrokerConfig};
pub use memory::{InMemoryBroker, InMemoryConfig};

// ============================================================================
// Records
// ============================================================================

/// A record read from a topic partition.
///
/// Immutable once written; `partition`, `offset` and `timestamp` are
/// assigned by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Routing key. Records sharing a key land on the same partition.
    pub key: Option<Bytes>,
    pub payload: Bytes,
    pub timestamp: DateTime<Utc>,
}

impl Record {
    /// Position of this record within its topic.
    pub fn position(&self) -> RecordPosition {
        RecordPosition {
            topic: self.topic.clone(),
            partition: self.partition,
            offset: self.offset,
        }
    }

    /// Payload as UTF-8 text.
    pub fn payload_str(&self) -> std::result::Result<&str, std::str::Utf8Error> {
        std::str::from_utf8(&self.payload)
    }

    /// Key rendered for logging.
    pub fn key_display(&self) -> Option<String> {
        self.key
            .as_ref()
            .map(|k| String::from_utf8_lossy(k).into_owned())
    }
}

/// Broker acknowledgement of a successful publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordMetadata {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub timestamp: DateTime<Utc>,
}

/// (topic, partition, offset) triple identifying one record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordPosition {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl fmt::Display for RecordPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)
    }
}

/// Where a consumer group without a committed offset starts reading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetReset {
    /// Oldest retained record.
    #[default]
    Earliest,
    /// Only records appended after the group joins.
    Latest,
}

impl OffsetReset {
    pub fn as_str(&self) -> &'static str {
        match self {
            OffsetReset::Earliest => "earliest",
            OffsetReset::Latest => "latest",
        }
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Write side of a broker connection.
///
/// One instance per process; shared across request handlers.
#[async_trait]
pub trait BrokerProducer: Send + Sync {
    /// Append one record and wait for the broker's acknowledgement.
    async fn send(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        payload: &[u8],
    ) -> std::result::Result<RecordMetadata, PublishError>;

    /// Deliver any buffered records, waiting at most `timeout`.
    async fn flush(&self, timeout: Duration) -> std::result::Result<(), PublishError>;
}

/// Read side of a broker connection, bound to one consumer group.
///
/// Exclusively owned by a single consumer loop.
#[async_trait]
pub trait BrokerConsumer: Send {
    /// Join the group for `topic`. Partitions are assigned by the broker.
    async fn subscribe(&mut self, topic: &str) -> std::result::Result<(), ConsumerError>;

    /// Wait up to `timeout` for records. An empty batch means the wait timed out.
    ///
    /// Records are returned in offset order within each partition.
    async fn poll(
        &mut self,
        timeout: Duration,
        max_records: usize,
    ) -> std::result::Result<Vec<Record>, ConsumerError>;

    /// Mark `record` as processed for the group.
    ///
    /// Committing an offset at or below the current committed offset is a no-op.
    async fn commit(&mut self, record: &Record) -> std::result::Result<(), ConsumerError>;

    /// Move the fetch position of a partition so `position` is delivered next.
    async fn seek(&mut self, position: &RecordPosition) -> std::result::Result<(), ConsumerError>;

    /// Leave the group and release the connection. Idempotent.
    async fn close(&mut self) -> std::result::Result<(), ConsumerError>;
}

/// Factory for producer and consumer connections to one broker cluster.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &'static str;

    async fn producer(&self) -> std::result::Result<Arc<dyn BrokerProducer>, PublishError>;

    async fn consumer(
        &self,
        group_id: &str,
    ) -> std::result::Result<Box<dyn BrokerConsumer>, ConsumerError>;
}

// ============================================================================
// Factory
// ============================================================================

/// Initialize a broker based on configuration.
///
/// Requires the corresponding feature to be enabled:
/// - Memory: always available
/// - Kafka: `--features kafka`
pub async fn init_broker(
    config: &MessagingConfig,
) -> std::result::Result<Arc<dyn Broker>, Box<dyn std::error::Error + Send + Sync>> {
    match config.messaging_type {
        MessagingType::Memory => {
            warn!("In-memory broker is process-local; events do not leave this process");
            let broker = InMemoryBroker::new(InMemoryConfig::from(&config.memory));
            info!(messaging_type = "memory", "Broker initialized");
            Ok(Arc::new(broker))
        }
        MessagingType::Kafka => {
            #[cfg(feature = "kafka")]
            {
                let broker = KafkaBroker::new(KafkaBrokerConfig::from(&config.kafka));
                info!(
                    messaging_type = "kafka",
                    bootstrap_servers = %config.kafka.bootstrap_servers,
                    "Broker initialized"
                );
                Ok(Arc::new(broker))
            }

            #[cfg(not(feature = "kafka"))]
            {
                Err("Kafka support requires the 'kafka' feature. Rebuild with --features kafka".into())
            }
        }
    }
}

//! Dead-letter forwarding for poison records.
//!
//! When the consumer's poison policy is `DeadLetter`, a record that keeps
//! failing is wrapped in a `DeadLetter` envelope and published to
//! `{topic}.dlq` before the consumer commits past it. Operators inspect or
//! replay from there.
//!
//! ## Message Format
//!
//! JSON envelope carrying the source position, the original key and payload
//! (lossy UTF-8), the handler's failure reason and the attempt count.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::bus::Record;
use crate::producer::EventProducer;

/// DLQ topic suffix. Full topic: `{topic}.dlq`
pub const DLQ_TOPIC_SUFFIX: &str = "dlq";

/// Build the DLQ topic name for a source topic.
pub fn dlq_topic_for(topic: &str) -> String {
    format!("{}.{}", topic, DLQ_TOPIC_SUFFIX)
}

/// Errors that can occur during DLQ operations.
#[derive(Debug, thiserror::Error)]
pub enum DlqError {
    #[error("Failed to serialize dead letter: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Failed to publish to DLQ: {0}")]
    PublishFailed(String),
}

/// A poison record and why it was given up on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub source_topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: String,
    pub reason: String,
    pub attempts: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn from_record(record: &Record, reason: &str, attempts: u32) -> Self {
        Self {
            source_topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
            key: record.key_display(),
            payload: String::from_utf8_lossy(&record.payload).into_owned(),
            reason: reason.to_string(),
            attempts,
            dead_lettered_at: Utc::now(),
        }
    }

    /// Topic this dead letter is published to.
    pub fn topic(&self) -> String {
        dlq_topic_for(&self.source_topic)
    }
}

/// Destination for records the consumer gives up on.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Persist the dead letter. On error the consumer retries the record
    /// instead of committing past it.
    async fn forward(&self, record: &Record, reason: &str, attempts: u32)
        -> Result<(), DlqError>;
}

/// Publishes dead letters through an `EventProducer`.
pub struct ProducerDeadLetterSink {
    producer: Arc<EventProducer>,
}

impl ProducerDeadLetterSink {
    pub fn new(producer: Arc<EventProducer>) -> Self {
        Self { producer }
    }
}

#[async_trait]
impl DeadLetterSink for ProducerDeadLetterSink {
    async fn forward(
        &self,
        record: &Record,
        reason: &str,
        attempts: u32,
    ) -> Result<(), DlqError> {
        let dead_letter = DeadLetter::from_record(record, reason, attempts);
        let topic = dead_letter.topic();
        let payload = serde_json::to_vec(&dead_letter)?;

        let meta = self
            .producer
            .publish(&topic, record.key.as_deref(), &payload)
            .await
            .map_err(|e| {
                warn!(topic = %topic, error = %e, "Dead-letter publish failed");
                DlqError::PublishFailed(e.to_string())
            })?;

        info!(
            topic = %topic,
            source_topic = %record.topic,
            source_partition = record.partition,
            source_offset = record.offset,
            dlq_offset = meta.offset,
            "Record dead-lettered"
        );
        Ok(())
    }
}

/// Channel-based sink for in-process inspection.
///
/// Useful for testing and for services that handle dead letters themselves.
pub struct ChannelDeadLetterSink {
    sender: mpsc::UnboundedSender<DeadLetter>,
}

impl ChannelDeadLetterSink {
    /// Returns the sink and a receiver for consuming dead letters.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DeadLetter>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl DeadLetterSink for ChannelDeadLetterSink {
    async fn forward(
        &self,
        record: &Record,
        reason: &str,
        attempts: u32,
    ) -> Result<(), DlqError> {
        self.sender
            .send(DeadLetter::from_record(record, reason, attempts))
            .map_err(|e| DlqError::PublishFailed(e.to_string()))
    }
}

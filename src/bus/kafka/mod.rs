//! Kafka broker implementation.
//!
//! Topics are used verbatim; the record key is passed through so Kafka's
//! partitioner keeps all records of one key on one partition.
//! Offsets are committed manually (`enable.auto.commit=false`) one record
//! at a time, after the handler succeeds.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use tracing::{debug, info, warn};

use super::{
    Broker, BrokerConsumer, BrokerProducer, ConsumerError, OffsetReset, PublishError, Record,
    RecordMetadata, RecordPosition,
};
use crate::config::KafkaConfig;

/// Timeout for seeks on an assigned partition.
const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for Kafka connections.
#[derive(Clone, Debug)]
pub struct KafkaBrokerConfig {
    /// Kafka bootstrap servers (comma-separated).
    pub bootstrap_servers: String,
    /// Where a group with no committed offset starts reading.
    pub initial_offset: OffsetReset,
    /// SASL username (optional, for authenticated clusters).
    pub sasl_username: Option<String>,
    /// SASL password (optional, for authenticated clusters).
    pub sasl_password: Option<String>,
    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512).
    pub sasl_mechanism: Option<String>,
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL).
    pub security_protocol: Option<String>,
    /// SSL CA certificate path (for SSL connections).
    pub ssl_ca_location: Option<String>,
    /// How long the producer keeps trying to deliver one record.
    pub message_timeout: Duration,
    /// Let consumers trigger broker-side topic creation.
    pub auto_create_topics: bool,
}

impl KafkaBrokerConfig {
    pub fn new(bootstrap_servers: impl Into<String>) -> Self {
        Self {
            bootstrap_servers: bootstrap_servers.into(),
            initial_offset: OffsetReset::Earliest,
            sasl_username: None,
            sasl_password: None,
            sasl_mechanism: None,
            security_protocol: None,
            ssl_ca_location: None,
            message_timeout: Duration::from_secs(5),
            auto_create_topics: true,
        }
    }

    /// Add SASL authentication.
    pub fn with_sasl(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
        mechanism: impl Into<String>,
    ) -> Self {
        self.sasl_username = Some(username.into());
        self.sasl_password = Some(password.into());
        self.sasl_mechanism = Some(mechanism.into());
        self.security_protocol = Some("SASL_SSL".to_string());
        self
    }

    /// Set SSL CA certificate location.
    pub fn with_ssl_ca(mut self, ca_location: impl Into<String>) -> Self {
        self.ssl_ca_location = Some(ca_location.into());
        self
    }

    pub fn with_initial_offset(mut self, reset: OffsetReset) -> Self {
        self.initial_offset = reset;
        self
    }

    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    /// Build a ClientConfig for producers.
    fn build_producer_config(&self) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set(
            "message.timeout.ms",
            self.message_timeout.as_millis().to_string(),
        );
        config.set("acks", "all");
        config.set("enable.idempotence", "true");

        self.apply_security_config(&mut config);
        config
    }

    /// Build a ClientConfig for a consumer in `group_id`.
    fn build_consumer_config(&self, group_id: &str) -> ClientConfig {
        let mut config = ClientConfig::new();
        config.set("bootstrap.servers", &self.bootstrap_servers);
        config.set("group.id", group_id);
        config.set("enable.auto.commit", "false");
        config.set("auto.offset.reset", self.initial_offset.as_str());
        config.set(
            "allow.auto.create.topics",
            if self.auto_create_topics { "true" } else { "false" },
        );

        self.apply_security_config(&mut config);
        config
    }

    /// Apply security settings to a ClientConfig.
    fn apply_security_config(&self, config: &mut ClientConfig) {
        if let Some(ref protocol) = self.security_protocol {
            config.set("security.protocol", protocol);
        }

        if let Some(ref mechanism) = self.sasl_mechanism {
            config.set("sasl.mechanism", mechanism);
        }

        if let Some(ref username) = self.sasl_username {
            config.set("sasl.username", username);
        }

        if let Some(ref password) = self.sasl_password {
            config.set("sasl.password", password);
        }

        if let Some(ref ca_location) = self.ssl_ca_location {
            config.set("ssl.ca.location", ca_location);
        }
    }
}

impl From<&KafkaConfig> for KafkaBrokerConfig {
    fn from(config: &KafkaConfig) -> Self {
        Self {
            bootstrap_servers: config.bootstrap_servers.clone(),
            initial_offset: config.initial_offset,
            sasl_username: config.sasl_username.clone(),
            sasl_password: config.sasl_password.clone(),
            sasl_mechanism: config.sasl_mechanism.clone(),
            security_protocol: config.security_protocol.clone(),
            ssl_ca_location: config.ssl_ca_location.clone(),
            message_timeout: config.message_timeout(),
            auto_create_topics: config.auto_create_topics,
        }
    }
}

// ============================================================================
// Error classification
// ============================================================================

/// Publish failures that retrying unchanged cannot fix.
fn is_fatal_code(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::MessageSizeTooLarge
            | RDKafkaErrorCode::UnknownTopicOrPartition
            | RDKafkaErrorCode::UnknownTopic
            | RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::SaslAuthenticationFailed
            | RDKafkaErrorCode::Authentication
    )
}

pub(crate) fn classify_publish_error(error: &KafkaError) -> PublishError {
    match error.rdkafka_error_code() {
        Some(code) if is_fatal_code(code) => PublishError::Fatal(error.to_string()),
        _ => PublishError::Transient(error.to_string()),
    }
}

/// Poll failures that need a configuration change: bad credentials, or a
/// missing topic the broker was told not to create.
pub(crate) fn classify_poll_error(error: &KafkaError) -> ConsumerError {
    match error.rdkafka_error_code() {
        Some(
            RDKafkaErrorCode::SaslAuthenticationFailed
            | RDKafkaErrorCode::Authentication
            | RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::GroupAuthorizationFailed
            | RDKafkaErrorCode::UnknownTopicOrPartition
            | RDKafkaErrorCode::UnknownTopic,
        ) => ConsumerError::Fatal(error.to_string()),
        _ => ConsumerError::Poll(error.to_string()),
    }
}

/// Whether a commit failed because the partition moved to another member.
pub(crate) fn is_rebalance_code(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::UnknownMemberId
            | RDKafkaErrorCode::IllegalGeneration
            | RDKafkaErrorCode::RebalanceInProgress
    )
}

pub(crate) fn classify_commit_error(error: &KafkaError, record: &Record) -> ConsumerError {
    match error.rdkafka_error_code() {
        Some(code) if is_rebalance_code(code) => ConsumerError::Revoked {
            topic: record.topic.clone(),
            partition: record.partition,
        },
        _ => ConsumerError::Commit(error.to_string()),
    }
}

// ============================================================================
// Broker
// ============================================================================

/// Kafka-backed broker.
pub struct KafkaBroker {
    config: KafkaBrokerConfig,
}

impl KafkaBroker {
    pub fn new(config: KafkaBrokerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &KafkaBrokerConfig {
        &self.config
    }
}

#[async_trait]
impl Broker for KafkaBroker {
    fn name(&self) -> &'static str {
        "kafka"
    }

    async fn producer(&self) -> std::result::Result<Arc<dyn BrokerProducer>, PublishError> {
        let producer: FutureProducer = self
            .config
            .build_producer_config()
            .create()
            .map_err(|e| PublishError::Fatal(format!("Failed to create Kafka producer: {}", e)))?;

        info!(
            bootstrap_servers = %self.config.bootstrap_servers,
            "Connected Kafka producer"
        );

        Ok(Arc::new(KafkaProducer {
            producer,
            queue_timeout: self.config.message_timeout,
        }))
    }

    async fn consumer(
        &self,
        group_id: &str,
    ) -> std::result::Result<Box<dyn BrokerConsumer>, ConsumerError> {
        let consumer: StreamConsumer = self
            .config
            .build_consumer_config(group_id)
            .create()
            .map_err(|e| {
                ConsumerError::Connection(format!("Failed to create Kafka consumer: {}", e))
            })?;

        Ok(Box::new(KafkaConsumer {
            consumer: Some(consumer),
            group_id: group_id.to_string(),
        }))
    }
}

// ============================================================================
// Producer
// ============================================================================

pub struct KafkaProducer {
    producer: FutureProducer,
    queue_timeout: Duration,
}

#[async_trait]
impl BrokerProducer for KafkaProducer {
    async fn send(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        payload: &[u8],
    ) -> std::result::Result<RecordMetadata, PublishError> {
        let mut record: FutureRecord<'_, [u8], [u8]> = FutureRecord::to(topic).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }

        let (partition, offset) = self
            .producer
            .send(record, self.queue_timeout)
            .await
            .map_err(|(e, _)| classify_publish_error(&e))?;

        debug!(topic = %topic, partition, offset, "Published record to Kafka");

        Ok(RecordMetadata {
            topic: topic.to_string(),
            partition,
            offset,
            timestamp: Utc::now(),
        })
    }

    async fn flush(&self, timeout: Duration) -> std::result::Result<(), PublishError> {
        let producer = self.producer.clone();
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| PublishError::Transient(format!("Flush task failed: {}", e)))?
            .map_err(|e| classify_publish_error(&e))
    }
}

// ============================================================================
// Consumer
// ============================================================================

pub struct KafkaConsumer {
    consumer: Option<StreamConsumer>,
    group_id: String,
}

impl KafkaConsumer {
    fn inner(&self) -> std::result::Result<&StreamConsumer, ConsumerError> {
        self.consumer
            .as_ref()
            .ok_or_else(|| ConsumerError::Connection("Consumer is closed".to_string()))
    }
}

fn to_record(message: &BorrowedMessage<'_>) -> Record {
    let timestamp = message
        .timestamp()
        .to_millis()
        .and_then(DateTime::from_timestamp_millis)
        .unwrap_or_else(Utc::now);
    Record {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(Bytes::copy_from_slice),
        payload: message
            .payload()
            .map(Bytes::copy_from_slice)
            .unwrap_or_default(),
        timestamp,
    }
}

#[async_trait]
impl BrokerConsumer for KafkaConsumer {
    async fn subscribe(&mut self, topic: &str) -> std::result::Result<(), ConsumerError> {
        self.inner()?
            .subscribe(&[topic])
            .map_err(|e| ConsumerError::Subscribe(format!("Failed to subscribe to {}: {}", topic, e)))?;
        info!(topic = %topic, group_id = %self.group_id, "Subscribed to Kafka topic");
        Ok(())
    }

    async fn poll(
        &mut self,
        timeout: Duration,
        max_records: usize,
    ) -> std::result::Result<Vec<Record>, ConsumerError> {
        let consumer = self.inner()?;

        let first = match tokio::time::timeout(timeout, consumer.recv()).await {
            Err(_) => return Ok(Vec::new()),
            Ok(Err(e)) => return Err(classify_poll_error(&e)),
            Ok(Ok(message)) => to_record(&message),
        };

        // Drain whatever is already buffered without waiting again.
        let mut records = vec![first];
        while records.len() < max_records {
            match consumer.recv().now_or_never() {
                Some(Ok(message)) => records.push(to_record(&message)),
                Some(Err(e)) => {
                    warn!(error = %e, "Kafka consumer error while draining buffer");
                    break;
                }
                None => break,
            }
        }
        Ok(records)
    }

    /// Synchronous commit of `offset + 1`. The broker keeps the highest
    /// committed value per group; nothing is cached on this side.
    async fn commit(&mut self, record: &Record) -> std::result::Result<(), ConsumerError> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(&record.topic, record.partition, Offset::Offset(record.offset + 1))
            .map_err(|e| ConsumerError::Commit(e.to_string()))?;

        let committed = self.inner()?.commit(&tpl, CommitMode::Sync);
        committed.map_err(|e| classify_commit_error(&e, record))
    }

    async fn seek(&mut self, position: &RecordPosition) -> std::result::Result<(), ConsumerError> {
        self.inner()?
            .seek(
                &position.topic,
                position.partition,
                Offset::Offset(position.offset),
                SEEK_TIMEOUT,
            )
            .map_err(|e| ConsumerError::Seek(format!("{}: {}", position, e)))
    }

    async fn close(&mut self) -> std::result::Result<(), ConsumerError> {
        if let Some(consumer) = self.consumer.take() {
            consumer.unsubscribe();
            debug!(group_id = %self.group_id, "Kafka consumer closed");
        }
        Ok(())
    }
}

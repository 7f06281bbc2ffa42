//! Broker connection configuration types.

use std::time::Duration;

use serde::Deserialize;

use crate::bus::OffsetReset;
use crate::bus::memory::{DEFAULT_MAX_MESSAGE_BYTES, DEFAULT_PARTITIONS};

/// Messaging type discriminator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagingType {
    /// In-process broker (no external dependencies).
    #[default]
    Memory,
    /// Apache Kafka (or any Kafka-compatible broker).
    Kafka,
}

/// Messaging configuration (discriminated union).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Messaging type discriminator.
    #[serde(rename = "type")]
    pub messaging_type: MessagingType,
    /// In-memory broker settings.
    pub memory: MemoryConfig,
    /// Kafka-specific configuration.
    pub kafka: KafkaConfig,
}

/// In-memory broker configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub default_partitions: u32,
    pub auto_create_topics: bool,
    pub max_message_bytes: usize,
    pub initial_offset: OffsetReset,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            default_partitions: DEFAULT_PARTITIONS,
            auto_create_topics: true,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            initial_offset: OffsetReset::Earliest,
        }
    }
}

/// Kafka-specific configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KafkaConfig {
    /// Kafka bootstrap servers (comma-separated).
    pub bootstrap_servers: String,
    /// Where a group with no committed offset starts reading.
    pub initial_offset: OffsetReset,
    /// SASL username for authentication.
    pub sasl_username: Option<String>,
    /// SASL password for authentication.
    pub sasl_password: Option<String>,
    /// SASL mechanism (PLAIN, SCRAM-SHA-256, SCRAM-SHA-512).
    pub sasl_mechanism: Option<String>,
    /// Security protocol (PLAINTEXT, SSL, SASL_PLAINTEXT, SASL_SSL).
    pub security_protocol: Option<String>,
    /// SSL CA certificate path.
    pub ssl_ca_location: Option<String>,
    /// Producer delivery timeout in milliseconds.
    pub message_timeout_ms: u64,
    /// Let the broker create topics on first use.
    pub auto_create_topics: bool,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            initial_offset: OffsetReset::Earliest,
            sasl_username: None,
            sasl_password: None,
            sasl_mechanism: None,
            security_protocol: None,
            ssl_ca_location: None,
            message_timeout_ms: 5000,
            auto_create_topics: true,
        }
    }
}

impl KafkaConfig {
    pub fn message_timeout(&self) -> Duration {
        Duration::from_millis(self.message_timeout_ms)
    }
}

//! Error taxonomy for broker operations.

use super::RecordPosition;

/// Errors returned to the publishing call site.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// Broker unreachable, timed out, or mid leader election. Safe to retry.
    #[error("Transient publish failure: {0}")]
    Transient(String),

    /// Retrying unchanged cannot succeed: payload too large, unknown topic,
    /// authentication failure.
    #[error("Fatal publish failure: {0}")]
    Fatal(String),

    #[error("Failed to serialize event: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Producer is shut down")]
    Closed,
}

impl PublishError {
    /// Whether the caller may retry the same publish.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Errors raised on the consume path.
#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Poll failed: {0}")]
    Poll(String),

    #[error("Commit failed: {0}")]
    Commit(String),

    #[error("Seek failed: {0}")]
    Seek(String),

    #[error("Partition {topic}[{partition}] is no longer assigned to this consumer")]
    Revoked { topic: String, partition: i32 },

    #[error("Unrecoverable broker error: {0}")]
    Fatal(String),

    #[error("Poison record at {position} halted the consumer: {reason}")]
    PoisonRecord {
        position: RecordPosition,
        reason: String,
    },

    #[error("Consumer did not stop within {0:?}")]
    ShutdownTimeout(std::time::Duration),

    #[error("Consumer task failed: {0}")]
    Task(String),
}

impl ConsumerError {
    /// Errors that end a consumer run instead of triggering backoff.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_) | Self::PoisonRecord { .. })
    }
}

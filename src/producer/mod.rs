//! Event producer.
//!
//! One `EventProducer` per process, shared behind an `Arc` by every request
//! handler that publishes. A publish returns once the broker has acknowledged
//! the record, or with a `PublishError` the caller classifies via
//! `is_transient()`.
//!
//! Retrying is a caller decision expressed through `RetryPolicy`: the
//! producer's default policy applies to `publish`, and `publish_with` takes
//! an explicit one. Only transient errors are retried.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::bus::{Broker, BrokerProducer, PublishError, RecordMetadata};
use crate::config::ProducerConfig;
use crate::events::DomainEvent;
use crate::utils::retry::publish_backoff;

/// How a publish reacts to transient broker errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    backoff: Option<ExponentialBuilder>,
}

impl RetryPolicy {
    /// Single attempt; every error goes straight back to the caller.
    pub fn none() -> Self {
        Self { backoff: None }
    }

    /// Retry transient errors on the given schedule.
    pub fn exponential(backoff: ExponentialBuilder) -> Self {
        Self {
            backoff: Some(backoff),
        }
    }

    /// Bounded jittered retries, see `publish_backoff()`.
    pub fn transient_default() -> Self {
        Self::exponential(publish_backoff())
    }

    pub fn retries(&self) -> bool {
        self.backoff.is_some()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::transient_default()
    }
}

/// Producer settings.
#[derive(Debug, Clone)]
pub struct ProducerSettings {
    /// Policy applied by `publish` / `publish_event`.
    pub retry: RetryPolicy,
    /// Upper bound on the flush performed by `shutdown`.
    pub flush_timeout: Duration,
}

impl Default for ProducerSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            flush_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&ProducerConfig> for ProducerSettings {
    fn from(config: &ProducerConfig) -> Self {
        let retry = if config.retry_enabled {
            RetryPolicy::exponential(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_millis(config.retry_min_delay_ms))
                    .with_max_delay(Duration::from_millis(config.retry_max_delay_ms))
                    .with_max_times(config.retry_max_attempts)
                    .with_jitter(),
            )
        } else {
            RetryPolicy::none()
        };
        Self {
            retry,
            flush_timeout: config.flush_timeout(),
        }
    }
}

/// Publishes serialized events to topics.
pub struct EventProducer {
    inner: Arc<dyn BrokerProducer>,
    settings: ProducerSettings,
    closed: AtomicBool,
}

impl EventProducer {
    pub fn new(inner: Arc<dyn BrokerProducer>, settings: ProducerSettings) -> Self {
        Self {
            inner,
            settings,
            closed: AtomicBool::new(false),
        }
    }

    /// Open a producer connection on `broker`.
    pub async fn connect(
        broker: &dyn Broker,
        settings: ProducerSettings,
    ) -> Result<Self, PublishError> {
        let inner = broker.producer().await?;
        info!(broker = broker.name(), "Event producer connected");
        Ok(Self::new(inner, settings))
    }

    pub fn settings(&self) -> &ProducerSettings {
        &self.settings
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Publish a serialized payload using the producer's default retry policy.
    pub async fn publish(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        payload: &[u8],
    ) -> Result<RecordMetadata, PublishError> {
        self.publish_with(topic, key, payload, &self.settings.retry)
            .await
    }

    /// Publish a serialized payload with an explicit retry policy.
    pub async fn publish_with(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        payload: &[u8],
        policy: &RetryPolicy,
    ) -> Result<RecordMetadata, PublishError> {
        if self.is_closed() {
            return Err(PublishError::Closed);
        }
        if topic.is_empty() {
            return Err(PublishError::Fatal("Topic name is empty".to_string()));
        }

        #[cfg(feature = "otel")]
        let start = std::time::Instant::now();

        let attempt = || self.inner.send(topic, key, payload);
        let result = match &policy.backoff {
            None => attempt().await,
            Some(backoff) => {
                attempt
                    .retry(backoff.clone())
                    .when(PublishError::is_transient)
                    .notify(|err: &PublishError, delay: Duration| {
                        warn!(
                            topic = %topic,
                            error = %err,
                            delay_ms = delay.as_millis() as u64,
                            "Transient publish failure, retrying"
                        );
                    })
                    .await
            }
        };

        #[cfg(feature = "otel")]
        {
            use crate::utils::metrics::{
                outcome_attr, topic_attr, PUBLISH_DURATION, PUBLISH_TOTAL,
            };
            let outcome = if result.is_ok() { "success" } else { "error" };
            PUBLISH_DURATION.record(start.elapsed().as_secs_f64(), &[topic_attr(topic)]);
            PUBLISH_TOTAL.add(1, &[topic_attr(topic), outcome_attr(outcome)]);
        }

        match &result {
            Ok(meta) => debug!(
                topic = %meta.topic,
                partition = meta.partition,
                offset = meta.offset,
                "Published record"
            ),
            Err(e) => warn!(topic = %topic, error = %e, "Publish failed"),
        }
        result
    }

    /// Serialize any value as JSON and publish it.
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        key: Option<&[u8]>,
        value: &T,
    ) -> Result<RecordMetadata, PublishError> {
        let payload = serde_json::to_vec(value)?;
        self.publish(topic, key, &payload).await
    }

    /// Publish a domain event to its topic, keyed by its partition key.
    pub async fn publish_event<E: DomainEvent>(
        &self,
        event: &E,
    ) -> Result<RecordMetadata, PublishError> {
        let payload = event.to_payload()?;
        let key = event.key();
        self.publish(E::TOPIC, Some(&key), &payload).await
    }

    /// Flush buffered records and refuse further publishes.
    ///
    /// Must complete before the process exits. Idempotent.
    pub async fn shutdown(&self) -> Result<(), PublishError> {
        self.shutdown_with_timeout(self.settings.flush_timeout)
            .await
    }

    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> Result<(), PublishError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(timeout_ms = timeout.as_millis() as u64, "Flushing event producer");
        self.inner.flush(timeout).await
    }
}

impl Drop for EventProducer {
    fn drop(&mut self) {
        if !self.is_closed() {
            warn!("Event producer dropped without shutdown; buffered records may be lost");
        }
    }
}

#[cfg(test)]
mod tests;

use std::sync::atomic::AtomicUsize;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::*;
use crate::bus::{InMemoryBroker, InMemoryConfig};
use crate::events::WorkoutLogged;

/// Counts calls and fails sends according to a script.
struct ScriptedProducer {
    sends: AtomicUsize,
    flushes: AtomicUsize,
    script: std::sync::Mutex<Vec<PublishError>>,
}

impl ScriptedProducer {
    fn new(mut failures: Vec<PublishError>) -> Arc<Self> {
        failures.reverse();
        Arc::new(Self {
            sends: AtomicUsize::new(0),
            flushes: AtomicUsize::new(0),
            script: std::sync::Mutex::new(failures),
        })
    }
}

#[async_trait]
impl BrokerProducer for ScriptedProducer {
    async fn send(
        &self,
        topic: &str,
        _key: Option<&[u8]>,
        _payload: &[u8],
    ) -> Result<RecordMetadata, PublishError> {
        let n = self.sends.fetch_add(1, Ordering::SeqCst);
        if let Some(err) = self.script.lock().unwrap().pop() {
            return Err(err);
        }
        Ok(RecordMetadata {
            topic: topic.to_string(),
            partition: 0,
            offset: n as i64,
            timestamp: Utc::now(),
        })
    }

    async fn flush(&self, _timeout: Duration) -> Result<(), PublishError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn quick_retries(times: usize) -> RetryPolicy {
    RetryPolicy::exponential(
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(50))
            .with_max_times(times),
    )
}

fn producer(inner: Arc<ScriptedProducer>, retry: RetryPolicy) -> EventProducer {
    EventProducer::new(
        inner,
        ProducerSettings {
            retry,
            ..Default::default()
        },
    )
}

#[tokio::test]
async fn test_publish_returns_broker_metadata() {
    let broker = InMemoryBroker::new(InMemoryConfig::default().with_partitions(1));
    let producer = EventProducer::connect(&broker, ProducerSettings::default())
        .await
        .unwrap();

    let meta = producer
        .publish("workout", None, br#"{"DurationMinutes":45}"#)
        .await
        .unwrap();
    assert_eq!(meta.topic, "workout");
    assert_eq!(meta.offset, 0);
    assert_eq!(broker.records("workout", 0).len(), 1);

    producer.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_transient_errors_are_retried() {
    let inner = ScriptedProducer::new(vec![
        PublishError::Transient("leader election".into()),
        PublishError::Transient("timeout".into()),
    ]);
    let producer = producer(inner.clone(), quick_retries(3));

    let meta = producer.publish("progress", None, b"{}").await.unwrap();
    assert_eq!(meta.offset, 2);
    assert_eq!(inner.sends.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn test_fatal_errors_are_not_retried() {
    let inner = ScriptedProducer::new(vec![PublishError::Fatal("message too large".into())]);
    let producer = producer(inner.clone(), quick_retries(3));

    let err = producer.publish("progress", None, b"{}").await.unwrap_err();
    assert!(matches!(err, PublishError::Fatal(_)));
    assert_eq!(inner.sends.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_retries_are_bounded() {
    let failures = (0..10)
        .map(|_| PublishError::Transient("unreachable".into()))
        .collect();
    let inner = ScriptedProducer::new(failures);
    let producer = producer(inner.clone(), quick_retries(2));

    let err = producer.publish("workout", None, b"{}").await.unwrap_err();
    assert!(err.is_transient());
    assert_eq!(inner.sends.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_no_retry_policy_surfaces_first_error() {
    let inner = ScriptedProducer::new(vec![PublishError::Transient("timeout".into())]);
    let producer = producer(inner.clone(), quick_retries(5));

    let err = producer
        .publish_with("workout", None, b"{}", &RetryPolicy::none())
        .await
        .unwrap_err();
    assert!(err.is_transient());
    assert_eq!(inner.sends.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_empty_topic_is_fatal() {
    let inner = ScriptedProducer::new(vec![]);
    let producer = producer(inner.clone(), RetryPolicy::none());

    let err = producer.publish("", None, b"{}").await.unwrap_err();
    assert!(matches!(err, PublishError::Fatal(_)));
    assert_eq!(inner.sends.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_shutdown_flushes_once_and_closes() {
    let inner = ScriptedProducer::new(vec![]);
    let producer = producer(inner.clone(), RetryPolicy::none());

    producer.shutdown().await.unwrap();
    producer.shutdown().await.unwrap();
    assert_eq!(inner.flushes.load(Ordering::SeqCst), 1);
    assert!(producer.is_closed());

    let err = producer.publish("workout", None, b"{}").await.unwrap_err();
    assert!(matches!(err, PublishError::Closed));
}

#[tokio::test]
async fn test_publish_event_keys_by_user() {
    let broker = InMemoryBroker::new(InMemoryConfig::default().with_partitions(4));
    let producer = EventProducer::connect(&broker, ProducerSettings::default())
        .await
        .unwrap();
    let user = Uuid::new_v4();
    let started_at: DateTime<chrono::FixedOffset> =
        DateTime::parse_from_rfc3339("2024-03-01T07:30:00Z").unwrap();

    let first = producer
        .publish_event(&WorkoutLogged {
            user_id: user,
            started_at,
            duration_minutes: 45,
        })
        .await
        .unwrap();
    let second = producer
        .publish_event(&WorkoutLogged {
            user_id: user,
            started_at,
            duration_minutes: 30,
        })
        .await
        .unwrap();

    assert_eq!(first.topic, "workout");
    assert_eq!(first.partition, second.partition);
    let stored = broker.records("workout", first.partition);
    assert_eq!(
        stored[0].key.as_deref(),
        Some(user.to_string().as_bytes())
    );
    assert_eq!(
        WorkoutLogged::from_payload(&stored[1].payload)
            .unwrap()
            .duration_minutes,
        30
    );

    producer.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_publish_json_serializes_value() {
    let broker = InMemoryBroker::new(InMemoryConfig::default().with_partitions(1));
    let producer = EventProducer::connect(&broker, ProducerSettings::default())
        .await
        .unwrap();

    producer
        .publish_json("managment", None, &serde_json::json!({"Email": "a@b.c"}))
        .await
        .unwrap();
    let stored = broker.records("managment", 0);
    assert_eq!(stored[0].payload_str().unwrap(), r#"{"Email":"a@b.c"}"#);

    producer.shutdown().await.unwrap();
}

#[test]
fn test_settings_from_config() {
    let config = ProducerConfig {
        retry_enabled: false,
        flush_timeout_ms: 250,
        ..Default::default()
    };
    let settings = ProducerSettings::from(&config);
    assert!(!settings.retry.retries());
    assert_eq!(settings.flush_timeout, Duration::from_millis(250));

    assert!(ProducerSettings::from(&ProducerConfig::default())
        .retry
        .retries());
}

//! Shared helpers for consumer loop integration tests.
//!
//! Provides a recording handler with scripted failures and small wrappers
//! around the in-memory broker.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::time::Instant;

use fitcoach_bus::bus::{Broker, InMemoryBroker, InMemoryConfig, Record, RecordPosition};
use fitcoach_bus::consumer::{ConsumerSettings, HandlerError, RecordHandler};
use fitcoach_bus::producer::{EventProducer, ProducerSettings};
use fitcoach_bus::utils::retry::RetryConfig;

/// One handler invocation.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub record: Arc<Record>,
    pub at: Instant,
    pub succeeded: bool,
}

#[derive(Default)]
struct RecorderState {
    deliveries: Vec<Delivery>,
    /// Remaining failures per position.
    failures: HashMap<RecordPosition, u32>,
    /// Positions that always fail as poison.
    poison: Vec<RecordPosition>,
}

/// Handler that records every delivery and fails on a script.
#[derive(Clone, Default)]
pub struct Recorder {
    shared: Arc<Mutex<RecorderState>>,
    delay: Option<Duration>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every invocation sleeps `delay` before completing.
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Default::default()
        }
    }

    /// Fail the record at `position` the next `times` deliveries.
    pub fn fail(&self, position: RecordPosition, times: u32) {
        self.shared.lock().unwrap().failures.insert(position, times);
    }

    /// Stop failing `position`.
    pub fn heal(&self, position: &RecordPosition) {
        self.shared.lock().unwrap().failures.remove(position);
    }

    /// Always reject `position` as poison.
    pub fn poison(&self, position: RecordPosition) {
        self.shared.lock().unwrap().poison.push(position);
    }

    pub fn deliveries(&self) -> Vec<Delivery> {
        self.shared.lock().unwrap().deliveries.clone()
    }

    pub fn deliveries_of(&self, position: &RecordPosition) -> Vec<Delivery> {
        self.deliveries()
            .into_iter()
            .filter(|d| d.record.position() == *position)
            .collect()
    }

    /// Records whose handler call succeeded, in completion order.
    pub fn succeeded(&self) -> Vec<Arc<Record>> {
        self.deliveries()
            .into_iter()
            .filter(|d| d.succeeded)
            .map(|d| d.record)
            .collect()
    }

    pub fn as_handler(&self) -> Arc<dyn RecordHandler> {
        Arc::new(self.clone())
    }
}

impl RecordHandler for Recorder {
    fn handle(&self, record: Arc<Record>) -> BoxFuture<'static, Result<(), HandlerError>> {
        let shared = Arc::clone(&self.shared);
        let delay = self.delay;
        Box::pin(async move {
            let at = Instant::now();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let mut state = shared.lock().unwrap();
            let position = record.position();
            let result = if state.poison.contains(&position) {
                Err(HandlerError::poison("rejected"))
            } else {
                match state.failures.get_mut(&position) {
                    Some(remaining) if *remaining > 0 => {
                        *remaining -= 1;
                        Err(HandlerError::retryable("scripted failure"))
                    }
                    _ => Ok(()),
                }
            };
            state.deliveries.push(Delivery {
                record,
                at,
                succeeded: result.is_ok(),
            });
            result
        })
    }
}

pub fn position(topic: &str, partition: i32, offset: i64) -> RecordPosition {
    RecordPosition {
        topic: topic.to_string(),
        partition,
        offset,
    }
}

pub fn single_partition_broker() -> InMemoryBroker {
    InMemoryBroker::new(InMemoryConfig::default().with_partitions(1))
}

pub fn as_broker(broker: &InMemoryBroker) -> Arc<dyn Broker> {
    Arc::new(broker.clone())
}

/// Settings with short intervals for real-time tests.
pub fn fast_settings() -> ConsumerSettings {
    ConsumerSettings {
        poll_interval: Duration::from_millis(20),
        grace_period: Duration::from_millis(500),
        backoff: RetryConfig::new(Duration::from_millis(5), Duration::from_millis(40)),
        ..Default::default()
    }
}

pub async fn producer(broker: &InMemoryBroker) -> EventProducer {
    EventProducer::connect(broker, ProducerSettings::default())
        .await
        .unwrap()
}

/// Poll `check` until it holds, failing the test after `timeout`.
pub async fn eventually<F>(timeout: Duration, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while !check() {
        assert!(Instant::now() < deadline, "condition not met within {:?}", timeout);
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

//! Consumer loop.
//!
//! One `ConsumerLoop` reads one topic under one consumer group and hands
//! each record to a `RecordHandler`, committing only after the handler
//! succeeds. Delivery is at-least-once.
//!
//! ```text
//! Starting -> Polling -> Dispatching -> Polling ...
//!               |            |
//!               |            +-> ErrorBackoff -> Polling   (handler failed, no commit)
//!               +-> ErrorBackoff -> Polling                (poll error)
//!  cancel  ->  Draining -> Stopped
//! ```
//!
//! Records are dispatched one at a time in offset order. When a handler
//! fails, every partition with undispatched records is rewound to its first
//! undispatched offset so the failed record is delivered again after backoff.
//!
//! Cancellation is cooperative: it is observed at every poll and between
//! records. A record already handed to the handler is allowed to finish for
//! up to `grace_period`; if it does not, it is abandoned uncommitted.

mod handler;
mod policy;

pub use handler::{HandlerError, JsonHandler, RecordHandler};
pub use policy::{PoisonAction, PoisonPolicy};

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{Broker, BrokerConsumer, ConsumerError, Record, RecordPosition};
use crate::config::ConsumerConfig;
use crate::dlq::DeadLetterSink;
use crate::utils::retry::RetryConfig;

/// Lifecycle state of a consumer loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConsumerState {
    Starting,
    Polling,
    Dispatching,
    ErrorBackoff,
    Draining,
    Stopped,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerState::Starting => "starting",
            ConsumerState::Polling => "polling",
            ConsumerState::Dispatching => "dispatching",
            ConsumerState::ErrorBackoff => "error_backoff",
            ConsumerState::Draining => "draining",
            ConsumerState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Consumer loop settings.
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    /// Longest a single poll waits for records.
    pub poll_interval: Duration,
    /// Longest an in-flight record may run after cancellation.
    pub grace_period: Duration,
    /// ErrorBackoff schedule, indexed by consecutive failures.
    pub backoff: RetryConfig,
    pub poison: PoisonPolicy,
    pub max_poll_records: usize,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            grace_period: Duration::from_secs(10),
            backoff: RetryConfig::default(),
            poison: PoisonPolicy::default(),
            max_poll_records: 100,
        }
    }
}

impl From<&ConsumerConfig> for ConsumerSettings {
    fn from(config: &ConsumerConfig) -> Self {
        Self {
            poll_interval: config.poll_interval(),
            grace_period: config.grace_period(),
            backoff: RetryConfig::new(
                Duration::from_millis(config.backoff_base_ms),
                Duration::from_millis(config.backoff_max_ms),
            )
            .with_jitter(config.backoff_jitter),
            poison: config.poison,
            max_poll_records: config.max_poll_records.max(1),
        }
    }
}

/// Counters for one consumer loop.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    polled: AtomicU64,
    delivered: AtomicU64,
    committed: AtomicU64,
    failed: AtomicU64,
    skipped: AtomicU64,
    dead_lettered: AtomicU64,
    backoffs: AtomicU64,
    poll_errors: AtomicU64,
}

/// Point-in-time copy of `ConsumerStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStatsSnapshot {
    /// Records returned by polls.
    pub polled: u64,
    /// Handler invocations.
    pub delivered: u64,
    pub committed: u64,
    /// Handler failures (retryable or poison).
    pub failed: u64,
    /// Poison records committed past without processing.
    pub skipped: u64,
    pub dead_lettered: u64,
    pub backoffs: u64,
    pub poll_errors: u64,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> ConsumerStatsSnapshot {
        ConsumerStatsSnapshot {
            polled: self.polled.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            backoffs: self.backoffs.load(Ordering::Relaxed),
            poll_errors: self.poll_errors.load(Ordering::Relaxed),
        }
    }

    fn incr(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// How a dispatched batch ended.
enum BatchOutcome {
    Completed,
    /// A record failed; positions were rewound to it.
    Failed,
    Cancelled,
}

/// Where one loop run is reading.
struct Subscription<'a> {
    topic: &'a str,
    group_id: &'a str,
}

/// Background worker bound to one topic and consumer group.
pub struct ConsumerLoop {
    broker: Arc<dyn Broker>,
    settings: ConsumerSettings,
    dead_letter: Option<Arc<dyn DeadLetterSink>>,
    state: watch::Sender<ConsumerState>,
    stats: Arc<ConsumerStats>,
}

impl ConsumerLoop {
    pub fn new(broker: Arc<dyn Broker>, settings: ConsumerSettings) -> Self {
        let (state, _) = watch::channel(ConsumerState::Starting);
        Self {
            broker,
            settings,
            dead_letter: None,
            state,
            stats: Arc::new(ConsumerStats::default()),
        }
    }

    /// Sink for records the `DeadLetter` poison policy gives up on.
    pub fn with_dead_letter(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter = Some(sink);
        self
    }

    pub fn settings(&self) -> &ConsumerSettings {
        &self.settings
    }

    /// Watch the loop's state transitions.
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    pub fn stats(&self) -> Arc<ConsumerStats> {
        Arc::clone(&self.stats)
    }

    fn set_state(&self, next: ConsumerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = %previous, to = %next, "Consumer state transition");
        }
    }

    /// Run until `cancel` fires or an unrecoverable error occurs.
    ///
    /// Always ends in `Stopped` with the broker connection closed and group
    /// membership released.
    pub async fn run(
        &self,
        cancel: CancellationToken,
        topic: &str,
        group_id: &str,
        handler: Arc<dyn RecordHandler>,
    ) -> Result<(), ConsumerError> {
        let sub = Subscription { topic, group_id };
        self.set_state(ConsumerState::Starting);
        info!(
            topic = %topic,
            group_id = %group_id,
            broker = self.broker.name(),
            "Starting consumer"
        );

        if self.settings.poison.needs_dead_letter_sink() && self.dead_letter.is_none() {
            warn!(
                topic = %topic,
                group_id = %group_id,
                "Dead-letter policy configured without a sink; poison records will be skipped"
            );
        }

        let mut consumer = match self.start(&cancel, &sub).await {
            Ok(Some(consumer)) => consumer,
            Ok(None) => {
                self.set_state(ConsumerState::Stopped);
                info!(topic = %topic, group_id = %group_id, "Consumer cancelled before start");
                return Ok(());
            }
            Err(e) => {
                self.set_state(ConsumerState::Stopped);
                error!(topic = %topic, group_id = %group_id, error = %e, "Consumer failed to start");
                return Err(e);
            }
        };

        let result = self
            .drive(consumer.as_mut(), &cancel, &sub, handler.as_ref())
            .await;

        self.set_state(ConsumerState::Draining);
        if let Err(e) = consumer.close().await {
            warn!(topic = %topic, group_id = %group_id, error = %e, "Failed to close consumer");
        }
        self.set_state(ConsumerState::Stopped);

        match &result {
            Ok(()) => info!(topic = %topic, group_id = %group_id, "Consumer stopped"),
            Err(e) => error!(topic = %topic, group_id = %group_id, error = %e, "Consumer halted"),
        }
        result
    }

    /// Spawn the loop as a background task.
    ///
    /// The task stops when `cancel` (or the returned handle) is cancelled.
    pub fn spawn(
        self,
        cancel: &CancellationToken,
        topic: impl Into<String>,
        group_id: impl Into<String>,
        handler: Arc<dyn RecordHandler>,
    ) -> ConsumerHandle {
        let topic = topic.into();
        let group_id = group_id.into();
        let token = cancel.child_token();
        let state = self.state();
        let stats = self.stats();
        let stop_timeout = self.settings.grace_period + self.settings.poll_interval;

        let task_token = token.clone();
        let task = tokio::spawn(async move {
            self.run(task_token, &topic, &group_id, handler).await
        });

        ConsumerHandle {
            cancel: token,
            task,
            state,
            stats,
            stop_timeout,
        }
    }

    /// Connect and subscribe. Connection errors are retried with backoff;
    /// anything else is a configuration problem and returned.
    async fn start(
        &self,
        cancel: &CancellationToken,
        sub: &Subscription<'_>,
    ) -> Result<Option<Box<dyn BrokerConsumer>>, ConsumerError> {
        let mut failures = 0u32;
        loop {
            if cancel.is_cancelled() {
                return Ok(None);
            }
            let attempt = async {
                let mut consumer = self.broker.consumer(sub.group_id).await?;
                consumer.subscribe(sub.topic).await?;
                Ok::<_, ConsumerError>(consumer)
            };
            match attempt.await {
                Ok(consumer) => {
                    info!(topic = %sub.topic, group_id = %sub.group_id, "Subscribed");
                    return Ok(Some(consumer));
                }
                Err(ConsumerError::Connection(reason)) => {
                    warn!(
                        topic = %sub.topic,
                        group_id = %sub.group_id,
                        error = %reason,
                        "Broker connection failed"
                    );
                    if !self.backoff(cancel, &mut failures).await {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn drive(
        &self,
        consumer: &mut dyn BrokerConsumer,
        cancel: &CancellationToken,
        sub: &Subscription<'_>,
        handler: &dyn RecordHandler,
    ) -> Result<(), ConsumerError> {
        let mut failures = 0u32;
        let mut attempts: HashMap<RecordPosition, u32> = HashMap::new();

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            self.set_state(ConsumerState::Polling);

            let polled = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(()),
                polled = consumer.poll(self.settings.poll_interval, self.settings.max_poll_records) => polled,
            };

            let records = match polled {
                Ok(records) => records,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    ConsumerStats::incr(&self.stats.poll_errors, 1);
                    warn!(topic = %sub.topic, group_id = %sub.group_id, error = %e, "Poll failed");
                    if !self.backoff(cancel, &mut failures).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            if records.is_empty() {
                continue;
            }
            ConsumerStats::incr(&self.stats.polled, records.len() as u64);

            self.set_state(ConsumerState::Dispatching);
            match self
                .dispatch(consumer, cancel, sub, handler, records, &mut attempts)
                .await?
            {
                BatchOutcome::Completed => failures = 0,
                BatchOutcome::Failed => {
                    if !self.backoff(cancel, &mut failures).await {
                        return Ok(());
                    }
                }
                BatchOutcome::Cancelled => return Ok(()),
            }
        }
    }

    async fn dispatch(
        &self,
        consumer: &mut dyn BrokerConsumer,
        cancel: &CancellationToken,
        sub: &Subscription<'_>,
        handler: &dyn RecordHandler,
        records: Vec<Record>,
        attempts: &mut HashMap<RecordPosition, u32>,
    ) -> Result<BatchOutcome, ConsumerError> {
        let records: Vec<Arc<Record>> = records.into_iter().map(Arc::new).collect();

        for index in 0..records.len() {
            // Undispatched records stay uncommitted and are redelivered
            // to whoever owns the partition next.
            if cancel.is_cancelled() {
                return Ok(BatchOutcome::Cancelled);
            }

            let record = &records[index];
            let position = record.position();
            let attempt = {
                let count = attempts.entry(position.clone()).or_insert(0);
                *count += 1;
                *count
            };

            ConsumerStats::incr(&self.stats.delivered, 1);
            #[cfg(feature = "otel")]
            {
                use crate::utils::metrics::{group_attr, topic_attr, CONSUMER_DELIVERED_TOTAL};
                CONSUMER_DELIVERED_TOTAL
                    .add(1, &[topic_attr(sub.topic), group_attr(sub.group_id)]);
            }
            debug!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                attempt,
                "Dispatching record"
            );

            let Some(result) = self.invoke(handler, record, cancel).await else {
                return Ok(BatchOutcome::Cancelled);
            };

            let err = match result {
                Ok(()) => {
                    attempts.remove(&position);
                    self.commit(consumer, record, sub, attempts).await?;
                    continue;
                }
                Err(err) => err,
            };

            ConsumerStats::incr(&self.stats.failed, 1);
            #[cfg(feature = "otel")]
            {
                use crate::utils::metrics::{outcome_attr, topic_attr, CONSUMER_FAILED_TOTAL};
                let kind = if err.is_poison() { "poison" } else { "retryable" };
                CONSUMER_FAILED_TOTAL.add(1, &[topic_attr(sub.topic), outcome_attr(kind)]);
            }

            if !err.is_poison() {
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    group_id = %sub.group_id,
                    attempt,
                    error = %err,
                    "Handler failed, record will be redelivered"
                );
                self.rewind(consumer, &records[index..]).await;
                return Ok(BatchOutcome::Failed);
            }

            let action = self.settings.poison.resolve(attempt);
            let sink = match action {
                PoisonAction::DeadLetter => self.dead_letter.as_ref(),
                _ => None,
            };
            match (action, sink) {
                (PoisonAction::Retry, _) => {
                    warn!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        attempt,
                        max_attempts = self.settings.poison.max_attempts(),
                        error = %err,
                        "Poison record, retrying"
                    );
                    self.rewind(consumer, &records[index..]).await;
                    return Ok(BatchOutcome::Failed);
                }
                (PoisonAction::Halt, _) => {
                    error!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        attempt,
                        error = %err,
                        "Poison record, halting consumer"
                    );
                    return Err(ConsumerError::PoisonRecord {
                        position,
                        reason: err.to_string(),
                    });
                }
                (PoisonAction::DeadLetter, Some(sink)) => {
                    if let Err(e) = sink.forward(record, &err.to_string(), attempt).await {
                        error!(
                            topic = %record.topic,
                            partition = record.partition,
                            offset = record.offset,
                            error = %e,
                            "Dead-letter forward failed, record will be redelivered"
                        );
                        self.rewind(consumer, &records[index..]).await;
                        return Ok(BatchOutcome::Failed);
                    }
                    ConsumerStats::incr(&self.stats.dead_lettered, 1);
                    self.record_poison_resolved(sub, "dead_letter");
                    warn!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        attempt,
                        error = %err,
                        "Poison record dead-lettered"
                    );
                }
                (PoisonAction::Skip, _) | (PoisonAction::DeadLetter, None) => {
                    ConsumerStats::incr(&self.stats.skipped, 1);
                    self.record_poison_resolved(sub, "skip");
                    warn!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        key = ?record.key_display(),
                        attempt,
                        error = %err,
                        "Skipping poison record"
                    );
                }
            }

            attempts.remove(&position);
            self.commit(consumer, record, sub, attempts).await?;
        }

        Ok(BatchOutcome::Completed)
    }

    /// Run the handler. Returns `None` when the record was abandoned after
    /// cancellation because it outlived the grace period.
    async fn invoke(
        &self,
        handler: &dyn RecordHandler,
        record: &Arc<Record>,
        cancel: &CancellationToken,
    ) -> Option<Result<(), HandlerError>> {
        // A panicking handler is treated as a poison verdict on the record.
        let in_flight = match panic::catch_unwind(AssertUnwindSafe(|| {
            handler.handle(Arc::clone(record))
        })) {
            Ok(in_flight) => in_flight,
            Err(payload) => return Some(Err(handler_panicked(record, payload))),
        };
        let mut in_flight = AssertUnwindSafe(in_flight).catch_unwind();

        tokio::select! {
            biased;
            result = &mut in_flight => {
                return Some(result.unwrap_or_else(|payload| Err(handler_panicked(record, payload))));
            }
            _ = cancel.cancelled() => {}
        }

        self.set_state(ConsumerState::Draining);
        info!(
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            grace_ms = self.settings.grace_period.as_millis() as u64,
            "Cancelled during dispatch, waiting for in-flight record"
        );

        match tokio::time::timeout(self.settings.grace_period, in_flight).await {
            Ok(result) => {
                Some(result.unwrap_or_else(|payload| Err(handler_panicked(record, payload))))
            }
            Err(_) => {
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    "In-flight record exceeded grace period, abandoned without commit"
                );
                None
            }
        }
    }

    async fn commit(
        &self,
        consumer: &mut dyn BrokerConsumer,
        record: &Record,
        sub: &Subscription<'_>,
        attempts: &mut HashMap<RecordPosition, u32>,
    ) -> Result<(), ConsumerError> {
        match consumer.commit(record).await {
            Ok(()) => {
                ConsumerStats::incr(&self.stats.committed, 1);
                Ok(())
            }
            Err(ConsumerError::Revoked { topic, partition }) => {
                // The new owner resumes from the last committed offset.
                warn!(
                    topic = %topic,
                    partition,
                    offset = record.offset,
                    group_id = %sub.group_id,
                    "Partition revoked before commit"
                );
                forget_partition(attempts, &topic, partition);
                Ok(())
            }
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!(
                    topic = %record.topic,
                    partition = record.partition,
                    offset = record.offset,
                    error = %e,
                    "Commit failed, record may be redelivered"
                );
                Ok(())
            }
        }
    }

    /// Seek each partition in `pending` back to its first record.
    async fn rewind(&self, consumer: &mut dyn BrokerConsumer, pending: &[Arc<Record>]) {
        let mut first: BTreeMap<i32, RecordPosition> = BTreeMap::new();
        for record in pending {
            first
                .entry(record.partition)
                .or_insert_with(|| record.position());
        }
        for position in first.values() {
            if let Err(e) = consumer.seek(position).await {
                warn!(position = %position, error = %e, "Seek failed");
            }
        }
    }

    /// Wait out the next backoff delay. Returns false if cancelled meanwhile.
    async fn backoff(&self, cancel: &CancellationToken, failures: &mut u32) -> bool {
        let delay = self.settings.backoff.delay_for_attempt(*failures);
        *failures = failures.saturating_add(1);
        ConsumerStats::incr(&self.stats.backoffs, 1);
        self.set_state(ConsumerState::ErrorBackoff);
        warn!(
            delay_ms = delay.as_millis() as u64,
            consecutive_failures = *failures,
            "Backing off"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    #[allow(unused_variables)]
    fn record_poison_resolved(&self, sub: &Subscription<'_>, outcome: &'static str) {
        #[cfg(feature = "otel")]
        {
            use crate::utils::metrics::{outcome_attr, topic_attr, CONSUMER_POISON_TOTAL};
            CONSUMER_POISON_TOTAL.add(1, &[topic_attr(sub.topic), outcome_attr(outcome)]);
        }
    }
}

/// Drop attempt counters for a partition this member no longer owns.
fn forget_partition(attempts: &mut HashMap<RecordPosition, u32>, topic: &str, partition: i32) {
    attempts.retain(|position, _| position.topic != topic || position.partition != partition);
}

fn handler_panicked(record: &Record, payload: Box<dyn Any + Send>) -> HandlerError {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string());
    error!(
        topic = %record.topic,
        partition = record.partition,
        offset = record.offset,
        panic = %message,
        "Handler panicked"
    );
    HandlerError::poison(format!("handler panicked: {}", message))
}

/// Handle to a spawned consumer loop.
pub struct ConsumerHandle {
    cancel: CancellationToken,
    task: JoinHandle<Result<(), ConsumerError>>,
    state: watch::Receiver<ConsumerState>,
    stats: Arc<ConsumerStats>,
    stop_timeout: Duration,
}

impl ConsumerHandle {
    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Wait until the loop reaches `target`, or stops first.
    pub async fn wait_for_state(&mut self, target: ConsumerState) -> ConsumerState {
        match self
            .state
            .wait_for(|s| *s == target || *s == ConsumerState::Stopped)
            .await
        {
            Ok(state) => *state,
            Err(_) => ConsumerState::Stopped,
        }
    }

    pub fn stats(&self) -> ConsumerStatsSnapshot {
        self.stats.snapshot()
    }

    /// Signal the loop to drain without waiting.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel and wait for `Stopped`. Aborts the task if it outlives the
    /// grace period plus one poll interval.
    pub async fn shutdown(self) -> Result<(), ConsumerError> {
        self.cancel.cancel();
        let mut task = self.task;
        match tokio::time::timeout(self.stop_timeout, &mut task).await {
            Ok(joined) => joined.map_err(|e| ConsumerError::Task(e.to_string()))?,
            Err(_) => {
                task.abort();
                warn!(
                    timeout_ms = self.stop_timeout.as_millis() as u64,
                    "Consumer did not stop in time, aborted"
                );
                Err(ConsumerError::ShutdownTimeout(self.stop_timeout))
            }
        }
    }

    /// Wait for the loop to end on its own (cancellation or fatal error).
    pub async fn join(self) -> Result<(), ConsumerError> {
        self.task
            .await
            .map_err(|e| ConsumerError::Task(e.to_string()))?
    }
}

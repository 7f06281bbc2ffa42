//! fitcoach-listen: hosted event consumer
//!
//! Runs one consumer loop per subscription and logs every decoded event.
//! Records are committed only after they are logged; a stop signal drains
//! in-flight work within the configured grace period.
//!
//! ## Architecture
//! ```text
//! [broker topic] --(poll)--> [ConsumerLoop] --(decode)--> [handler] --> log
//!                                  |
//!                                  +--(commit after success)--> [broker]
//! ```
//!
//! ## Configuration
//! - FITCOACH_CONFIG / --config: YAML configuration file
//! - FITCOACH_SERVICE: service profile used when no subscriptions are listed
//!   (fitcoach-workout, fitcoach-progress, fitcoach-user, msboilerplate)
//! - FITCOACH_LOG: tracing filter (default: info)

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use fitcoach_bus::bus::{init_broker, Record};
use fitcoach_bus::config::{Config, SERVICE_ENV_VAR};
use fitcoach_bus::consumer::{
    ConsumerHandle, ConsumerLoop, ConsumerSettings, HandlerError, JsonHandler, RecordHandler,
};
use fitcoach_bus::dlq::ProducerDeadLetterSink;
use fitcoach_bus::events::{topics, ProgressUpdated, UserCreated, WorkoutLogged};
use fitcoach_bus::producer::{EventProducer, ProducerSettings};
use fitcoach_bus::utils::bootstrap::{init_tracing, parse_config_path, shutdown_signal};

/// How often to check whether every consumer loop has ended on its own.
const LIVENESS_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Handler for a topic: typed decoding for known topics, raw logging otherwise.
fn handler_for(topic: &str) -> Arc<dyn RecordHandler> {
    match topic {
        topics::WORKOUT => Arc::new(JsonHandler::new(
            |event: WorkoutLogged, record: Arc<Record>| async move {
                info!(
                    position = %record.position(),
                    user_id = %event.user_id,
                    started_at = %event.started_at,
                    duration_minutes = event.duration_minutes,
                    "Workout logged"
                );
                Ok::<(), HandlerError>(())
            },
        )),
        topics::PROGRESS => Arc::new(JsonHandler::new(
            |event: ProgressUpdated, record: Arc<Record>| async move {
                info!(
                    position = %record.position(),
                    user_id = %event.user_id,
                    timestamp = %event.timestamp,
                    score = event.score,
                    "Progress updated"
                );
                Ok::<(), HandlerError>(())
            },
        )),
        topics::MANAGEMENT => Arc::new(JsonHandler::new(
            |event: UserCreated, record: Arc<Record>| async move {
                info!(
                    position = %record.position(),
                    user_id = %event.user_id,
                    email = %event.email,
                    "User created"
                );
                Ok::<(), HandlerError>(())
            },
        )),
        _ => Arc::new(|record: Arc<Record>| async move {
            info!(
                position = %record.position(),
                key = ?record.key_display(),
                payload = %String::from_utf8_lossy(&record.payload),
                "Record received"
            );
            Ok::<(), HandlerError>(())
        }),
    }
}

async fn all_stopped(handles: &[ConsumerHandle]) {
    loop {
        if handles.iter().all(ConsumerHandle::is_finished) {
            return;
        }
        tokio::time::sleep(LIVENESS_CHECK_INTERVAL).await;
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let config = Config::load(parse_config_path().as_deref())?;
    let service = std::env::var(SERVICE_ENV_VAR).ok();
    let subscriptions = config.resolve_subscriptions(service.as_deref())?;

    let broker = init_broker(&config.messaging).await?;
    let settings = ConsumerSettings::from(&config.consumer);

    // Only the dead-letter policy needs a producer in a listening process.
    let dlq_producer = if settings.poison.needs_dead_letter_sink() {
        let producer =
            EventProducer::connect(broker.as_ref(), ProducerSettings::from(&config.producer))
                .await?;
        Some(Arc::new(producer))
    } else {
        None
    };

    let root = CancellationToken::new();
    let mut handles = Vec::with_capacity(subscriptions.len());
    for sub in &subscriptions {
        let mut consumer = ConsumerLoop::new(Arc::clone(&broker), settings.clone());
        if let Some(producer) = &dlq_producer {
            consumer = consumer
                .with_dead_letter(Arc::new(ProducerDeadLetterSink::new(Arc::clone(producer))));
        }
        handles.push(consumer.spawn(
            &root,
            sub.topic.clone(),
            sub.group_id.clone(),
            handler_for(&sub.topic),
        ));
    }

    info!(
        broker = broker.name(),
        subscriptions = subscriptions.len(),
        "fitcoach-listen started"
    );

    tokio::select! {
        _ = shutdown_signal() => info!("Shutdown signal received"),
        _ = all_stopped(&handles) => warn!("All consumer loops stopped"),
    }

    root.cancel();
    for (handle, sub) in handles.into_iter().zip(&subscriptions) {
        if let Err(e) = handle.shutdown().await {
            warn!(
                topic = %sub.topic,
                group_id = %sub.group_id,
                error = %e,
                "Consumer loop ended with error"
            );
        }
    }

    if let Some(producer) = dlq_producer {
        producer.shutdown().await?;
    }

    info!("fitcoach-listen stopped");
    Ok(())
}

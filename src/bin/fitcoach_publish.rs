//! fitcoach-publish: publish one JSON event
//!
//! Usage:
//! ```text
//! fitcoach-publish <topic> <json> [--key <key>] [--config <path>]
//! ```
//!
//! The payload must be valid JSON. Without `--key`, a top-level `UserId`
//! string field is used as the partition key so one user's events stay in
//! order. The producer is flushed before exit.

use serde_json::Value;
use tracing::info;

use fitcoach_bus::bus::init_broker;
use fitcoach_bus::config::Config;
use fitcoach_bus::producer::{EventProducer, ProducerSettings};
use fitcoach_bus::utils::bootstrap::{init_tracing, parse_config_path};

const USAGE: &str = "usage: fitcoach-publish <topic> <json> [--key <key>] [--config <path>]";

#[derive(Debug, PartialEq, Eq)]
struct PublishArgs {
    topic: String,
    payload: String,
    key: Option<String>,
}

fn parse_args<I>(args: I) -> Result<PublishArgs, String>
where
    I: IntoIterator<Item = String>,
{
    let mut positional = Vec::new();
    let mut key = None;
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--key" | "-k" => {
                key = Some(args.next().ok_or("--key needs a value")?);
            }
            // Consumed by parse_config_path.
            "--config" | "-c" => {
                args.next();
            }
            _ if arg.starts_with("--key=") => {
                key = Some(arg["--key=".len()..].to_string());
            }
            _ if arg.starts_with("--config=") => {}
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    match (positional.next(), positional.next(), positional.next()) {
        (Some(topic), Some(payload), None) => Ok(PublishArgs {
            topic,
            payload,
            key,
        }),
        _ => Err(USAGE.to_string()),
    }
}

/// Partition key: explicit key, else the payload's `UserId`.
fn partition_key(explicit: Option<String>, payload: &Value) -> Option<String> {
    explicit.or_else(|| {
        payload
            .get("UserId")
            .and_then(Value::as_str)
            .map(str::to_string)
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    init_tracing();

    let args = parse_args(std::env::args().skip(1))?;
    let value: Value = serde_json::from_str(&args.payload)
        .map_err(|e| format!("payload is not valid JSON: {}", e))?;
    let key = partition_key(args.key, &value);

    let config = Config::load(parse_config_path().as_deref())?;
    let broker = init_broker(&config.messaging).await?;
    let producer =
        EventProducer::connect(broker.as_ref(), ProducerSettings::from(&config.producer)).await?;

    let result = producer
        .publish(&args.topic, key.as_deref().map(str::as_bytes), args.payload.as_bytes())
        .await;
    producer.shutdown().await?;
    let meta = result?;

    info!(
        topic = %meta.topic,
        partition = meta.partition,
        offset = meta.offset,
        "Event published"
    );
    Ok(())
}

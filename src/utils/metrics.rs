//! OTel-native metrics instruments.
//!
//! All instruments are lazily initialized and feature-gated behind `otel`.
//! Naming follows OTel semantic conventions (dot-separated).

use std::sync::LazyLock;

use opentelemetry::metrics::{Counter, Histogram, Meter};
use opentelemetry::{global, KeyValue};

static METER: LazyLock<Meter> = LazyLock::new(|| global::meter("fitcoach"));

// ============================================================================
// Producer
// ============================================================================

/// Duration of publish calls, retries included.
pub static PUBLISH_DURATION: LazyLock<Histogram<f64>> = LazyLock::new(|| {
    METER
        .f64_histogram("fitcoach.bus.publish.duration")
        .with_description("Event publish duration")
        .with_unit("s")
        .build()
});

/// Total publish calls, labelled by outcome.
pub static PUBLISH_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("fitcoach.bus.publish.total")
        .with_description("Total event publish calls")
        .build()
});

// ============================================================================
// Consumer
// ============================================================================

/// Records handed to a handler.
pub static CONSUMER_DELIVERED_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("fitcoach.consumer.delivered.total")
        .with_description("Records delivered to handlers")
        .build()
});

/// Handler failures, labelled by classification.
pub static CONSUMER_FAILED_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("fitcoach.consumer.failed.total")
        .with_description("Handler failures")
        .build()
});

/// Poison records skipped or dead-lettered.
pub static CONSUMER_POISON_TOTAL: LazyLock<Counter<u64>> = LazyLock::new(|| {
    METER
        .u64_counter("fitcoach.consumer.poison.total")
        .with_description("Poison records resolved by policy")
        .build()
});

// ============================================================================
// Label helpers
// ============================================================================

pub fn topic_attr(topic: &str) -> KeyValue {
    KeyValue::new("topic", topic.to_string())
}

pub fn group_attr(group_id: &str) -> KeyValue {
    KeyValue::new("group_id", group_id.to_string())
}

pub fn outcome_attr(outcome: &'static str) -> KeyValue {
    KeyValue::new("outcome", outcome)
}

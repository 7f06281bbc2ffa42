//! FitCoach event bus.
//!
//! At-least-once messaging between FitCoach services: a retrying
//! `EventProducer`, a cancellable `ConsumerLoop` that commits only after its
//! handler succeeds, and the broker seam both run on (in-memory or Kafka).

pub mod bus;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod events;
pub mod producer;
pub mod utils;

pub use bus::{init_broker, Broker, Record, RecordMetadata, RecordPosition};
pub use consumer::{
    ConsumerHandle, ConsumerLoop, ConsumerSettings, ConsumerState, HandlerError, JsonHandler,
    PoisonPolicy, RecordHandler,
};
pub use events::DomainEvent;
pub use producer::{EventProducer, ProducerSettings, RetryPolicy};

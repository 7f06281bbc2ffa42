use std::io::Write;

use serial_test::serial;

use super::*;
use crate::bus::OffsetReset;

fn write_config(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".yaml")
        .tempfile()
        .unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_config_default() {
    let config = Config::default();
    assert_eq!(config.messaging.messaging_type, MessagingType::Memory);
    assert_eq!(config.consumer.poll_interval(), Duration::from_secs(1));
    assert_eq!(config.consumer.grace_period(), Duration::from_secs(10));
    assert_eq!(config.consumer.max_poll_records, 100);
    assert_eq!(config.producer.flush_timeout(), Duration::from_secs(5));
    assert_eq!(config.consumer.poison, PoisonPolicy::Skip { max_attempts: 3 });
    assert!(config.subscriptions.is_empty());
    assert!(config.validate().is_ok());
}

#[test]
#[serial]
fn test_load_from_yaml_file() {
    let file = write_config(
        r#"
service: fitcoach-workout
messaging:
  type: kafka
  kafka:
    bootstrap_servers: "redpanda:9092"
    initial_offset: latest
consumer:
  poll_interval_ms: 250
  poison:
    action: dead_letter
    max_attempts: 5
subscriptions:
  - topic: workout
    group_id: fitcoach-workout-consumer
"#,
    );

    let config = Config::load(file.path().to_str()).unwrap();
    assert_eq!(config.service.as_deref(), Some("fitcoach-workout"));
    assert_eq!(config.messaging.messaging_type, MessagingType::Kafka);
    assert_eq!(config.messaging.kafka.bootstrap_servers, "redpanda:9092");
    assert_eq!(config.messaging.kafka.initial_offset, OffsetReset::Latest);
    assert_eq!(config.consumer.poll_interval(), Duration::from_millis(250));
    assert_eq!(
        config.consumer.poison,
        PoisonPolicy::DeadLetter { max_attempts: 5 }
    );
    assert_eq!(
        config.subscriptions,
        vec![SubscriptionConfig {
            topic: "workout".to_string(),
            group_id: "fitcoach-workout-consumer".to_string(),
        }]
    );
}

#[test]
#[serial]
fn test_env_overrides_file() {
    let file = write_config(
        r#"
messaging:
  kafka:
    bootstrap_servers: "from-file:9092"
"#,
    );

    std::env::set_var(
        "FITCOACH__MESSAGING__KAFKA__BOOTSTRAP_SERVERS",
        "from-env:9092",
    );
    let result = Config::load(file.path().to_str());
    std::env::remove_var("FITCOACH__MESSAGING__KAFKA__BOOTSTRAP_SERVERS");

    let config = result.unwrap();
    assert_eq!(config.messaging.kafka.bootstrap_servers, "from-env:9092");
}

#[test]
#[serial]
fn test_missing_explicit_file_fails() {
    let result = Config::load(Some("/nonexistent/fitcoach.yaml"));
    assert!(matches!(result, Err(ConfigError::Load(_))));
}

#[test]
#[serial]
fn test_load_rejects_invalid_settings() {
    let file = write_config(
        r#"
consumer:
  max_poll_records: 0
"#,
    );
    let result = Config::load(file.path().to_str());
    assert!(matches!(result, Err(ConfigError::Invalid(_))));
}

#[test]
fn test_validate_rejects_incomplete_subscription() {
    let config = Config {
        subscriptions: vec![SubscriptionConfig {
            topic: "progress".to_string(),
            group_id: String::new(),
        }],
        ..Default::default()
    };
    assert!(config.validate().is_err());
}

#[test]
fn test_resolve_subscriptions_prefers_explicit_list() {
    let config = Config {
        service: Some("fitcoach-user".to_string()),
        subscriptions: vec![SubscriptionConfig {
            topic: "progress".to_string(),
            group_id: "dashboard".to_string(),
        }],
        ..Default::default()
    };
    let subs = config.resolve_subscriptions(Some("fitcoach-workout")).unwrap();
    assert_eq!(subs, config.subscriptions);
}

#[test]
fn test_resolve_subscriptions_from_service_profile() {
    let config = Config {
        service: Some("fitcoach-user".to_string()),
        ..Default::default()
    };

    let subs = config.resolve_subscriptions(None).unwrap();
    assert_eq!(subs[0].topic, "managment");
    assert_eq!(subs[0].group_id, "fitcoach-user-consumer");

    let subs = config.resolve_subscriptions(Some("msboilerplate")).unwrap();
    assert_eq!(subs[0].group_id, "msboilerplate-consumer");
}

#[test]
fn test_resolve_subscriptions_errors() {
    let config = Config::default();
    assert!(matches!(
        config.resolve_subscriptions(None),
        Err(ConfigError::Invalid(_))
    ));
    assert!(config.resolve_subscriptions(Some("fitcoach-billing")).is_err());
}

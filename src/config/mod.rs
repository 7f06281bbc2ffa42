//! Application configuration.
//!
//! Aggregates broker, producer and consumer settings into a single Config
//! struct that can be loaded from YAML files or environment variables.

mod messaging;

pub use messaging::{KafkaConfig, MemoryConfig, MessagingConfig, MessagingType};

use std::time::Duration;

use serde::Deserialize;

use crate::consumer::PoisonPolicy;
use crate::events;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "FITCOACH_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "FITCOACH";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "FITCOACH_LOG";
/// Environment variable naming the hosted service profile.
pub const SERVICE_ENV_VAR: &str = "FITCOACH_SERVICE";

/// Errors loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Service profile name; selects default subscriptions when none are listed.
    pub service: Option<String>,
    /// Broker selection and connection settings.
    pub messaging: MessagingConfig,
    /// Producer settings.
    pub producer: ProducerConfig,
    /// Consumer loop settings shared by every subscription.
    pub consumer: ConsumerConfig,
    /// Topic/group pairs to run consumer loops for.
    pub subscriptions: Vec<SubscriptionConfig>,
}

/// Producer configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProducerConfig {
    /// Upper bound on the shutdown flush.
    pub flush_timeout_ms: u64,
    /// Retry transient publish failures.
    pub retry_enabled: bool,
    pub retry_min_delay_ms: u64,
    pub retry_max_delay_ms: u64,
    pub retry_max_attempts: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            flush_timeout_ms: 5000,
            retry_enabled: true,
            retry_min_delay_ms: 100,
            retry_max_delay_ms: 5000,
            retry_max_attempts: 5,
        }
    }
}

impl ProducerConfig {
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

/// Consumer loop configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Longest a single poll waits for records.
    pub poll_interval_ms: u64,
    /// Longest Draining may take before the task is aborted.
    pub grace_period_ms: u64,
    /// First ErrorBackoff delay.
    pub backoff_base_ms: u64,
    /// ErrorBackoff cap.
    pub backoff_max_ms: u64,
    /// ErrorBackoff jitter factor (0.0 disables).
    pub backoff_jitter: f64,
    /// Records fetched per poll.
    pub max_poll_records: usize,
    /// What to do with records a handler classifies as poison.
    pub poison: PoisonPolicy,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1000,
            grace_period_ms: 10_000,
            backoff_base_ms: 100,
            backoff_max_ms: 30_000,
            backoff_jitter: 0.0,
            max_poll_records: 100,
            poison: PoisonPolicy::default(),
        }
    }
}

impl ConsumerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
}

/// One consumer loop: a topic read under a consumer group.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubscriptionConfig {
    pub topic: String,
    pub group_id: String,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix, `__` separated
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the consumer loop cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.consumer.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "consumer.poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.consumer.max_poll_records == 0 {
            return Err(ConfigError::Invalid(
                "consumer.max_poll_records must be greater than zero".to_string(),
            ));
        }
        if self.consumer.backoff_max_ms < self.consumer.backoff_base_ms {
            return Err(ConfigError::Invalid(
                "consumer.backoff_max_ms must not be below consumer.backoff_base_ms".to_string(),
            ));
        }
        for sub in &self.subscriptions {
            if sub.topic.is_empty() || sub.group_id.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "subscription needs both topic and group_id: {:?}",
                    sub
                )));
            }
        }
        Ok(())
    }

    /// Subscriptions to host.
    ///
    /// Explicit `subscriptions` win. Otherwise the service name (`service`
    /// argument, then `self.service`) selects a known service profile.
    pub fn resolve_subscriptions(
        &self,
        service: Option<&str>,
    ) -> Result<Vec<SubscriptionConfig>, ConfigError> {
        if !self.subscriptions.is_empty() {
            return Ok(self.subscriptions.clone());
        }

        let Some(name) = service.or(self.service.as_deref()) else {
            return Err(ConfigError::Invalid(format!(
                "no subscriptions configured and no service named (set {} or `service`)",
                SERVICE_ENV_VAR
            )));
        };

        let profile = events::profile(name)
            .ok_or_else(|| ConfigError::Invalid(format!("unknown service profile: {}", name)))?;
        Ok(vec![SubscriptionConfig {
            topic: profile.topic.to_string(),
            group_id: profile.group_id.to_string(),
        }])
    }
}

#[cfg(test)]
mod tests;

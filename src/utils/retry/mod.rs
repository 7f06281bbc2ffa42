//! Backoff schedules for the publish and consume paths.
//!
//! - `publish_backoff()`: `backon` builder for retrying one producer send.
//! - `RetryConfig`: deterministic capped exponential delay, driven by the
//!   consumer loop's ErrorBackoff state where the loop owns the attempt count.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Backoff for transient publish failures.
///
/// - Min delay: 100ms
/// - Max delay: 5s
/// - Max attempts: 5
/// - Jitter enabled
pub fn publish_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(5))
        .with_max_times(5)
        .with_jitter()
}

/// Capped exponential delay schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Delay after the first failure (before jitter).
    pub base_delay: Duration,
    /// Maximum delay cap (before jitter).
    pub max_delay: Duration,
    /// Jitter factor: delay is multiplied by a value in [1-jitter, 1+jitter].
    /// 0.0 disables jitter.
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            jitter: 0.0,
        }
    }
}

impl RetryConfig {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            jitter: 0.0,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before the retry following `attempt` consecutive failures (0-indexed).
    ///
    /// `base * 2^attempt`, capped at `max_delay`. Never shorter than the
    /// previous attempt's delay when jitter is disabled.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let exponential_ms = base_ms.saturating_mul(1u64 << attempt.min(20));
        let capped_ms = exponential_ms.min(self.max_delay.as_millis() as u64);

        if self.jitter <= 0.0 {
            return Duration::from_millis(capped_ms);
        }

        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.subsec_nanos() as u64)
            .unwrap_or(0);
        let hash = nanos.wrapping_mul(31).wrapping_add(attempt as u64 * 17);
        let spread = ((hash % 1000) as f64 / 1000.0) * 2.0 - 1.0;
        Duration::from_millis((capped_ms as f64 * (1.0 + spread * self.jitter)) as u64)
    }
}

//! What the consumer loop does with a record the handler marks as poison.

use serde::{Deserialize, Serialize};

const DEFAULT_MAX_ATTEMPTS: u32 = 3;

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

/// Poison record policy.
///
/// `max_attempts` counts deliveries of the same record within one consumer
/// run; once reached the policy's action applies. Until then the record is
/// retried like any other failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PoisonPolicy {
    /// Log the record and commit past it.
    Skip {
        #[serde(default = "default_max_attempts")]
        max_attempts: u32,
    },
    /// Stop the consumer with `ConsumerError::PoisonRecord`.
    Halt {
        #[serde(default = "default_max_attempts")]
        max_attempts: u32,
    },
    /// Forward the record to the dead-letter topic, then commit past it.
    DeadLetter {
        #[serde(default = "default_max_attempts")]
        max_attempts: u32,
    },
}

impl Default for PoisonPolicy {
    fn default() -> Self {
        PoisonPolicy::Skip {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Decision for one poison delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoisonAction {
    Retry,
    Skip,
    Halt,
    DeadLetter,
}

impl PoisonPolicy {
    pub fn max_attempts(&self) -> u32 {
        match self {
            PoisonPolicy::Skip { max_attempts }
            | PoisonPolicy::Halt { max_attempts }
            | PoisonPolicy::DeadLetter { max_attempts } => (*max_attempts).max(1),
        }
    }

    /// Decide what to do after the `attempts`-th delivery failed as poison.
    pub fn resolve(&self, attempts: u32) -> PoisonAction {
        if attempts < self.max_attempts() {
            return PoisonAction::Retry;
        }
        match self {
            PoisonPolicy::Skip { .. } => PoisonAction::Skip,
            PoisonPolicy::Halt { .. } => PoisonAction::Halt,
            PoisonPolicy::DeadLetter { .. } => PoisonAction::DeadLetter,
        }
    }

    pub fn needs_dead_letter_sink(&self) -> bool {
        matches!(self, PoisonPolicy::DeadLetter { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_skips_after_three() {
        let policy = PoisonPolicy::default();
        assert_eq!(policy.resolve(1), PoisonAction::Retry);
        assert_eq!(policy.resolve(2), PoisonAction::Retry);
        assert_eq!(policy.resolve(3), PoisonAction::Skip);
        assert_eq!(policy.resolve(9), PoisonAction::Skip);
    }

    #[test]
    fn test_zero_attempts_acts_on_first_delivery() {
        let policy = PoisonPolicy::Halt { max_attempts: 0 };
        assert_eq!(policy.max_attempts(), 1);
        assert_eq!(policy.resolve(1), PoisonAction::Halt);
    }

    #[test]
    fn test_deserialize_tagged() {
        let policy: PoisonPolicy =
            serde_json::from_str(r#"{"action":"dead_letter","max_attempts":5}"#).unwrap();
        assert_eq!(policy, PoisonPolicy::DeadLetter { max_attempts: 5 });
        assert!(policy.needs_dead_letter_sink());

        let policy: PoisonPolicy = serde_json::from_str(r#"{"action":"halt"}"#).unwrap();
        assert_eq!(policy, PoisonPolicy::Halt { max_attempts: 3 });
    }
}

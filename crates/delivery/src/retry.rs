//! Exponential backoff for delivery retries.

use campaign_core::config::DeliveryRetryConfig;
use chrono::Duration;
use serde::{Deserialize, Serialize};

/// Retry configuration with exponential backoff: `base * 2^attempt`,
/// capped at `max_backoff_secs`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts (including the first transmission) before a record is terminal.
    pub max_attempts: u32,
    pub base_backoff_secs: u64,
    pub max_backoff_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&DeliveryRetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &DeliveryRetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            base_backoff_secs: config.base_backoff_secs,
            max_backoff_secs: config.max_backoff_secs,
        }
    }

    /// Backoff to wait after the `attempt`-th attempt.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let secs = 2u64
            .checked_pow(attempt)
            .and_then(|factor| self.base_backoff_secs.checked_mul(factor))
            .unwrap_or(self.max_backoff_secs)
            .min(self.max_backoff_secs);
        Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX / 1000))
    }

    pub fn is_exhausted(&self, attempt_count: u32) -> bool {
        attempt_count >= self.max_attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_backoff() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_backoff_secs: 60,
            max_backoff_secs: 600,
        };
        assert_eq!(policy.backoff_for_attempt(0), Duration::seconds(60));
        assert_eq!(policy.backoff_for_attempt(1), Duration::seconds(120));
        assert_eq!(policy.backoff_for_attempt(3), Duration::seconds(480));
        assert_eq!(policy.backoff_for_attempt(4), Duration::seconds(600));
        // Overflowing exponent still caps.
        assert_eq!(policy.backoff_for_attempt(90), Duration::seconds(600));
    }

    #[test]
    fn test_exhaustion() {
        let policy = RetryPolicy::default();
        assert!(!policy.is_exhausted(4));
        assert!(policy.is_exhausted(5));
    }
}

//! Retry backoff policies for failed jobs.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use taskbox_config::{BackoffKind, RetryConfig};

/// Backoff policy stored with each job.
///
/// The number of retries lives on the job itself (`retry_limit`); the policy
/// only decides how long to wait before the next delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Backoff kind.
    pub backoff: BackoffKind,

    /// Base delay in milliseconds.
    pub delay_ms: u64,

    /// Maximum delay in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            backoff: config.backoff,
            delay_ms: config.delay_ms,
            max_delay_ms: config.max_delay_ms.max(config.delay_ms),
        }
    }
}

impl RetryPolicy {
    /// Same delay before every retry.
    pub fn fixed(delay: Duration) -> Self {
        let delay_ms = duration_ms(delay);
        Self {
            backoff: BackoffKind::Fixed,
            delay_ms,
            max_delay_ms: delay_ms,
        }
    }

    /// Delay doubling with each attempt, starting at `initial`.
    pub fn exponential(initial: Duration) -> Self {
        Self {
            backoff: BackoffKind::Exponential,
            delay_ms: duration_ms(initial),
            max_delay_ms: 3_600_000,
        }
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = duration_ms(delay).max(self.delay_ms);
        self
    }

    /// Delay before the delivery following failed attempt number `attempt` (1-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }

        let delay = match self.backoff {
            BackoffKind::Fixed => self.delay_ms,
            BackoffKind::Exponential => {
                let factor = 1u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);
                self.delay_ms.saturating_mul(factor)
            }
        };

        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_retry() {
        let policy = RetryPolicy::fixed(Duration::from_secs(5));

        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(5000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(5000));
        assert_eq!(policy.delay_for_attempt(0), Duration::ZERO);
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy::exponential(Duration::from_secs(1));

        // 1s, 2s, 4s
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(4000));
    }

    #[test]
    fn test_max_delay_cap() {
        let policy = RetryPolicy::exponential(Duration::from_secs(1)).with_max_delay(Duration::from_secs(10));

        assert_eq!(policy.delay_for_attempt(10), Duration::from_secs(10));
        assert_eq!(policy.delay_for_attempt(200), Duration::from_secs(10));
    }

    #[test]
    fn test_from_config() {
        let config = RetryConfig {
            limit: 4,
            delay_ms: 250,
            max_delay_ms: 1000,
            backoff: BackoffKind::Fixed,
        };
        let policy = RetryPolicy::from(&config);
        assert_eq!(policy.delay_for_attempt(3), Duration::from_millis(250));
    }

    #[test]
    fn test_serializes_as_json_object() {
        let policy = RetryPolicy::fixed(Duration::from_millis(100));
        let json = serde_json::to_value(policy).unwrap();
        assert_eq!(json["backoff"], "fixed");
        assert_eq!(json["delay_ms"], 100);
        let back: RetryPolicy = serde_json::from_value(json).unwrap();
        assert_eq!(back, policy);
    }
}

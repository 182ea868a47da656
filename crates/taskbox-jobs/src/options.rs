//! Per-job send options.

use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Furthest a job can be scheduled, leased or backed off from now.
///
/// Keeps every `now + duration` the stores compute inside the range of both
/// `chrono` and PostgreSQL timestamps.
pub const MAX_SCHEDULE_HORIZON: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Job priority levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
    /// Low priority (background tasks).
    Low,
    /// Normal priority (default).
    #[default]
    Normal,
    /// High priority (important tasks).
    High,
    /// Critical priority (time-sensitive).
    Critical,
}

impl From<Priority> for i32 {
    fn from(priority: Priority) -> Self {
        match priority {
            Priority::Low => -10,
            Priority::Normal => 0,
            Priority::High => 10,
            Priority::Critical => 20,
        }
    }
}

impl From<i32> for Priority {
    fn from(value: i32) -> Self {
        match value {
            v if v >= 20 => Priority::Critical,
            v if v >= 10 => Priority::High,
            v if v <= -10 => Priority::Low,
            _ => Priority::Normal,
        }
    }
}

/// Options for a single send. Unset fields fall back to the scheduling defaults.
///
/// ```rust,ignore
/// let options = SendOptions::new()
///     .singleton_key("daily-report")
///     .retry_limit(5)
///     .delay(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub(crate) priority: Priority,
    pub(crate) delay: Option<Duration>,
    pub(crate) start_after: Option<DateTime<Utc>>,
    pub(crate) retry_limit: Option<u32>,
    pub(crate) retry_policy: Option<RetryPolicy>,
    pub(crate) expire_in: Option<Duration>,
    pub(crate) singleton_key: Option<String>,
}

impl SendOptions {
    /// Options with every field defaulted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set a delay before the first delivery.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self.start_after = None;
        self
    }

    /// Schedule the first delivery for a specific time.
    pub fn start_after(mut self, at: DateTime<Utc>) -> Self {
        self.start_after = Some(at);
        self.delay = None;
        self
    }

    /// Number of retries after the first delivery.
    pub fn retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = Some(limit);
        self
    }

    /// Override the backoff policy.
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Lease duration for each delivery; also bounds handler run time.
    pub fn expire_in(mut self, lease: Duration) -> Self {
        self.expire_in = Some(lease);
        self
    }

    /// At most one pending, retrying or active job per key and queue.
    pub fn singleton_key(mut self, key: impl Into<String>) -> Self {
        self.singleton_key = Some(key.into());
        self
    }
}

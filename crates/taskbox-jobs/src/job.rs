//! Job records, states, leases and the handler execution context.

use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Unique job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Creates a new random job ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<Uuid> for JobId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting for its first delivery.
    Pending,
    /// Leased by a worker.
    Active,
    /// Handler succeeded.
    Completed,
    /// Failed with deliveries left; eligible again once `run_at` passes.
    Retry,
    /// Failed terminally. Retained for inspection.
    Failed,
}

impl JobState {
    /// Returns the persisted name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Retry => "retry",
            JobState::Failed => "failed",
        }
    }

    /// Returns true if no further transition can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }

    /// Returns true while the state holds a singleton key.
    pub fn holds_singleton(&self) -> bool {
        matches!(self, JobState::Pending | JobState::Retry | JobState::Active)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "retry" => Ok(JobState::Retry),
            "failed" => Ok(JobState::Failed),
            other => Err(format!("unknown job state '{}'", other)),
        }
    }
}

/// A persisted job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub queue: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    pub priority: i32,
    /// Deliveries so far.
    pub attempts: u32,
    /// Retries allowed after the first delivery.
    pub retry_limit: u32,
    pub retry_policy: RetryPolicy,
    /// Lease duration granted on each claim.
    pub expire_in: Duration,
    /// Earliest time the job may be claimed.
    pub run_at: DateTime<Utc>,
    pub singleton_key: Option<String>,
    pub lock_token: Option<Uuid>,
    pub locked_by: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Maximum number of deliveries.
    pub fn max_attempts(&self) -> u32 {
        self.retry_limit.saturating_add(1)
    }

    /// Returns true if a failure of the current delivery may still be retried.
    pub fn has_deliveries_left(&self) -> bool {
        self.attempts < self.max_attempts()
    }

    /// The lease held on this job, if it is active.
    pub fn lease(&self) -> Option<Lease> {
        if self.state != JobState::Active {
            return None;
        }
        Some(Lease {
            job_id: self.id,
            lock_token: self.lock_token?,
            worker_id: self.locked_by.clone()?,
            expires_at: self.lease_expires_at?,
        })
    }
}

/// A job ready to be inserted.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub id: JobId,
    pub queue: String,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub retry_limit: u32,
    pub retry_policy: RetryPolicy,
    pub expire_in: Duration,
    /// Absolute start time; wins over `delay` when set.
    pub start_after: Option<DateTime<Utc>>,
    /// Delay relative to the store's clock at insert time.
    pub delay: Duration,
    pub singleton_key: Option<String>,
}

/// Exclusive, time-bounded claim of a job by one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub job_id: JobId,
    pub lock_token: Uuid,
    pub worker_id: String,
    pub expires_at: DateTime<Utc>,
}

/// How a failed delivery is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Make the job eligible again after `delay`.
    Retry { delay: Duration },
    /// Move the job to `failed`.
    Terminal,
}

/// Job execution context handed to handlers.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Job ID.
    pub job_id: JobId,

    /// Full queue name.
    pub queue: String,

    /// Current attempt number (1-based).
    pub attempt: u32,

    /// Retries allowed after the first delivery.
    pub retry_limit: u32,

    /// When the lease on this delivery expires.
    pub lease_expires_at: DateTime<Utc>,

    /// Worker ID processing this job.
    pub worker_id: String,

    cancellation: CancellationToken,
}

impl JobContext {
    pub(crate) fn new(job: &JobRecord, lease: &Lease, cancellation: CancellationToken) -> Self {
        Self {
            job_id: job.id,
            queue: job.queue.clone(),
            attempt: job.attempts,
            retry_limit: job.retry_limit,
            lease_expires_at: lease.expires_at,
            worker_id: lease.worker_id.clone(),
            cancellation,
        }
    }

    /// Returns true if this is the last delivery.
    pub fn is_last_attempt(&self) -> bool {
        self.attempt > self.retry_limit
    }

    /// Returns remaining deliveries after this one.
    pub fn remaining_attempts(&self) -> u32 {
        self.retry_limit.saturating_add(1).saturating_sub(self.attempt)
    }

    /// Returns true once shutdown has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Completes when shutdown is requested.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }
}

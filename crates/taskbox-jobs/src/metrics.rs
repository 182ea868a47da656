//! Metrics for job queue monitoring.

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names for the job queue system.
pub mod names {
    /// Total jobs enqueued.
    pub const JOBS_ENQUEUED_TOTAL: &str = "taskbox_jobs_enqueued_total";
    /// Total enqueues rejected by a held singleton key.
    pub const JOBS_SINGLETON_REJECTED_TOTAL: &str = "taskbox_jobs_singleton_rejected_total";
    /// Total jobs claimed for processing.
    pub const JOBS_CLAIMED_TOTAL: &str = "taskbox_jobs_claimed_total";
    /// Total jobs completed successfully.
    pub const JOBS_COMPLETED_TOTAL: &str = "taskbox_jobs_completed_total";
    /// Total jobs failed terminally.
    pub const JOBS_FAILED_TOTAL: &str = "taskbox_jobs_failed_total";
    /// Total jobs scheduled for retry.
    pub const JOBS_RETRIED_TOTAL: &str = "taskbox_jobs_retried_total";
    /// Total payloads rejected by their schema.
    pub const PAYLOADS_REJECTED_TOTAL: &str = "taskbox_payloads_rejected_total";
    /// Total results discarded because the lease was lost.
    pub const LEASES_LOST_TOTAL: &str = "taskbox_leases_lost_total";
    /// Total exhausted leases failed by the maintenance sweep.
    pub const LEASES_EXPIRED_TOTAL: &str = "taskbox_leases_expired_total";

    /// Job execution duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "taskbox_job_duration_seconds";
    /// Job wait time (time in queue) in seconds.
    pub const JOB_WAIT_TIME_SECONDS: &str = "taskbox_job_wait_time_seconds";

    /// Slots currently running a handler.
    pub const SLOTS_BUSY: &str = "taskbox_slots_busy";
    /// Configured slots per subscription.
    pub const SLOTS_CONCURRENCY: &str = "taskbox_slots_concurrency";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_ENQUEUED_TOTAL, "Total number of jobs enqueued");
    describe_counter!(
        names::JOBS_SINGLETON_REJECTED_TOTAL,
        "Total number of enqueues rejected because the singleton key was held"
    );
    describe_counter!(names::JOBS_CLAIMED_TOTAL, "Total number of jobs claimed for processing");
    describe_counter!(names::JOBS_COMPLETED_TOTAL, "Total number of jobs completed successfully");
    describe_counter!(names::JOBS_FAILED_TOTAL, "Total number of jobs that failed terminally");
    describe_counter!(names::JOBS_RETRIED_TOTAL, "Total number of job retries scheduled");
    describe_counter!(
        names::PAYLOADS_REJECTED_TOTAL,
        "Total number of payloads rejected by the queue schema"
    );
    describe_counter!(
        names::LEASES_LOST_TOTAL,
        "Total number of handler results discarded because the lease was lost"
    );
    describe_counter!(
        names::LEASES_EXPIRED_TOTAL,
        "Total number of exhausted jobs failed after their lease expired"
    );

    describe_histogram!(names::JOB_DURATION_SECONDS, "Job execution duration in seconds");
    describe_histogram!(
        names::JOB_WAIT_TIME_SECONDS,
        "Job wait time (time in queue) in seconds"
    );

    describe_gauge!(names::SLOTS_BUSY, "Number of slots running a handler");
    describe_gauge!(names::SLOTS_CONCURRENCY, "Configured slots per subscription");
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    /// Record a job enqueued.
    pub fn job_enqueued(queue: &str, priority: i32, transactional: bool) {
        counter!(
            names::JOBS_ENQUEUED_TOTAL,
            "queue" => queue.to_string(),
            "priority" => priority.to_string(),
            "transactional" => transactional.to_string()
        )
        .increment(1);
    }

    /// Record an enqueue rejected by a held singleton key.
    pub fn singleton_rejected(queue: &str) {
        counter!(names::JOBS_SINGLETON_REJECTED_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    /// Record a job claimed, with how long it waited past its `run_at`.
    pub fn job_claimed(queue: &str, wait_time: Duration) {
        counter!(names::JOBS_CLAIMED_TOTAL, "queue" => queue.to_string()).increment(1);
        histogram!(names::JOB_WAIT_TIME_SECONDS, "queue" => queue.to_string()).record(wait_time.as_secs_f64());
    }

    /// Record a job completed.
    pub fn job_completed(queue: &str, duration: Duration) {
        counter!(names::JOBS_COMPLETED_TOTAL, "queue" => queue.to_string()).increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "status" => "completed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a job failed terminally.
    pub fn job_failed(queue: &str, error_type: &str, duration: Duration) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "queue" => queue.to_string(),
            "error_type" => error_type.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "queue" => queue.to_string(),
            "status" => "failed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a retry scheduled.
    pub fn job_retried(queue: &str, error_type: &str, attempt: u32) {
        counter!(
            names::JOBS_RETRIED_TOTAL,
            "queue" => queue.to_string(),
            "error_type" => error_type.to_string(),
            "attempt" => attempt.to_string()
        )
        .increment(1);
    }

    /// Record a payload rejected by its schema.
    pub fn payload_rejected(queue: &str) {
        counter!(names::PAYLOADS_REJECTED_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    /// Record a result discarded after losing the lease.
    pub fn lease_lost(queue: &str) {
        counter!(names::LEASES_LOST_TOTAL, "queue" => queue.to_string()).increment(1);
    }

    /// Record exhausted leases failed by the sweep.
    pub fn leases_expired(queue: &str, count: u64) {
        counter!(names::LEASES_EXPIRED_TOTAL, "queue" => queue.to_string()).increment(count);
    }
}

/// Worker slot metrics recorder.
#[derive(Clone)]
pub struct WorkerMetrics;

impl WorkerMetrics {
    /// Record the configured slot count of a subscription.
    pub fn slots_started(queue: &str, concurrency: usize) {
        gauge!(names::SLOTS_CONCURRENCY, "queue" => queue.to_string()).set(concurrency as f64);
    }

    /// A slot picked up a job.
    pub fn slot_busy(queue: &str) {
        gauge!(names::SLOTS_BUSY, "queue" => queue.to_string()).increment(1.0);
    }

    /// A slot finished a job.
    pub fn slot_idle(queue: &str) {
        gauge!(names::SLOTS_BUSY, "queue" => queue.to_string()).decrement(1.0);
    }
}

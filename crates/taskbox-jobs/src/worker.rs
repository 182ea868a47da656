//! Worker pool: leases jobs, runs handlers, resolves outcomes.

use crate::error::{HandlerError, PayloadValidationError};
use crate::job::{Disposition, JobContext, JobRecord, Lease};
use crate::metrics::{JobMetrics, WorkerMetrics};
use crate::schema::PayloadSchema;
use crate::shutdown::{drain_tasks, DrainOutcome};
use crate::store::JobStore;
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskbox_config::SchedulingConfig;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Slots per subscription.
    pub concurrency: usize,

    /// Wait between claims when the queue is empty.
    pub poll_interval: Duration,

    /// Interval of the exhausted-lease sweep.
    pub maintenance_interval: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::from(&SchedulingConfig::default())
    }
}

impl From<&SchedulingConfig> for WorkerPoolConfig {
    fn from(config: &SchedulingConfig) -> Self {
        Self {
            concurrency: config.concurrency.max(1),
            poll_interval: config.poll_interval(),
            maintenance_interval: config.maintenance_interval(),
        }
    }
}

/// Type-erased handler: parses the payload, then returns the execution future.
pub(crate) type JobHandler = Arc<
    dyn Fn(&serde_json::Value, JobContext) -> Result<BoxFuture<'static, Result<(), HandlerError>>, PayloadValidationError>
        + Send
        + Sync,
>;

pub(crate) fn erase_handler<Sc, H, Fut>(schema: Sc, handler: H) -> JobHandler
where
    Sc: PayloadSchema,
    H: Fn(Sc::Output, JobContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(move |payload: &serde_json::Value, ctx: JobContext| {
        let input = schema.parse(payload)?;
        Ok(handler(input, ctx).boxed())
    })
}

/// Identifies a registration made with `work`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    id: Uuid,
    queue: String,
}

impl SubscriptionHandle {
    /// Full name of the queue being worked.
    pub fn queue(&self) -> &str {
        &self.queue
    }
}

struct Subscription {
    queue: String,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// State shared by the slots of one subscription.
struct SlotShared<S: JobStore> {
    store: Arc<S>,
    queue: String,
    handler: JobHandler,
    cancel: CancellationToken,
    poll_interval: Duration,
    counters: Arc<Counters>,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    failed: AtomicU64,
}

/// Worker pool for concurrent job processing.
pub struct WorkerPool<S: JobStore> {
    /// Unique pool ID.
    id: String,

    store: Arc<S>,

    config: WorkerPoolConfig,

    subscriptions: Mutex<HashMap<Uuid, Subscription>>,

    counters: Arc<Counters>,
}

impl<S: JobStore> WorkerPool<S> {
    /// Create a new worker pool.
    pub fn new(store: Arc<S>, config: WorkerPoolConfig) -> Self {
        Self {
            id: format!("taskbox-worker-{}", Uuid::new_v4()),
            store,
            config,
            subscriptions: Mutex::new(HashMap::new()),
            counters: Arc::new(Counters::default()),
        }
    }

    /// Starts `concurrency` slots and the maintenance sweep for `queue`.
    pub(crate) fn subscribe(&self, queue: &str, handler: JobHandler) -> SubscriptionHandle {
        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        let shared = Arc::new(SlotShared {
            store: Arc::clone(&self.store),
            queue: queue.to_string(),
            handler,
            cancel: cancel.clone(),
            poll_interval: self.config.poll_interval,
            counters: Arc::clone(&self.counters),
        });

        let mut tasks = Vec::with_capacity(self.config.concurrency + 1);
        for slot in 0..self.config.concurrency {
            let worker_id = format!("{}-{}", self.id, slot);
            let span = info_span!("slot", queue = %queue, worker_id = %worker_id);
            tasks.push(tokio::spawn(run_slot(Arc::clone(&shared), worker_id).instrument(span)));
        }
        tasks.push(tokio::spawn(
            run_maintenance(Arc::clone(&shared), self.config.maintenance_interval)
                .instrument(info_span!("maintenance", queue = %queue)),
        ));

        info!(
            pool_id = %self.id,
            queue = %queue,
            concurrency = self.config.concurrency,
            "Subscription started"
        );
        WorkerMetrics::slots_started(queue, self.config.concurrency);

        self.subscriptions.lock().insert(
            id,
            Subscription {
                queue: queue.to_string(),
                cancel,
                tasks,
            },
        );

        SubscriptionHandle {
            id,
            queue: queue.to_string(),
        }
    }

    /// Stops one subscription and drains its in-flight jobs.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle, grace: Duration) -> DrainOutcome {
        let removed = self.subscriptions.lock().remove(&handle.id);
        let Some(subscription) = removed else {
            return DrainOutcome::AlreadyStopped;
        };

        info!(pool_id = %self.id, queue = %subscription.queue, "Stopping subscription...");
        subscription.cancel.cancel();
        drain_tasks(subscription.tasks, grace).await
    }

    /// Stops every subscription and drains all in-flight jobs together.
    pub async fn drain_all(&self, grace: Duration) -> DrainOutcome {
        let subscriptions: Vec<Subscription> = self.subscriptions.lock().drain().map(|(_, s)| s).collect();

        info!(
            pool_id = %self.id,
            subscriptions = subscriptions.len(),
            "Waiting for workers to finish..."
        );

        let mut tasks = Vec::new();
        for subscription in subscriptions {
            subscription.cancel.cancel();
            tasks.extend(subscription.tasks);
        }

        let outcome = drain_tasks(tasks, grace).await;

        info!(
            pool_id = %self.id,
            processed = self.jobs_processed(),
            failed = self.jobs_failed(),
            "Worker pool stopped"
        );
        outcome
    }

    /// Get the number of jobs completed.
    pub fn jobs_processed(&self) -> u64 {
        self.counters.processed.load(Ordering::Relaxed)
    }

    /// Get the number of jobs failed terminally.
    pub fn jobs_failed(&self) -> u64 {
        self.counters.failed.load(Ordering::Relaxed)
    }

    /// Get the pool ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get pool statistics.
    pub fn stats(&self) -> WorkerPoolStats {
        let subscriptions = self.subscriptions.lock();
        WorkerPoolStats {
            id: self.id.clone(),
            concurrency: self.config.concurrency,
            jobs_processed: self.jobs_processed(),
            jobs_failed: self.jobs_failed(),
            queues: subscriptions.values().map(|s| s.queue.clone()).collect(),
        }
    }
}

impl<S: JobStore> Drop for WorkerPool<S> {
    fn drop(&mut self) {
        for subscription in self.subscriptions.get_mut().values() {
            subscription.cancel.cancel();
        }
    }
}

/// Worker pool statistics.
#[derive(Debug, Clone)]
pub struct WorkerPoolStats {
    /// Pool ID.
    pub id: String,

    /// Slots per subscription.
    pub concurrency: usize,

    /// Jobs completed.
    pub jobs_processed: u64,

    /// Jobs failed terminally.
    pub jobs_failed: u64,

    /// Queues with an active subscription.
    pub queues: Vec<String>,
}

async fn run_slot<S: JobStore>(shared: Arc<SlotShared<S>>, worker_id: String) {
    debug!("Slot started");

    while !shared.cancel.is_cancelled() {
        match shared.store.claim_next(&shared.queue, &worker_id, Uuid::new_v4()).await {
            Ok(Some(job)) => {
                process_job(&shared, job).await;
                continue;
            }
            Ok(None) => {}
            Err(e) => error!(error = %e, "Failed to claim job"),
        }

        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = sleep(shared.poll_interval) => {}
        }
    }

    debug!("Slot stopped");
}

async fn run_maintenance<S: JobStore>(shared: Arc<SlotShared<S>>, interval: Duration) {
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = sleep(interval) => {}
        }

        match shared.store.expire_exhausted(&shared.queue).await {
            Ok(0) => {}
            Ok(count) => {
                warn!(count, "Failed jobs whose lease expired with no deliveries left");
                JobMetrics::leases_expired(&shared.queue, count);
            }
            Err(e) => error!(error = %e, "Exhausted lease sweep failed"),
        }
    }
}

async fn process_job<S: JobStore>(shared: &SlotShared<S>, job: JobRecord) {
    let span = info_span!(
        "job",
        job_id = %job.id,
        queue = %job.queue,
        attempt = job.attempts,
        max_attempts = job.max_attempts(),
        otel.status_code = tracing::field::Empty,
    );

    WorkerMetrics::slot_busy(&shared.queue);
    execute(shared, job).instrument(span).await;
    WorkerMetrics::slot_idle(&shared.queue);
}

async fn execute<S: JobStore>(shared: &SlotShared<S>, job: JobRecord) {
    let Some(lease) = job.lease() else {
        error!("Claimed job carries no lease");
        return;
    };

    let wait = (Utc::now() - job.run_at).to_std().unwrap_or_default();
    JobMetrics::job_claimed(&job.queue, wait);
    debug!(worker_id = %lease.worker_id, "Processing job");

    let ctx = JobContext::new(&job, &lease, shared.cancel.child_token());
    let future = match (shared.handler)(&job.payload, ctx) {
        Ok(future) => future,
        Err(e) => {
            error!(error = %e, "Payload rejected by schema, failing job without retry");
            Span::current().record("otel.status_code", "ERROR");
            JobMetrics::payload_rejected(&job.queue);
            shared.counters.failed.fetch_add(1, Ordering::Relaxed);
            resolve(shared, &job, &lease, Disposition::Terminal, &e.to_string()).await;
            return;
        }
    };

    let started = Instant::now();
    let result = match timeout(job.expire_in, AssertUnwindSafe(future).catch_unwind()).await {
        Ok(Ok(result)) => result,
        Ok(Err(panic)) => Err(HandlerError::Panicked(panic_message(panic.as_ref()))),
        Err(_) => Err(HandlerError::Timeout(job.expire_in)),
    };
    let elapsed = started.elapsed();

    match result {
        Ok(()) => match shared.store.complete(&lease).await {
            Ok(true) => {
                debug!(duration_ms = elapsed.as_millis() as u64, "Job completed");
                JobMetrics::job_completed(&job.queue, elapsed);
                shared.counters.processed.fetch_add(1, Ordering::Relaxed);
            }
            Ok(false) => lease_lost(&job),
            Err(e) => error!(error = %e, "Failed to mark job as completed"),
        },
        Err(e) => {
            Span::current().record("otel.status_code", "ERROR");

            let disposition = if job.has_deliveries_left() {
                let delay = job.retry_policy.delay_for_attempt(job.attempts);
                warn!(
                    error = %e,
                    attempt = job.attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    "Job attempt failed, scheduling retry"
                );
                JobMetrics::job_retried(&job.queue, e.kind(), job.attempts);
                Disposition::Retry { delay }
            } else {
                error!(error = %e, attempt = job.attempts, "Job failed with no deliveries left");
                JobMetrics::job_failed(&job.queue, e.kind(), elapsed);
                shared.counters.failed.fetch_add(1, Ordering::Relaxed);
                Disposition::Terminal
            };

            resolve(shared, &job, &lease, disposition, &e.to_string()).await;
        }
    }
}

async fn resolve<S: JobStore>(
    shared: &SlotShared<S>,
    job: &JobRecord,
    lease: &Lease,
    disposition: Disposition,
    error: &str,
) {
    match shared.store.fail(lease, disposition, error).await {
        Ok(true) => {}
        Ok(false) => lease_lost(job),
        Err(e) => error!(error = %e, "Failed to record job failure"),
    }
}

fn lease_lost(job: &JobRecord) {
    warn!("Lease lost before the result was recorded, discarding result");
    JobMetrics::lease_lost(&job.queue);
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_pool_config_from_scheduling() {
        let scheduling = SchedulingConfig {
            concurrency: 0,
            poll_interval_ms: 25,
            ..SchedulingConfig::default()
        };
        let config = WorkerPoolConfig::from(&scheduling);
        assert_eq!(config.concurrency, 1);
        assert_eq!(config.poll_interval, Duration::from_millis(25));
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("kaboom"));
        assert_eq!(panic_message(boxed.as_ref()), "kaboom");
        let boxed: Box<dyn Any + Send> = Box::new(42);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }
}

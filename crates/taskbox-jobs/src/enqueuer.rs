//! Job producer: plain sends and the transactional outbox path.

use crate::error::EnqueueError;
use crate::job::{JobId, JobRecord, NewJob};
use crate::metrics::JobMetrics;
use crate::options::{SendOptions, MAX_SCHEDULE_HORIZON};
use crate::queue::Queue;
use crate::retry::RetryPolicy;
use crate::shutdown::ShutdownCoordinator;
use crate::store::JobStore;
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use taskbox_config::SchedulingConfig;
use tracing::{debug, warn};

/// Values applied when [`SendOptions`] leaves a field unset.
#[derive(Debug, Clone)]
pub struct JobDefaults {
    pub retry_limit: u32,
    pub retry_policy: RetryPolicy,
    pub expire_in: Duration,
}

impl From<&SchedulingConfig> for JobDefaults {
    fn from(config: &SchedulingConfig) -> Self {
        Self {
            retry_limit: config.retry.limit,
            retry_policy: RetryPolicy::from(&config.retry),
            expire_in: config.lease(),
        }
    }
}

/// Writes new jobs to one queue.
pub struct Enqueuer<S: JobStore> {
    store: Arc<S>,
    queue: Queue,
    defaults: JobDefaults,
    shutdown: Arc<ShutdownCoordinator>,
}

impl<S: JobStore> Enqueuer<S> {
    pub fn new(store: Arc<S>, queue: Queue, defaults: JobDefaults, shutdown: Arc<ShutdownCoordinator>) -> Self {
        Self {
            store,
            queue,
            defaults,
            shutdown,
        }
    }

    /// Enqueues a job in its own unit of work.
    pub async fn send<P>(&self, payload: &P, options: SendOptions) -> Result<JobId, EnqueueError>
    where
        P: Serialize + ?Sized + Sync,
    {
        let job = self.prepare(payload, options)?;
        let inserted = self.store.insert(&job).await?;
        self.accept(inserted, &job, false)
    }

    /// Enqueues a job through the caller's transaction.
    ///
    /// The job becomes visible if and only if the caller commits. The
    /// connection is borrowed for a single statement and never committed or
    /// rolled back here. A singleton conflict leaves the transaction usable.
    pub async fn send_in_transaction<P>(
        &self,
        conn: &mut S::Connection,
        payload: &P,
        options: SendOptions,
    ) -> Result<JobId, EnqueueError>
    where
        P: Serialize + ?Sized + Sync,
    {
        let job = self.prepare(payload, options)?;
        let inserted = self.store.insert_with(conn, &job).await?;
        self.accept(inserted, &job, true)
    }

    fn prepare<P>(&self, payload: &P, options: SendOptions) -> Result<NewJob, EnqueueError>
    where
        P: Serialize + ?Sized,
    {
        if self.shutdown.is_stopped() {
            return Err(EnqueueError::Stopped);
        }

        let invalid = |message: &str| Err(EnqueueError::InvalidOptions(message.to_string()));

        let expire_in = options.expire_in.unwrap_or(self.defaults.expire_in);
        if expire_in < Duration::from_millis(1) {
            return invalid("expire_in must be at least 1ms");
        }
        if expire_in > MAX_SCHEDULE_HORIZON {
            return invalid("expire_in must not exceed 100 years");
        }

        let delay = options.delay.unwrap_or(Duration::ZERO);
        if delay > MAX_SCHEDULE_HORIZON {
            return invalid("delay must not exceed 100 years");
        }
        if let Some(start_after) = options.start_after {
            let horizon = ChronoDuration::from_std(MAX_SCHEDULE_HORIZON).unwrap_or_else(|_| ChronoDuration::days(36_500));
            let now = Utc::now();
            if start_after > now + horizon || start_after < now - horizon {
                return invalid("start_after must be within 100 years of now");
            }
        }

        let retry_limit = options.retry_limit.unwrap_or(self.defaults.retry_limit);
        if i32::try_from(retry_limit).is_err() {
            return invalid("retry_limit must not exceed i32::MAX");
        }

        let retry_policy = options.retry_policy.unwrap_or(self.defaults.retry_policy);
        if Duration::from_millis(retry_policy.max_delay_ms) > MAX_SCHEDULE_HORIZON {
            return invalid("retry max delay must not exceed 100 years");
        }

        if options.singleton_key.as_deref().is_some_and(str::is_empty) {
            return invalid("singleton_key must not be empty");
        }

        Ok(NewJob {
            id: JobId::new(),
            queue: self.queue.full_name().to_string(),
            payload: serde_json::to_value(payload)?,
            priority: options.priority.into(),
            retry_limit,
            retry_policy,
            expire_in,
            start_after: options.start_after,
            delay,
            singleton_key: options.singleton_key,
        })
    }

    fn accept(&self, inserted: Option<JobRecord>, job: &NewJob, transactional: bool) -> Result<JobId, EnqueueError> {
        match inserted {
            Some(record) => {
                debug!(
                    job_id = %record.id,
                    queue = %record.queue,
                    transactional,
                    run_at = %record.run_at,
                    "Job enqueued"
                );
                JobMetrics::job_enqueued(&record.queue, record.priority, transactional);
                Ok(record.id)
            }
            None => {
                let key = job.singleton_key.clone().unwrap_or_default();
                warn!(queue = %job.queue, singleton_key = %key, "Singleton key already held, job rejected");
                JobMetrics::singleton_rejected(&job.queue);
                Err(EnqueueError::SingletonConflict {
                    queue: job.queue.clone(),
                    key,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobState;
    use crate::queue::QueueManager;
    use crate::store::InMemoryJobStore;
    use serde_json::json;
    use tokio_test::{assert_err, assert_ok};

    async fn enqueuer() -> (Enqueuer<InMemoryJobStore>, Arc<InMemoryJobStore>, Arc<ShutdownCoordinator>) {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = QueueManager::new(Arc::clone(&store), "svc")
            .ensure_queue("emails")
            .await
            .unwrap();
        let shutdown = Arc::new(ShutdownCoordinator::new(Duration::from_secs(1)));
        let enqueuer = Enqueuer::new(
            Arc::clone(&store),
            queue,
            JobDefaults::from(&SchedulingConfig::default()),
            Arc::clone(&shutdown),
        );
        (enqueuer, store, shutdown)
    }

    #[tokio::test]
    async fn test_send_applies_defaults() {
        let (enqueuer, store, _) = enqueuer().await;
        let id = enqueuer.send(&json!({"to": "a@b.com"}), SendOptions::new()).await.unwrap();

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.queue, "svc.emails");
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.payload, json!({"to": "a@b.com"}));
        assert_eq!(job.retry_limit, 2);
        assert_eq!(job.expire_in, Duration::from_secs(900));
        assert_eq!(job.attempts, 0);
    }

    #[tokio::test]
    async fn test_send_applies_options() {
        let (enqueuer, store, _) = enqueuer().await;
        let at = Utc::now() + chrono::Duration::hours(1);
        let options = SendOptions::new()
            .retry_limit(7)
            .expire_in(Duration::from_secs(5))
            .start_after(at)
            .priority(crate::options::Priority::High);
        let id = enqueuer.send(&json!({}), options).await.unwrap();

        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.retry_limit, 7);
        assert_eq!(job.expire_in, Duration::from_secs(5));
        assert_eq!(job.run_at, at);
        assert_eq!(job.priority, 10);
    }

    #[tokio::test]
    async fn test_singleton_conflict() {
        let (enqueuer, store, _) = enqueuer().await;
        let options = SendOptions::new().singleton_key("daily-report");

        assert_ok!(enqueuer.send(&json!({"day": 1}), options.clone()).await);
        let err = assert_err!(enqueuer.send(&json!({"day": 2}), options).await);
        assert!(matches!(err, EnqueueError::SingletonConflict { ref key, .. } if key == "daily-report"));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_send_in_transaction_rollback_and_commit() {
        let (enqueuer, store, _) = enqueuer().await;

        let mut tx = store.begin();
        enqueuer
            .send_in_transaction(&mut tx, &json!({"order": 1}), SendOptions::new())
            .await
            .unwrap();
        drop(tx);
        assert!(store.is_empty());

        let mut tx = store.begin();
        let id = enqueuer
            .send_in_transaction(&mut tx, &json!({"order": 2}), SendOptions::new())
            .await
            .unwrap();
        assert!(store.get_job(id).await.unwrap().is_none());
        store.commit(tx).unwrap();
        assert!(store.get_job(id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_invalid_options_rejected() {
        let (enqueuer, _, _) = enqueuer().await;
        let err = enqueuer
            .send(&json!({}), SendOptions::new().expire_in(Duration::ZERO))
            .await
            .unwrap_err();
        assert!(matches!(err, EnqueueError::InvalidOptions(_)));

        let err = enqueuer
            .send(&json!({}), SendOptions::new().singleton_key(""))
            .await
            .unwrap_err();
        assert!(matches!(err, EnqueueError::InvalidOptions(_)));
    }

    #[tokio::test]
    async fn test_out_of_range_schedule_rejected() {
        let (enqueuer, store, _) = enqueuer().await;
        let far = Duration::from_secs(10_000_000_000_000);

        let cases = [
            SendOptions::new().delay(far),
            SendOptions::new().expire_in(far),
            SendOptions::new().expire_in(MAX_SCHEDULE_HORIZON + Duration::from_secs(1)),
            SendOptions::new().start_after(Utc::now() + chrono::Duration::days(365 * 200)),
            SendOptions::new().start_after(chrono::DateTime::<Utc>::MIN_UTC),
            SendOptions::new().retry_policy(RetryPolicy::exponential(Duration::from_secs(1)).with_max_delay(far)),
            SendOptions::new().retry_limit(u32::MAX),
        ];
        for options in cases {
            let err = assert_err!(enqueuer.send(&json!({}), options.clone()).await);
            assert!(matches!(err, EnqueueError::InvalidOptions(_)), "{:?} accepted", options);
        }
        assert!(store.is_empty());

        // the bounds themselves are accepted
        let options = SendOptions::new()
            .delay(MAX_SCHEDULE_HORIZON)
            .expire_in(MAX_SCHEDULE_HORIZON)
            .retry_limit(u32::try_from(i32::MAX).unwrap());
        let id = assert_ok!(enqueuer.send(&json!({}), options).await);
        let job = store.get_job(id).await.unwrap().unwrap();
        assert_eq!(job.retry_limit, u32::try_from(i32::MAX).unwrap());
    }

    #[tokio::test]
    async fn test_send_after_stop_rejected() {
        let (enqueuer, store, shutdown) = enqueuer().await;
        shutdown.begin();

        let err = enqueuer.send(&json!({}), SendOptions::new()).await.unwrap_err();
        assert!(matches!(err, EnqueueError::Stopped));

        let mut tx = store.begin();
        let err = enqueuer
            .send_in_transaction(&mut tx, &json!({}), SendOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EnqueueError::Stopped));
        assert!(tx.is_empty());
    }

    #[tokio::test]
    async fn test_serialization_failure() {
        use std::collections::HashMap;

        let (enqueuer, _, _) = enqueuer().await;
        // non-string map keys cannot become JSON object keys
        let mut payload = HashMap::new();
        payload.insert(vec![1u8], "x");
        let err = enqueuer.send(&payload, SendOptions::new()).await.unwrap_err();
        assert!(matches!(err, EnqueueError::Serialization(_)));
    }
}

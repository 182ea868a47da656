//! Process-local job store for tests and local development.

use super::{JobStore, EXHAUSTED_LEASE_ERROR};
use crate::error::StoreError;
use crate::job::{Disposition, JobId, JobRecord, JobState, Lease, NewJob};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct Inner {
    queues: HashMap<String, DateTime<Utc>>,
    jobs: HashMap<JobId, JobRecord>,
    closed: bool,
}

impl Inner {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.closed {
            Err(StoreError::Closed)
        } else {
            Ok(())
        }
    }

    fn singleton_taken(&self, queue: &str, key: &str) -> bool {
        self.jobs.values().any(|job| {
            job.queue == queue && job.state.holds_singleton() && job.singleton_key.as_deref() == Some(key)
        })
    }

    fn leased_mut(&mut self, lease: &Lease) -> Option<&mut JobRecord> {
        self.jobs
            .get_mut(&lease.job_id)
            .filter(|job| job.state == JobState::Active && job.lock_token == Some(lease.lock_token))
    }
}

/// `at + duration`, saturating at the end of the representable range.
fn offset(at: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    ChronoDuration::from_std(duration)
        .ok()
        .and_then(|delta| at.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn pending_record(job: &NewJob, now: DateTime<Utc>) -> JobRecord {
    JobRecord {
        id: job.id,
        queue: job.queue.clone(),
        payload: job.payload.clone(),
        state: JobState::Pending,
        priority: job.priority,
        attempts: 0,
        retry_limit: job.retry_limit,
        retry_policy: job.retry_policy,
        expire_in: job.expire_in,
        run_at: job.start_after.unwrap_or_else(|| offset(now, job.delay)),
        singleton_key: job.singleton_key.clone(),
        lock_token: None,
        locked_by: None,
        lease_expires_at: None,
        last_error: None,
        created_at: now,
        started_at: None,
        completed_at: None,
    }
}

/// Uncommitted inserts staged against an [`InMemoryJobStore`].
///
/// Dropping the transaction discards them, mirroring a rollback.
#[derive(Debug, Default)]
pub struct MemoryTransaction {
    staged: Vec<JobRecord>,
}

impl MemoryTransaction {
    /// Number of staged jobs.
    pub fn len(&self) -> usize {
        self.staged.len()
    }

    /// Returns true if nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.staged.is_empty()
    }
}

/// In-memory job store.
///
/// Claims happen under a single mutex, which gives the same claim-next
/// exclusivity as row locking. Clones share state. After [`close`] writes are
/// rejected; reads stay available so tests can inspect final states.
///
/// [`close`]: JobStore::close
#[derive(Clone, Default)]
pub struct InMemoryJobStore {
    inner: Arc<Mutex<Inner>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a transaction for `send_in_transaction`.
    pub fn begin(&self) -> MemoryTransaction {
        MemoryTransaction::default()
    }

    /// Publishes every staged job at once, or none of them.
    pub fn commit(&self, tx: MemoryTransaction) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;

        for job in &tx.staged {
            if !inner.queues.contains_key(&job.queue) {
                return Err(StoreError::UnknownQueue(job.queue.clone()));
            }
            if let Some(key) = &job.singleton_key {
                if inner.singleton_taken(&job.queue, key) {
                    return Err(StoreError::Conflict(format!(
                        "singleton key '{}' on queue {} was taken by a concurrent commit",
                        key, job.queue
                    )));
                }
            }
        }

        for job in tx.staged {
            inner.jobs.insert(job.id, job);
        }
        Ok(())
    }

    /// Number of jobs stored, in any state.
    pub fn len(&self) -> usize {
        self.inner.lock().jobs.len()
    }

    /// Returns true if no job was ever committed.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    type Connection = MemoryTransaction;

    async fn provision(&self) -> Result<(), StoreError> {
        self.inner.lock().ensure_open()
    }

    async fn ensure_queue(&self, name: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;
        if inner.queues.contains_key(name) {
            return Ok(false);
        }
        inner.queues.insert(name.to_string(), Utc::now());
        Ok(true)
    }

    async fn insert(&self, job: &NewJob) -> Result<Option<JobRecord>, StoreError> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;
        if !inner.queues.contains_key(&job.queue) {
            return Err(StoreError::UnknownQueue(job.queue.clone()));
        }
        if let Some(key) = &job.singleton_key {
            if inner.singleton_taken(&job.queue, key) {
                return Ok(None);
            }
        }

        let record = pending_record(job, Utc::now());
        inner.jobs.insert(record.id, record.clone());
        Ok(Some(record))
    }

    async fn insert_with(
        &self,
        tx: &mut MemoryTransaction,
        job: &NewJob,
    ) -> Result<Option<JobRecord>, StoreError> {
        let inner = self.inner.lock();
        inner.ensure_open()?;
        if !inner.queues.contains_key(&job.queue) {
            return Err(StoreError::UnknownQueue(job.queue.clone()));
        }
        if let Some(key) = &job.singleton_key {
            let staged_holds_key = tx
                .staged
                .iter()
                .any(|staged| staged.queue == job.queue && staged.singleton_key.as_deref() == Some(key));
            if staged_holds_key || inner.singleton_taken(&job.queue, key) {
                return Ok(None);
            }
        }
        drop(inner);

        let record = pending_record(job, Utc::now());
        tx.staged.push(record.clone());
        Ok(Some(record))
    }

    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
        lock_token: Uuid,
    ) -> Result<Option<JobRecord>, StoreError> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;
        let now = Utc::now();

        let next = inner
            .jobs
            .values()
            .filter(|job| job.queue == queue)
            .filter(|job| match job.state {
                JobState::Pending | JobState::Retry => job.run_at <= now,
                JobState::Active => {
                    job.lease_expires_at.is_some_and(|at| at <= now) && job.has_deliveries_left()
                }
                JobState::Completed | JobState::Failed => false,
            })
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.run_at.cmp(&b.run_at))
                    .then(a.created_at.cmp(&b.created_at))
            })
            .map(|job| job.id);

        let Some(id) = next else {
            return Ok(None);
        };

        let Some(job) = inner.jobs.get_mut(&id) else {
            return Ok(None);
        };
        job.state = JobState::Active;
        job.attempts += 1;
        job.lock_token = Some(lock_token);
        job.locked_by = Some(worker_id.to_string());
        job.started_at = Some(now);
        job.lease_expires_at = Some(offset(now, job.expire_in));
        Ok(Some(job.clone()))
    }

    async fn complete(&self, lease: &Lease) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;
        let Some(job) = inner.leased_mut(lease) else {
            return Ok(false);
        };
        job.state = JobState::Completed;
        job.completed_at = Some(Utc::now());
        job.lock_token = None;
        job.lease_expires_at = None;
        Ok(true)
    }

    async fn fail(&self, lease: &Lease, disposition: Disposition, error: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;
        let Some(job) = inner.leased_mut(lease) else {
            return Ok(false);
        };
        let now = Utc::now();
        match disposition {
            Disposition::Retry { delay } => {
                job.state = JobState::Retry;
                job.run_at = offset(now, delay);
            }
            Disposition::Terminal => {
                job.state = JobState::Failed;
                job.completed_at = Some(now);
            }
        }
        job.last_error = Some(error.to_string());
        job.lock_token = None;
        job.lease_expires_at = None;
        Ok(true)
    }

    async fn expire_exhausted(&self, queue: &str) -> Result<u64, StoreError> {
        let mut inner = self.inner.lock();
        inner.ensure_open()?;
        let now = Utc::now();
        let mut expired = 0;

        for job in inner.jobs.values_mut() {
            let lease_gone = job.lease_expires_at.is_some_and(|at| at <= now);
            if job.queue == queue && job.state == JobState::Active && lease_gone && !job.has_deliveries_left() {
                job.state = JobState::Failed;
                job.completed_at = Some(now);
                job.last_error = Some(EXHAUSTED_LEASE_ERROR.to_string());
                job.lock_token = None;
                job.lease_expires_at = None;
                expired += 1;
            }
        }
        Ok(expired)
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        Ok(self.inner.lock().jobs.get(&id).cloned())
    }

    async fn list_jobs(
        &self,
        queue: &str,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let inner = self.inner.lock();
        let mut jobs: Vec<JobRecord> = inner
            .jobs
            .values()
            .filter(|job| job.queue == queue && state.map_or(true, |s| job.state == s))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.as_uuid().cmp(&b.id.as_uuid())));
        jobs.truncate(limit);
        Ok(jobs)
    }

    async fn close(&self) {
        self.inner.lock().closed = true;
    }
}

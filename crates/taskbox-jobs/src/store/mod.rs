//! Durable job storage.
//!
//! The store is the only coordination point between workers: every claim is
//! a single atomic step that skips rows locked by concurrent claimers, and
//! every resolution only applies while the job still carries the caller's
//! lock token.

mod memory;
mod postgres;

pub use memory::{InMemoryJobStore, MemoryTransaction};
pub use postgres::PgJobStore;

use crate::error::StoreError;
use crate::job::{Disposition, JobId, JobRecord, JobState, Lease, NewJob};
use async_trait::async_trait;
use uuid::Uuid;

/// Job store backend.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Caller-owned transactional handle used by the outbox path.
    type Connection: Send;

    /// Creates or upgrades the store's schema.
    async fn provision(&self) -> Result<(), StoreError>;

    /// Registers a queue. Returns true only for the caller that created it.
    async fn ensure_queue(&self, name: &str) -> Result<bool, StoreError>;

    /// Inserts a pending job in its own unit of work.
    ///
    /// Returns `None` when another pending, retrying or active job on the
    /// same queue already holds the job's singleton key.
    async fn insert(&self, job: &NewJob) -> Result<Option<JobRecord>, StoreError>;

    /// Same as [`insert`](Self::insert), executed through the caller's
    /// transaction. Never commits or rolls back.
    async fn insert_with(
        &self,
        conn: &mut Self::Connection,
        job: &NewJob,
    ) -> Result<Option<JobRecord>, StoreError>;

    /// Atomically claims the next eligible job of `queue`.
    ///
    /// Eligible: pending or retry with `run_at` in the past, or active with
    /// an expired lease and deliveries left. Ordered by priority (highest
    /// first), then `run_at`, then `created_at`. The claimed job is returned
    /// active with `attempts` incremented and a lease stamped with
    /// `lock_token`.
    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
        lock_token: Uuid,
    ) -> Result<Option<JobRecord>, StoreError>;

    /// Marks the leased job completed. Returns false if the lease was lost.
    async fn complete(&self, lease: &Lease) -> Result<bool, StoreError>;

    /// Records a failed delivery. Returns false if the lease was lost.
    async fn fail(
        &self,
        lease: &Lease,
        disposition: Disposition,
        error: &str,
    ) -> Result<bool, StoreError>;

    /// Fails active jobs of `queue` whose lease expired with no deliveries
    /// left. Returns the number of jobs moved.
    async fn expire_exhausted(&self, queue: &str) -> Result<u64, StoreError>;

    /// Fetches a job by ID.
    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, StoreError>;

    /// Lists jobs of `queue`, oldest first, optionally filtered by state.
    async fn list_jobs(
        &self,
        queue: &str,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError>;

    /// Releases the store's resources.
    async fn close(&self);
}

pub(crate) const EXHAUSTED_LEASE_ERROR: &str = "lease expired with no deliveries left";

//! PostgreSQL job store.

use super::{JobStore, EXHAUSTED_LEASE_ERROR};
use crate::error::StoreError;
use crate::job::{Disposition, JobId, JobRecord, JobState, Lease, NewJob};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{PgConnection, Postgres, Transaction};
use std::time::Duration;
use taskbox_config::DatabaseConfig;
use tracing::{debug, info, warn};
use uuid::Uuid;

macro_rules! job_columns {
    () => {
        "id, queue, payload, state, priority, attempts, retry_limit, retry_policy, \
         expire_in_ms, run_at, singleton_key, lock_token, locked_by, lease_expires_at, \
         last_error, created_at, started_at, completed_at"
    };
}

const INSERT_JOB: &str = concat!(
    "INSERT INTO taskbox_jobs (
        id, queue, payload, state, priority, attempts, retry_limit, retry_policy,
        expire_in_ms, run_at, singleton_key
    )
    VALUES (
        $1, $2, $3, 'pending', $4, 0, $5, $6,
        $7, COALESCE($8, now() + $9 * interval '1 millisecond'), $10
    )
    ON CONFLICT DO NOTHING
    RETURNING ",
    job_columns!()
);

const CLAIM_NEXT: &str = concat!(
    "UPDATE taskbox_jobs SET
        state = 'active',
        attempts = attempts + 1,
        lock_token = $2,
        locked_by = $3,
        started_at = now(),
        lease_expires_at = now() + expire_in_ms * interval '1 millisecond'
    WHERE id = (
        SELECT id FROM taskbox_jobs
        WHERE queue = $1
          AND (
                (state IN ('pending', 'retry') AND run_at <= now())
             OR (state = 'active' AND lease_expires_at <= now() AND attempts <= retry_limit)
          )
        ORDER BY priority DESC, run_at ASC, created_at ASC
        LIMIT 1
        FOR UPDATE SKIP LOCKED
    )
    RETURNING ",
    job_columns!()
);

/// Row shape of `taskbox_jobs`.
#[derive(Debug, sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    queue: String,
    payload: serde_json::Value,
    state: String,
    priority: i32,
    attempts: i32,
    retry_limit: i32,
    retry_policy: Json<RetryPolicy>,
    expire_in_ms: i64,
    run_at: DateTime<Utc>,
    singleton_key: Option<String>,
    lock_token: Option<Uuid>,
    locked_by: Option<String>,
    lease_expires_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let corrupt = |field: &str| StoreError::Corrupt(format!("job {}: invalid {}", row.id, field));

        Ok(JobRecord {
            id: JobId::from(row.id),
            state: row.state.parse().map_err(StoreError::Corrupt)?,
            attempts: u32::try_from(row.attempts).map_err(|_| corrupt("attempts"))?,
            retry_limit: u32::try_from(row.retry_limit).map_err(|_| corrupt("retry_limit"))?,
            expire_in: Duration::from_millis(
                u64::try_from(row.expire_in_ms).map_err(|_| corrupt("expire_in_ms"))?,
            ),
            queue: row.queue,
            payload: row.payload,
            priority: row.priority,
            retry_policy: row.retry_policy.0,
            run_at: row.run_at,
            singleton_key: row.singleton_key,
            lock_token: row.lock_token,
            locked_by: row.locked_by,
            lease_expires_at: row.lease_expires_at,
            last_error: row.last_error,
            created_at: row.created_at,
            started_at: row.started_at,
            completed_at: row.completed_at,
        })
    }
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn map_insert_error(err: sqlx::Error, queue: &str) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        // foreign key violation: queue row missing
        if db_err.code().as_deref() == Some("23503") {
            return StoreError::UnknownQueue(queue.to_string());
        }
    }
    StoreError::Database(err)
}

/// Job store backed by PostgreSQL.
///
/// Claims use `FOR UPDATE SKIP LOCKED`, so any number of processes can poll
/// the same queue without double delivery.
///
/// [`JobStore::close`] only closes the pool when the store created it with
/// [`PgJobStore::connect`]; a pool handed in through [`PgJobStore::with_pool`]
/// stays open for its owner.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
    owns_pool: bool,
}

impl PgJobStore {
    /// Creates a connection pool from configuration.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, StoreError> {
        info!("Connecting to PostgreSQL job store...");

        let pool = PgPoolOptions::new()
            .min_connections(config.min_connections)
            .max_connections(config.max_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(Some(config.idle_timeout()))
            .connect(&config.url)
            .await
            .map_err(|e| {
                warn!("Failed to connect to job store: {}", e);
                StoreError::Database(e)
            })?;

        info!("PostgreSQL connection pool established");
        Ok(Self {
            pool,
            owns_pool: true,
        })
    }

    /// Wraps an existing pool, e.g. the application's own. The pool is
    /// borrowed: closing the store leaves it open.
    #[must_use]
    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool,
            owns_pool: false,
        }
    }

    /// Whether [`JobStore::close`] closes the underlying pool.
    #[must_use]
    pub fn owns_pool(&self) -> bool {
        self.owns_pool
    }

    /// Returns a reference to the underlying pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Starts a transaction for producer code; enqueue through it with
    /// `send_in_transaction(&mut *tx, ..)`.
    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, StoreError> {
        Ok(self.pool.begin().await?)
    }

    /// Checks if the database connection is healthy.
    pub async fn health_check(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn insert_impl_conn(conn: &mut PgConnection, job: &NewJob) -> Result<Option<JobRecord>, StoreError> {
        let retry_limit = i32::try_from(job.retry_limit)
            .map_err(|_| StoreError::InvalidJob(format!("retry_limit {} exceeds i32::MAX", job.retry_limit)))?;

        let row = sqlx::query_as::<_, JobRow>(INSERT_JOB)
            .bind(job.id.as_uuid())
            .bind(&job.queue)
            .bind(&job.payload)
            .bind(job.priority)
            .bind(retry_limit)
            .bind(Json(job.retry_policy))
            .bind(millis(job.expire_in))
            .bind(job.start_after)
            .bind(millis(job.delay))
            .bind(&job.singleton_key)
            .fetch_optional(&mut *conn)
            .await
            .map_err(|e| map_insert_error(e, &job.queue))?;

        row.map(JobRecord::try_from).transpose()
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    type Connection = PgConnection;

    async fn provision(&self) -> Result<(), StoreError> {
        info!("Running job store migrations...");
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        info!("Job store migrations completed");
        Ok(())
    }

    async fn ensure_queue(&self, name: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("INSERT INTO taskbox_queues (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert(&self, job: &NewJob) -> Result<Option<JobRecord>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        Self::insert_impl_conn(&mut conn, job).await
    }

    async fn insert_with(&self, conn: &mut PgConnection, job: &NewJob) -> Result<Option<JobRecord>, StoreError> {
        Self::insert_impl_conn(conn, job).await
    }

    async fn claim_next(
        &self,
        queue: &str,
        worker_id: &str,
        lock_token: Uuid,
    ) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(CLAIM_NEXT)
            .bind(queue)
            .bind(lock_token)
            .bind(worker_id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(JobRecord::try_from).transpose()
    }

    async fn complete(&self, lease: &Lease) -> Result<bool, StoreError> {
        let result = sqlx::query(
            "UPDATE taskbox_jobs SET
                state = 'completed',
                completed_at = now(),
                lock_token = NULL,
                lease_expires_at = NULL
            WHERE id = $1 AND state = 'active' AND lock_token = $2",
        )
        .bind(lease.job_id.as_uuid())
        .bind(lease.lock_token)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn fail(&self, lease: &Lease, disposition: Disposition, error: &str) -> Result<bool, StoreError> {
        let query = match disposition {
            Disposition::Retry { delay } => sqlx::query(
                "UPDATE taskbox_jobs SET
                    state = 'retry',
                    run_at = now() + $3 * interval '1 millisecond',
                    last_error = $4,
                    lock_token = NULL,
                    lease_expires_at = NULL
                WHERE id = $1 AND state = 'active' AND lock_token = $2",
            )
            .bind(lease.job_id.as_uuid())
            .bind(lease.lock_token)
            .bind(millis(delay))
            .bind(error),
            Disposition::Terminal => sqlx::query(
                "UPDATE taskbox_jobs SET
                    state = 'failed',
                    completed_at = now(),
                    last_error = $3,
                    lock_token = NULL,
                    lease_expires_at = NULL
                WHERE id = $1 AND state = 'active' AND lock_token = $2",
            )
            .bind(lease.job_id.as_uuid())
            .bind(lease.lock_token)
            .bind(error),
        };

        let result = query.execute(&self.pool).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn expire_exhausted(&self, queue: &str) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE taskbox_jobs SET
                state = 'failed',
                completed_at = now(),
                last_error = $2,
                lock_token = NULL,
                lease_expires_at = NULL
            WHERE queue = $1
              AND state = 'active'
              AND lease_expires_at <= now()
              AND attempts > retry_limit",
        )
        .bind(queue)
        .bind(EXHAUSTED_LEASE_ERROR)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        let row = sqlx::query_as::<_, JobRow>(concat!("SELECT ", job_columns!(), " FROM taskbox_jobs WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;

        row.map(JobRecord::try_from).transpose()
    }

    async fn list_jobs(
        &self,
        queue: &str,
        state: Option<JobState>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let rows = sqlx::query_as::<_, JobRow>(concat!(
            "SELECT ",
            job_columns!(),
            " FROM taskbox_jobs
            WHERE queue = $1 AND ($2::text IS NULL OR state = $2)
            ORDER BY created_at ASC, id ASC
            LIMIT $3"
        ))
        .bind(queue)
        .bind(state.map(|s| s.as_str()))
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(JobRecord::try_from).collect()
    }

    async fn close(&self) {
        if !self.owns_pool {
            debug!("Job store pool is owned by the caller, leaving it open");
            return;
        }
        debug!("Closing job store connection pool...");
        self.pool.close().await;
        info!("Job store connection pool closed");
    }
}

impl std::fmt::Debug for PgJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgJobStore")
            .field("size", &self.pool.size())
            .field("num_idle", &self.pool.num_idle())
            .field("owns_pool", &self.owns_pool)
            .finish()
    }
}

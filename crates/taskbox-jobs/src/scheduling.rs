//! `TaskScheduling`: the public entry point wiring queues, producer, workers and shutdown.

use crate::enqueuer::{Enqueuer, JobDefaults};
use crate::error::{EnqueueError, HandlerError, SetupError, StoreError};
use crate::job::{JobContext, JobId, JobRecord, JobState};
use crate::options::SendOptions;
use crate::queue::{Queue, QueueManager};
use crate::schema::PayloadSchema;
use crate::shutdown::{shutdown_signal, DrainOutcome, ShutdownCoordinator};
use crate::store::{JobStore, PgJobStore};
use crate::worker::{erase_handler, SubscriptionHandle, WorkerPool, WorkerPoolConfig, WorkerPoolStats};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use taskbox_config::{DatabaseConfig, SchedulingConfig};
use tracing::{debug, info, info_span, warn, Instrument};

/// Transactional task scheduling over a [`JobStore`].
///
/// ```rust,ignore
/// let scheduling = TaskScheduling::connect("emails", &config.database, config.scheduling).await?;
///
/// scheduling
///     .work("emails", Json::<Email>::new(), |email, ctx| async move {
///         mailer.send(&email).await?;
///         Ok(())
///     })
///     .await?;
///
/// let mut tx = scheduling.store().begin().await?;
/// sqlx::query("INSERT INTO users (email) VALUES ($1)").bind(&email.to).execute(&mut *tx).await?;
/// scheduling.send_in_transaction(&mut *tx, &email, SendOptions::new()).await?;
/// tx.commit().await?;
///
/// scheduling.stop().await;
/// ```
pub struct TaskScheduling<S: JobStore> {
    store: Arc<S>,
    queue: Queue,
    queues: QueueManager<S>,
    enqueuer: Enqueuer<S>,
    pool: WorkerPool<S>,
    shutdown: Arc<ShutdownCoordinator>,
}

impl<S: JobStore> TaskScheduling<S> {
    /// Sets up scheduling for `queue_name` on an already provisioned store.
    pub async fn create(store: S, queue_name: &str, config: SchedulingConfig) -> Result<Self, SetupError> {
        let span = info_span!("taskbox.setup", queue = %queue_name, service = %config.service_name);

        async move {
            if config.concurrency == 0 {
                return Err(SetupError::Configuration("concurrency must be at least 1".to_string()));
            }
            if config.lease_secs == 0 {
                return Err(SetupError::Configuration("lease_secs must be positive".to_string()));
            }

            let store = Arc::new(store);
            let queues = QueueManager::new(Arc::clone(&store), config.service_name.clone());
            let queue = queues.ensure_queue(queue_name).await?;

            let shutdown = Arc::new(ShutdownCoordinator::new(config.shutdown_grace()));
            let enqueuer = Enqueuer::new(
                Arc::clone(&store),
                queue.clone(),
                JobDefaults::from(&config),
                Arc::clone(&shutdown),
            );
            let pool = WorkerPool::new(Arc::clone(&store), WorkerPoolConfig::from(&config));

            info!(queue = %queue.full_name(), pool_id = %pool.id(), "Task scheduling ready");

            Ok(Self {
                store,
                queue,
                queues,
                enqueuer,
                pool,
                shutdown,
            })
        }
        .instrument(span)
        .await
    }

    /// Registers `handler` for the logical queue `name` and starts its slots.
    ///
    /// Payloads are parsed with `schema` before the handler runs; a payload
    /// that does not parse fails its job without retry.
    pub async fn work<Sc, H, Fut>(&self, name: &str, schema: Sc, handler: H) -> Result<SubscriptionHandle, SetupError>
    where
        Sc: PayloadSchema,
        H: Fn(Sc::Output, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        if self.shutdown.is_stopped() {
            return Err(SetupError::Stopped);
        }

        let queue = self.queues.ensure_queue(name).await?;
        let handle = self.pool.subscribe(queue.full_name(), erase_handler(schema, handler));

        // stop() may have drained the pool while the queue was being ensured
        if self.shutdown.is_stopped() {
            self.pool.unsubscribe(&handle, self.shutdown.grace()).await;
            return Err(SetupError::Stopped);
        }
        Ok(handle)
    }

    /// Enqueues a job on the primary queue in its own unit of work.
    pub async fn send<P>(&self, payload: &P, options: SendOptions) -> Result<JobId, EnqueueError>
    where
        P: Serialize + ?Sized + Sync,
    {
        self.enqueuer.send(payload, options).await
    }

    /// Enqueues a job on the primary queue through the caller's transaction.
    ///
    /// For PostgreSQL pass `&mut *tx` of an `sqlx::Transaction`: the job is
    /// visible if and only if that transaction commits.
    pub async fn send_in_transaction<P>(
        &self,
        conn: &mut S::Connection,
        payload: &P,
        options: SendOptions,
    ) -> Result<JobId, EnqueueError>
    where
        P: Serialize + ?Sized + Sync,
    {
        self.enqueuer.send_in_transaction(conn, payload, options).await
    }

    /// Stops leasing, drains in-flight jobs within the grace period and
    /// closes the store. Later calls return [`DrainOutcome::AlreadyStopped`].
    pub async fn stop(&self) -> DrainOutcome {
        if !self.shutdown.begin() {
            debug!(queue = %self.queue.full_name(), "Task scheduling already stopped");
            return DrainOutcome::AlreadyStopped;
        }

        info!(queue = %self.queue.full_name(), "Stopping task scheduling...");
        let outcome = self.pool.drain_all(self.shutdown.grace()).await;
        if let DrainOutcome::Abandoned { remaining } = outcome {
            warn!(remaining, "Jobs abandoned at shutdown will be redelivered after their leases expire");
        }

        self.store.close().await;
        info!("Task scheduling stopped");
        outcome
    }

    /// Stops a single registration without closing the store.
    pub async fn unsubscribe(&self, handle: &SubscriptionHandle) -> DrainOutcome {
        self.pool.unsubscribe(handle, self.shutdown.grace()).await
    }

    /// Waits for Ctrl+C or SIGTERM, then stops.
    pub async fn run_until_signal(&self) -> DrainOutcome {
        shutdown_signal().await;
        self.stop().await
    }

    /// Fetches a job by ID.
    pub async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>, StoreError> {
        self.store.get_job(id).await
    }

    /// Lists jobs of the primary queue, oldest first.
    pub async fn list_jobs(&self, state: Option<JobState>, limit: usize) -> Result<Vec<JobRecord>, StoreError> {
        self.store.list_jobs(self.queue.full_name(), state, limit).await
    }

    /// The primary queue.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Returns true once `stop` has been called.
    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_stopped()
    }

    /// Worker pool statistics.
    pub fn stats(&self) -> WorkerPoolStats {
        self.pool.stats()
    }

    /// The underlying store.
    pub fn store(&self) -> &S {
        &self.store
    }
}

impl TaskScheduling<PgJobStore> {
    /// Connects to PostgreSQL, applies migrations if configured, and sets up
    /// scheduling for `queue_name`. The pool is closed if any step fails.
    pub async fn connect(
        queue_name: &str,
        database: &DatabaseConfig,
        config: SchedulingConfig,
    ) -> Result<Self, SetupError> {
        let store = PgJobStore::connect(database).await?;

        if database.run_migrations {
            if let Err(e) = store.provision().await {
                store.close().await;
                return Err(e.into());
            }
        }

        match Self::create(store.clone(), queue_name, config).await {
            Ok(scheduling) => Ok(scheduling),
            Err(e) => {
                store.close().await;
                Err(e)
            }
        }
    }
}

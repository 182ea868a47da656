//! Taskbox Jobs - Transactional Task Scheduling
//!
//! A PostgreSQL-backed job queue with:
//! - Transactional enqueue: a job commits or rolls back with the caller's business writes
//! - Leased delivery with `FOR UPDATE SKIP LOCKED`, so concurrent workers never share a job
//! - Retry limits with fixed or exponential backoff
//! - Singleton keys, delayed jobs and priorities
//! - Payload schemas checked before a handler runs
//! - Graceful shutdown with a bounded grace period
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    Taskbox Architecture                       │
//! ├──────────────────────────────────────────────────────────────┤
//! │                                                               │
//! │  Producer ── BEGIN; business writes; send_in_transaction ──┐  │
//! │                                                   COMMIT   │  │
//! │                                                            ▼  │
//! │  ┌────────────────────────────────────────────────────────┐   │
//! │  │                taskbox_jobs (PostgreSQL)               │   │
//! │  │   pending ──claim──▶ active ──ok──▶ completed           │   │
//! │  │      ▲                 │                               │   │
//! │  │      └──── retry ◀─────┤──exhausted──▶ failed           │   │
//! │  └────────────────────────┬───────────────────────────────┘   │
//! │                           │ SKIP LOCKED                       │
//! │  ┌────────────────────────▼───────────────────────────────┐   │
//! │  │                     Worker Pool                         │   │
//! │  │   ┌────────┐ ┌────────┐ ┌────────┐   ┌─────────────┐    │   │
//! │  │   │ Slot 1 │ │ Slot 2 │ │ Slot N │   │ Maintenance │    │   │
//! │  │   └────────┘ └────────┘ └────────┘   └─────────────┘    │   │
//! │  └────────────────────────────────────────────────────────┘   │
//! │                                                               │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use serde::{Deserialize, Serialize};
//! use taskbox_jobs::{Json, SendOptions, TaskScheduling};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct WelcomeEmail {
//!     to: String,
//! }
//!
//! let scheduling = TaskScheduling::connect("emails", &config.database, config.scheduling).await?;
//!
//! scheduling
//!     .work("emails", Json::<WelcomeEmail>::new(), |email, ctx| async move {
//!         tracing::info!(to = %email.to, attempt = ctx.attempt, "Sending welcome email");
//!         Ok(())
//!     })
//!     .await?;
//!
//! let mut tx = scheduling.store().begin().await?;
//! sqlx::query("INSERT INTO users (email) VALUES ($1)")
//!     .bind("user@example.com")
//!     .execute(&mut *tx)
//!     .await?;
//! scheduling
//!     .send_in_transaction(&mut *tx, &WelcomeEmail { to: "user@example.com".into() }, SendOptions::new())
//!     .await?;
//! tx.commit().await?;
//!
//! scheduling.run_until_signal().await;
//! ```

pub mod enqueuer;
pub mod error;
pub mod job;
pub mod metrics;
pub mod options;
pub mod queue;
pub mod retry;
pub mod scheduling;
pub mod schema;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use enqueuer::{Enqueuer, JobDefaults};
pub use error::{EnqueueError, HandlerError, PayloadValidationError, SetupError, StoreError};
pub use job::{JobContext, JobId, JobRecord, JobState, Lease};
pub use metrics::{register_metrics, JobMetrics, WorkerMetrics};
pub use options::{Priority, SendOptions};
pub use queue::{full_queue_name, Queue, QueueManager};
pub use retry::RetryPolicy;
pub use scheduling::TaskScheduling;
pub use schema::{Json, PayloadSchema, RawJson, Validated};
pub use shutdown::{shutdown_signal, DrainOutcome};
pub use store::{InMemoryJobStore, JobStore, MemoryTransaction, PgJobStore};
pub use worker::{SubscriptionHandle, WorkerPoolConfig, WorkerPoolStats};

/// Re-export commonly used items
pub mod prelude {
    pub use crate::error::HandlerError;
    pub use crate::job::{JobContext, JobId, JobState};
    pub use crate::options::{Priority, SendOptions};
    pub use crate::schema::{Json, RawJson, Validated};
    pub use crate::scheduling::TaskScheduling;
    pub use crate::store::JobStore;
}

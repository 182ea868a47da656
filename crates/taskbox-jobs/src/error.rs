//! Job subsystem error types.

use std::time::Duration;
use taskbox_core::TaskboxError;
use thiserror::Error;

/// Errors raised by a [`JobStore`](crate::store::JobStore) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema migration failed.
    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A stored row could not be decoded.
    #[error("Corrupt job row: {0}")]
    Corrupt(String),

    /// The job references a queue that was never provisioned.
    #[error("Unknown queue: {0}")]
    UnknownQueue(String),

    /// A job carries a value the store cannot hold.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// A staged write lost against a concurrent commit.
    #[error("Write conflict: {0}")]
    Conflict(String),

    /// The store has been closed.
    #[error("Job store is closed")]
    Closed,
}

impl StoreError {
    /// Returns true if retrying the same operation later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::Protocol(_)
            ),
            StoreError::Conflict(_) => true,
            _ => false,
        }
    }
}

/// Errors that abort setup of the scheduling subsystem or a registration.
#[derive(Debug, Error)]
pub enum SetupError {
    /// The job store could not be reached or provisioned.
    #[error("Job store unavailable: {0}")]
    Store(#[from] StoreError),

    /// Queue name is empty, too long, or contains unsupported characters.
    #[error("Invalid queue name '{name}': {reason}")]
    InvalidQueueName { name: String, reason: String },

    /// Configuration rejected at setup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// The subsystem has already been stopped.
    #[error("Task scheduling has been stopped")]
    Stopped,
}

/// Errors returned to producers enqueuing jobs.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// Payload could not be serialized to JSON.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A pending, retrying or active job already holds the singleton key.
    #[error("Singleton key '{key}' is already held on queue {queue}")]
    SingletonConflict { queue: String, key: String },

    /// Send options are inconsistent.
    #[error("Invalid send options: {0}")]
    InvalidOptions(String),

    /// Store failure.
    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    /// The subsystem has already been stopped.
    #[error("Task scheduling has been stopped")]
    Stopped,
}

/// Payload did not match the schema registered for its queue.
#[derive(Debug, Error)]
pub enum PayloadValidationError {
    /// JSON shape does not deserialize into the expected type.
    #[error("Malformed payload: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Payload deserialized but violates validation rules.
    #[error("Invalid payload: {0}")]
    Invalid(String),
}

/// Outcome of a failed handler execution.
///
/// Absorbed by the dispatcher: it drives the retry or terminal transition
/// and is never returned to a producer.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Handler returned an error.
    #[error("Handler failed: {0}")]
    Failed(String),

    /// Handler was still running when its lease elapsed.
    #[error("Handler timed out after {0:?}")]
    Timeout(Duration),

    /// Handler panicked.
    #[error("Handler panicked: {0}")]
    Panicked(String),

    /// Handler gave up after observing the shutdown signal.
    #[error("Handler cancelled")]
    Cancelled,
}

impl HandlerError {
    /// Creates a failure with the given message.
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            HandlerError::Failed(_) => "failed",
            HandlerError::Timeout(_) => "timeout",
            HandlerError::Panicked(_) => "panicked",
            HandlerError::Cancelled => "cancelled",
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        HandlerError::Failed(format!("{:#}", err))
    }
}

impl From<StoreError> for TaskboxError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Database(e) => TaskboxError::from(e),
            StoreError::Migration(e) => TaskboxError::Database(format!("Migration failed: {}", e)),
            StoreError::Conflict(msg) => TaskboxError::Conflict(msg),
            StoreError::UnknownQueue(queue) => TaskboxError::not_found("Queue", queue),
            StoreError::InvalidJob(msg) => TaskboxError::Validation(msg),
            StoreError::Corrupt(msg) => TaskboxError::Internal(msg),
            StoreError::Closed => TaskboxError::Internal("Job store is closed".to_string()),
        }
    }
}

impl From<SetupError> for TaskboxError {
    fn from(err: SetupError) -> Self {
        match err {
            SetupError::Store(e) => e.into(),
            SetupError::InvalidQueueName { .. } => TaskboxError::Validation(err.to_string()),
            SetupError::Configuration(msg) => TaskboxError::Configuration(msg),
            SetupError::Stopped => TaskboxError::Internal(err.to_string()),
        }
    }
}

impl From<EnqueueError> for TaskboxError {
    fn from(err: EnqueueError) -> Self {
        match err {
            EnqueueError::Serialization(e) => e.into(),
            EnqueueError::SingletonConflict { .. } => TaskboxError::Conflict(err.to_string()),
            EnqueueError::InvalidOptions(msg) => TaskboxError::Validation(msg),
            EnqueueError::Store(e) => e.into(),
            EnqueueError::Stopped => TaskboxError::Internal(err.to_string()),
        }
    }
}

//! Result type aliases for Taskbox.

use crate::TaskboxError;

/// A specialized `Result` type for Taskbox operations.
pub type TaskboxResult<T> = Result<T, TaskboxError>;

//! Queue error model.

use thiserror::Error;

/// Result type used across the queue crates.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-level error.
///
/// Two outcomes that look like failures are deliberately absent: losing a
/// claim race is reported as "nothing claimed", and failing to take a
/// distributed lock within its timeout is reported as `false`.
#[derive(Debug, Error)]
pub enum QueueError {
    /// An unknown work kind/table, or a field set that does not match the
    /// table's columns. Never retried.
    #[error("schema error: {0}")]
    Schema(String),

    /// A stored row could not be mapped back to its work kind.
    #[error("cannot decode {table} row: {message}")]
    Decode { table: String, message: String },

    /// The backing database failed (connection lost, constraint, etc).
    #[error("storage error during {operation}: {message}")]
    Storage { operation: String, message: String },

    /// A work function reported failure.
    #[error("work failed: {0}")]
    Work(String),

    /// The retry helper gave up; wraps the error of the final attempt.
    #[error("all {attempts} attempts failed: {last}")]
    AllRetriesFailed {
        attempts: u32,
        #[source]
        last: Box<QueueError>,
    },

    /// The shared lock cache failed (not a lock timeout).
    #[error("lock cache error: {0}")]
    Lock(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl QueueError {
    pub fn schema(msg: impl Into<String>) -> Self {
        Self::Schema(msg.into())
    }

    pub fn decode(table: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Decode {
            table: table.into(),
            message: msg.into(),
        }
    }

    pub fn storage(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Storage {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    pub fn work(msg: impl Into<String>) -> Self {
        Self::Work(msg.into())
    }

    pub fn lock(msg: impl Into<String>) -> Self {
        Self::Lock(msg.into())
    }

    /// Whether the caller should treat this as fatal rather than transient.
    pub fn is_schema(&self) -> bool {
        matches!(self, QueueError::Schema(_) | QueueError::Decode { .. })
    }
}

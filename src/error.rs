//! Error types for taskqueue
//!
//! Centralized error handling using thiserror.

use thiserror::Error;

use crate::domain::ErrorKind;

/// All error types that can occur in taskqueue
#[derive(Debug, Error)]
pub enum QueueError {
    /// A configuration parameter is missing, mistyped or violates a constraint
    #[error("Validation failed for '{param}': {reason}")]
    Validation { param: String, reason: String },

    /// Unknown task identifier (or task not queued, for position lookups)
    #[error("Task not found: {0}")]
    NotFound(String),

    /// Illegal state transition or mutation of a finalized value
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The task body failed and retries were exhausted
    #[error("Execution failed ({kind}): {message}")]
    Execution { kind: ErrorKind, message: String },

    /// The task exceeded its execution deadline
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The task was cancelled before it could finish
    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// The scheduler no longer accepts submissions
    #[error("Scheduler is shutting down")]
    ShuttingDown,

    /// Task store error
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueueError {
    /// Build a validation error for a named parameter
    pub fn validation(param: impl Into<String>, reason: impl Into<String>) -> Self {
        QueueError::Validation {
            param: param.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias for taskqueue operations
pub type Result<T> = std::result::Result<T, QueueError>;

//! Error types shared across the queue.

use thiserror::Error;

use super::{TaskId, TaskStatus, TaskType};

/// Datastore read/write failure.
///
/// Transient from the dispatcher's point of view: a failed poll tick is
/// simply retried on the next one.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0} not found")]
    NotFound(TaskId),

    #[error("{id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("max_attempts must be at least 1")]
    InvalidMaxAttempts,

    #[error("corrupt row id={id}: {reason}")]
    Corrupt { id: i64, reason: String },
}

/// Failure reported by (or on behalf of) a task handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Business-logic failure (e.g. the provider rejected the file). Retried.
    #[error("{0}")]
    Failed(String),

    /// The payload could not be decoded for this handler. Not retried.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// No handler registered for the task type. Not retried.
    #[error("handler not found for task_type={0}")]
    NotFound(TaskType),
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        HandlerError::Failed(message.into())
    }

    /// Whether another attempt could change the outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandlerError::Failed(_))
    }
}

/// Worker pool lifecycle errors. All of them are programming errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("pool size and capacity must be at least 1 (size={size}, capacity={capacity})")]
    InvalidSize { size: usize, capacity: usize },

    #[error("pool already started")]
    AlreadyStarted,

    #[error("pool not started")]
    NotStarted,

    #[error("pool is shut down")]
    ShutDown,
}

/// Error value returned by a pool job. The pool only logs it.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct JobError(pub String);

impl JobError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<HandlerError> for JobError {
    fn from(err: HandlerError) -> Self {
        Self(err.to_string())
    }
}

impl From<StoreError> for JobError {
    fn from(err: StoreError) -> Self {
        Self(err.to_string())
    }
}

//! Error types for task dispatch

use thiserror::Error;

/// Result type alias for dispatch operations
pub type TaskResult<T> = Result<T, TaskError>;

/// Errors raised by producers, the broker adapters and the worker runtime
#[derive(Error, Debug)]
pub enum TaskError {
    /// A required field was missing or malformed at the producer boundary
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Payload serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The broker could not be reached
    #[error("Broker connection failed: {message}")]
    Connection { message: String },

    /// The broker rejected a submission
    #[error("Enqueue failed: {message}")]
    Enqueue { message: String },

    /// Redis errors not covered by a more specific variant
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// No handler registered for a task type
    #[error("No handler registered for task type: {task_type}")]
    HandlerNotFound { task_type: String },

    /// Broker bookkeeping errors (dequeue, ack, retry, archive)
    #[error("Queue operation failed: {operation}: {reason}")]
    QueueOperation { operation: String, reason: String },

    /// Task not found in the broker
    #[error("Task not found: {task_id}")]
    TaskNotFound { task_id: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// Worker runtime errors
    #[error("Worker error: {message}")]
    Worker { message: String },

    /// Generic errors for wrapping other error types
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TaskError {
    /// Create a validation error
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create an enqueue error
    pub fn enqueue<S: Into<String>>(message: S) -> Self {
        Self::Enqueue {
            message: message.into(),
        }
    }

    /// Create a queue operation error
    pub fn queue_operation<S: Into<String>, R: Into<String>>(operation: S, reason: R) -> Self {
        Self::QueueOperation {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Create a worker error
    pub fn worker<S: Into<String>>(message: S) -> Self {
        Self::Worker {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Map a Redis error, separating an unreachable broker from other failures
    pub fn from_redis(operation: &str, err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            Self::connection(format!("{}: {}", operation, err))
        } else {
            Self::queue_operation(operation, err.to_string())
        }
    }

    /// Check if the error is recoverable (can be retried)
    pub fn is_recoverable(&self) -> bool {
        match self {
            TaskError::Connection { .. } => true,
            TaskError::Redis(_) => true,
            TaskError::QueueOperation { .. } => true,
            TaskError::Worker { .. } => true,
            TaskError::Io(_) => true,
            TaskError::Validation { .. } => false,
            TaskError::Serialization(_) => false,
            TaskError::Enqueue { .. } => false,
            TaskError::HandlerNotFound { .. } => false,
            TaskError::TaskNotFound { .. } => false,
            TaskError::Config { .. } => false,
            TaskError::Internal(_) => false,
        }
    }
}

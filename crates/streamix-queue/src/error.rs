//! Queue error types.

use streamix_models::EnvelopeError;
use thiserror::Error;

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Invalid task: {0}")]
    InvalidTask(#[from] EnvelopeError),

    #[error("Job not found: {0}")]
    JobNotFound(i64),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl QueueError {
    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::ConnectionFailed(msg.into())
    }

    pub fn publish_failed(msg: impl Into<String>) -> Self {
        Self::PublishFailed(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Returns true if the task itself was rejected before any I/O.
    pub fn is_invalid_task(&self) -> bool {
        matches!(self, QueueError::InvalidTask(_))
    }

    /// Returns true for failures to reach or talk to the broker or store.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            QueueError::ConnectionFailed(_)
                | QueueError::PublishFailed(_)
                | QueueError::Redis(_)
                | QueueError::Database(_)
        )
    }
}

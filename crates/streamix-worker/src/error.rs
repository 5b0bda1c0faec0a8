//! Worker error types.

use thiserror::Error;

pub type WorkerResult<T> = Result<T, WorkerError>;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Handler table incomplete: {0}")]
    HandlerTable(String),

    #[error("Component failed: {0}")]
    ComponentFailed(String),

    #[error("Queue error: {0}")]
    Queue(#[from] streamix_queue::QueueError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl WorkerError {
    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::ConfigError(msg.into())
    }

    pub fn handler_table(msg: impl Into<String>) -> Self {
        Self::HandlerTable(msg.into())
    }

    pub fn component_failed(msg: impl Into<String>) -> Self {
        Self::ComponentFailed(msg.into())
    }
}

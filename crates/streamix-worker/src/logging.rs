//! Structured task logging.
//!
//! Every line about a task carries the same fields (`task_type`,
//! `provider_id`, `path`, `source`) so a task can be followed across
//! deliveries in JSON logs.

use std::time::Duration;

use streamix_models::{SyncSummary, TaskEnvelope};
use tracing::{error, info, warn, Span};

/// Logger bound to one task.
#[derive(Debug, Clone)]
pub struct TaskLogger {
    task_type: String,
    provider_id: Option<i64>,
    path: Option<String>,
    /// Queue name or job id the task came from
    source: String,
}

impl TaskLogger {
    pub fn from_envelope(envelope: &TaskEnvelope, source: impl Into<String>) -> Self {
        Self {
            task_type: envelope.task_type().to_string(),
            provider_id: envelope.provider_id(),
            path: envelope.path().map(str::to_string),
            source: source.into(),
        }
    }

    pub fn log_start(&self, attempt: u32) {
        info!(
            task_type = %self.task_type,
            provider_id = ?self.provider_id,
            path = ?self.path,
            source = %self.source,
            attempt,
            "Task started"
        );
    }

    /// Log a successful run with the handler's summary.
    pub fn log_success(&self, summary: &SyncSummary, elapsed: Duration) {
        info!(
            task_type = %self.task_type,
            provider_id = ?self.provider_id,
            path = ?self.path,
            source = %self.source,
            elapsed_ms = elapsed.as_millis() as u64,
            "Task completed: {}", summary
        );
    }

    /// Log a failure that will be attempted again.
    pub fn log_retry(&self, attempt: u32, reason: &str) {
        warn!(
            task_type = %self.task_type,
            provider_id = ?self.provider_id,
            path = ?self.path,
            source = %self.source,
            attempt,
            "Task failed, will retry: {}", reason
        );
    }

    /// Log a failure that ends the task.
    pub fn log_failure(&self, attempt: u32, reason: &str) {
        error!(
            task_type = %self.task_type,
            provider_id = ?self.provider_id,
            path = ?self.path,
            source = %self.source,
            attempt,
            "Task failed permanently: {}", reason
        );
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn create_span(&self) -> Span {
        tracing::info_span!(
            "task",
            task_type = %self.task_type,
            provider_id = ?self.provider_id,
            source = %self.source
        )
    }
}

/// Shorten a payload for logging.
pub fn payload_snippet(payload: &str) -> String {
    const LIMIT: usize = 200;

    if payload.chars().count() <= LIMIT {
        payload.to_string()
    } else {
        let head: String = payload.chars().take(LIMIT).collect();
        format!("{}...", head)
    }
}

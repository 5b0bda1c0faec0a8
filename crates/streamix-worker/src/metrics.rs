//! Prometheus metrics for the worker.

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use streamix_models::TaskType;

use crate::error::{WorkerError, WorkerResult};

/// Install the Prometheus recorder and return the render handle.
pub fn init_metrics() -> WorkerResult<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| WorkerError::config_error(format!("metrics recorder: {}", e)))
}

/// Metric names as constants for consistency.
pub mod names {
    // Task metrics
    pub const TASKS_PROCESSED_TOTAL: &str = "streamix_tasks_processed_total";
    pub const TASK_DURATION_SECONDS: &str = "streamix_task_duration_seconds";

    // Queue metrics
    pub const QUEUE_DEPTH: &str = "streamix_queue_depth";
    pub const STALE_RECOVERED_TOTAL: &str = "streamix_stale_recovered_total";

    // Supervisor metrics
    pub const COMPONENT_RESTARTS_TOTAL: &str = "streamix_component_restarts_total";
}

/// Outcome labels for processed tasks.
pub mod outcome {
    pub const ACKED: &str = "acked";
    pub const REQUEUED: &str = "requeued";
    pub const DEAD_LETTERED: &str = "dead_lettered";
    pub const COMPLETED: &str = "completed";
    pub const RETRIED: &str = "retried";
    pub const DISCARDED: &str = "discarded";
}

/// Label for tags outside the task type table.
pub const UNKNOWN_TASK_TYPE: &str = "unknown";

/// Bounded `type` label for a raw envelope tag.
pub fn task_type_label(tag: &str) -> &'static str {
    tag.parse::<TaskType>()
        .map(|t| t.as_str())
        .unwrap_or(UNKNOWN_TASK_TYPE)
}

/// Record how a task ended.
pub fn record_task_processed(task_type: &str, outcome: &'static str) {
    let labels = [("type", task_type.to_string()), ("outcome", outcome.to_string())];
    counter!(names::TASKS_PROCESSED_TOTAL, &labels).increment(1);
}

/// Record handler wall time.
pub fn record_task_duration(task_type: &str, duration_secs: f64) {
    let labels = [("type", task_type.to_string())];
    histogram!(names::TASK_DURATION_SECONDS, &labels).record(duration_secs);
}

pub fn set_queue_depth(queue: &str, depth: u64) {
    let labels = [("queue", queue.to_string())];
    gauge!(names::QUEUE_DEPTH, &labels).set(depth as f64);
}

/// Record deliveries or jobs taken over from a dead worker.
pub fn record_stale_recovered(source: &str, count: u64) {
    let labels = [("source", source.to_string())];
    counter!(names::STALE_RECOVERED_TOTAL, &labels).increment(count);
}

pub fn record_component_restart(component: &str) {
    let labels = [("component", component.to_string())];
    counter!(names::COMPONENT_RESTARTS_TOTAL, &labels).increment(1);
}

//! Worker configuration.

use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;

use streamix_queue::{redact_url, QueueConfig};
use uuid::Uuid;

/// Worker configuration.
#[derive(Clone)]
pub struct WorkerConfig {
    /// Broker, job store and execution mode settings
    pub queue: QueueConfig,
    /// Unique name of this worker (consumer name and job `attempted_by`)
    pub worker_id: String,
    /// Handler slots per priority pipeline
    pub processor_concurrency: usize,
    /// Handler slots of the direct job pool
    pub fallback_concurrency: usize,
    /// Hard limit on a single handler call
    pub task_timeout: Duration,
    /// Graceful shutdown timeout
    pub shutdown_timeout: Duration,
    /// How long a broker fetch blocks waiting for messages
    pub fetch_block: Duration,
    /// How often to scan for orphaned deliveries and stuck jobs
    pub claim_interval: Duration,
    /// Minimum idle time before a pending delivery can be claimed (crash recovery)
    pub claim_min_idle: Duration,
    /// Job store poll interval when no job is due
    pub poll_interval: Duration,
    /// First retry delay of a failed job; doubles per attempt
    pub retry_base_delay: Duration,
    /// Cap on the job retry delay
    pub retry_max_delay: Duration,
    /// Health server bind address
    pub health_addr: SocketAddr,
    /// Base URL of the sync handler service
    pub sync_handler_url: Option<String>,
}

impl fmt::Debug for WorkerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerConfig")
            .field("queue", &self.queue)
            .field("worker_id", &self.worker_id)
            .field("processor_concurrency", &self.processor_concurrency)
            .field("fallback_concurrency", &self.fallback_concurrency)
            .field("task_timeout", &self.task_timeout)
            .field("shutdown_timeout", &self.shutdown_timeout)
            .field("fetch_block", &self.fetch_block)
            .field("claim_interval", &self.claim_interval)
            .field("claim_min_idle", &self.claim_min_idle)
            .field("poll_interval", &self.poll_interval)
            .field("retry_base_delay", &self.retry_base_delay)
            .field("retry_max_delay", &self.retry_max_delay)
            .field("health_addr", &self.health_addr)
            .field(
                "sync_handler_url",
                &self.sync_handler_url.as_deref().map(redact_url),
            )
            .finish()
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue: QueueConfig::default(),
            worker_id: format!("worker-{}", Uuid::new_v4()),
            processor_concurrency: 5,
            fallback_concurrency: 5,
            task_timeout: Duration::from_secs(900), // 15 minutes
            shutdown_timeout: Duration::from_secs(30),
            fetch_block: Duration::from_secs(1),
            claim_interval: Duration::from_secs(30),
            claim_min_idle: Duration::from_secs(300), // 5 minutes
            poll_interval: Duration::from_secs(1),
            retry_base_delay: Duration::from_secs(15),
            retry_max_delay: Duration::from_secs(3600),
            health_addr: SocketAddr::from(([0, 0, 0, 0], 9100)),
            sync_handler_url: None,
        }
    }
}

impl WorkerConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            queue: QueueConfig::from_env(),
            worker_id: std::env::var("WORKER_ID").unwrap_or(defaults.worker_id),
            processor_concurrency: std::env::var("PROCESSOR_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n >= 1)
                .unwrap_or(defaults.processor_concurrency),
            fallback_concurrency: std::env::var("FALLBACK_CONCURRENCY")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n >= 1)
                .unwrap_or(defaults.fallback_concurrency),
            task_timeout: env_secs("WORKER_TASK_TIMEOUT_SECS").unwrap_or(defaults.task_timeout),
            shutdown_timeout: env_secs("WORKER_SHUTDOWN_TIMEOUT_SECS")
                .unwrap_or(defaults.shutdown_timeout),
            fetch_block: defaults.fetch_block,
            claim_interval: env_secs("WORKER_CLAIM_INTERVAL_SECS")
                .unwrap_or(defaults.claim_interval),
            claim_min_idle: env_secs("WORKER_CLAIM_MIN_IDLE_SECS")
                .unwrap_or(defaults.claim_min_idle),
            poll_interval: std::env::var("FALLBACK_POLL_INTERVAL_MS")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            retry_base_delay: env_secs("FALLBACK_RETRY_BASE_SECS")
                .unwrap_or(defaults.retry_base_delay),
            retry_max_delay: env_secs("FALLBACK_RETRY_MAX_SECS")
                .unwrap_or(defaults.retry_max_delay),
            health_addr: std::env::var("WORKER_HEALTH_ADDR")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.health_addr),
            sync_handler_url: std::env::var("SYNC_HANDLER_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
        }
    }

    /// Jobs executing longer than this are presumed orphaned.
    ///
    /// Always above the task timeout so a live handler is never rescued.
    pub fn stale_job_after(&self) -> Duration {
        self.task_timeout + self.claim_interval
    }
}

fn env_secs(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|s| s.parse().ok())
        .map(Duration::from_secs)
}

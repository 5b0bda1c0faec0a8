//! Queue configuration and topology.

use std::fmt;
use std::time::Duration;

use streamix_models::Priority;
use url::Url;

/// How submitted tasks reach a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Publish to the broker's priority queues.
    Broker,
    /// Insert into the durable job store, polled by an in-process pool.
    #[default]
    Direct,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionMode::Broker => "broker",
            ExecutionMode::Direct => "direct",
        }
    }

    /// Read `QUEUE_BROKER_ENABLED`. Anything but a truthy value selects
    /// the direct mode.
    pub fn from_env() -> Self {
        let enabled = std::env::var("QUEUE_BROKER_ENABLED")
            .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
            .unwrap_or(false);

        if enabled {
            ExecutionMode::Broker
        } else {
            ExecutionMode::Direct
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Queue naming: one durable queue per priority tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    prefix: String,
}

impl Default for QueueTopology {
    fn default() -> Self {
        Self::new("streamix.sync")
    }
}

impl QueueTopology {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Queue for a priority tier, e.g. `streamix.sync.normal`.
    pub fn queue_name(&self, priority: Priority) -> String {
        format!("{}.{}", self.prefix, priority.as_str())
    }

    /// Dead letter queue for a priority tier, e.g. `streamix.sync.normal.dead`.
    pub fn dead_letter_name(&self, priority: Priority) -> String {
        format!("{}.dead", self.queue_name(priority))
    }

    /// All tier queue names, highest priority first.
    pub fn queue_names(&self) -> Vec<String> {
        Priority::ALL.iter().map(|p| self.queue_name(*p)).collect()
    }
}

/// Queue configuration.
///
/// `Debug` masks credentials in the connection URLs.
#[derive(Clone)]
pub struct QueueConfig {
    /// Execution mode
    pub mode: ExecutionMode,
    /// Redis URL
    pub redis_url: String,
    /// Queue name prefix
    pub queue_prefix: String,
    /// Consumer group name
    pub consumer_group: String,
    /// Deliveries allowed per message (initial delivery included)
    pub max_deliveries: u32,
    /// Postgres URL for the job store
    pub database_url: Option<String>,
    /// Attempts per job in direct mode
    pub job_max_attempts: u32,
    /// Connect timeout for the broker and the job store
    pub connect_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            redis_url: "redis://localhost:6379".to_string(),
            queue_prefix: "streamix.sync".to_string(),
            consumer_group: "streamix.workers".to_string(),
            max_deliveries: 2,
            database_url: None,
            job_max_attempts: 5,
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl fmt::Debug for QueueConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueConfig")
            .field("mode", &self.mode)
            .field("redis_url", &redact_url(&self.redis_url))
            .field("queue_prefix", &self.queue_prefix)
            .field("consumer_group", &self.consumer_group)
            .field("max_deliveries", &self.max_deliveries)
            .field("database_url", &self.database_url.as_deref().map(redact_url))
            .field("job_max_attempts", &self.job_max_attempts)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Connection URL with any username and password masked.
pub fn redact_url(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("***"));
            }
            if !url.username().is_empty() {
                let _ = url.set_username("***");
            }
            url.to_string()
        }
        Err(_) => "<unparseable url>".to_string(),
    }
}

impl QueueConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        Self {
            mode: ExecutionMode::from_env(),
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            queue_prefix: std::env::var("QUEUE_PREFIX")
                .unwrap_or_else(|_| "streamix.sync".to_string()),
            consumer_group: std::env::var("QUEUE_CONSUMER_GROUP")
                .unwrap_or_else(|_| "streamix.workers".to_string()),
            max_deliveries: std::env::var("QUEUE_MAX_DELIVERIES")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n >= 1)
                .unwrap_or(2),
            database_url: std::env::var("DATABASE_URL").ok(),
            job_max_attempts: std::env::var("FALLBACK_MAX_ATTEMPTS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n >= 1)
                .unwrap_or(5),
            connect_timeout: Duration::from_secs(
                std::env::var("QUEUE_CONNECT_TIMEOUT")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(10),
            ),
        }
    }

    /// Queue topology derived from the prefix.
    pub fn topology(&self) -> QueueTopology {
        QueueTopology::new(self.queue_prefix.clone())
    }
}

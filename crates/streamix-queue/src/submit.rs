//! Task submission facade.
//!
//! [`SyncQueue`] is the single entry point for scheduling sync work. The
//! execution path is a [`TaskSubmitter`] chosen once when the queue is built:
//! the broker path publishes to a priority queue, the direct path inserts a
//! durable job row. A failed submission is returned to the caller as is; the
//! facade never retries and never switches paths.

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use serde_json::Value;
use streamix_models::{Priority, Provider, TaskEnvelope};
use tracing::{info, warn};

use crate::config::{ExecutionMode, QueueConfig};
use crate::error::QueueResult;
use crate::job_store::{JobId, JobStore};
use crate::pg_store::PgJobStore;
use crate::publisher::Publisher;
use crate::redis_broker::RedisBroker;

const TASKS_SUBMITTED_TOTAL: &str = "streamix_tasks_submitted_total";

/// One way of getting an envelope to a worker.
#[async_trait]
pub trait TaskSubmitter: Send + Sync {
    fn mode(&self) -> ExecutionMode;

    /// Hand the envelope over. Returns the broker message id or job id.
    async fn submit(&self, envelope: &TaskEnvelope, priority: Priority) -> QueueResult<String>;
}

/// Publishes envelopes to the broker's priority queues.
#[derive(Clone)]
pub struct BrokerSubmitter {
    publisher: Publisher,
}

impl BrokerSubmitter {
    pub fn new(publisher: Publisher) -> Self {
        Self { publisher }
    }
}

#[async_trait]
impl TaskSubmitter for BrokerSubmitter {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Broker
    }

    async fn submit(&self, envelope: &TaskEnvelope, priority: Priority) -> QueueResult<String> {
        self.publisher.publish(envelope, priority).await
    }
}

/// Inserts envelopes into the durable job store.
#[derive(Clone)]
pub struct DirectSubmitter {
    store: Arc<dyn JobStore>,
    max_attempts: u32,
}

impl DirectSubmitter {
    pub fn new(store: Arc<dyn JobStore>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Validate and insert a job at normal priority.
    pub async fn enqueue_job(&self, task_type: &str, payload: Value) -> QueueResult<JobId> {
        let envelope = TaskEnvelope::build(task_type, payload)?;
        self.store
            .insert(&envelope, Priority::default(), self.max_attempts)
            .await
    }
}

#[async_trait]
impl TaskSubmitter for DirectSubmitter {
    fn mode(&self) -> ExecutionMode {
        ExecutionMode::Direct
    }

    async fn submit(&self, envelope: &TaskEnvelope, priority: Priority) -> QueueResult<String> {
        let id = self.store.insert(envelope, priority, self.max_attempts).await?;
        Ok(id.to_string())
    }
}

/// Sync task queue facade.
///
/// ```
/// use std::sync::Arc;
/// use serde_json::json;
/// use streamix_models::Priority;
/// use streamix_queue::{MemoryJobStore, SyncQueue};
///
/// # tokio_test::block_on(async {
/// let store = Arc::new(MemoryJobStore::new());
/// let queue = SyncQueue::direct(store.clone(), 5);
///
/// queue
///     .enqueue_sync("iptv_live", json!({ "provider_id": 42 }), Priority::Normal)
///     .await
///     .unwrap();
///
/// assert_eq!(
///     store.payloads().await,
///     vec![r#"{"type":"iptv_live","provider_id":42}"#.to_string()]
/// );
/// # });
/// ```
#[derive(Clone)]
pub struct SyncQueue {
    submitter: Arc<dyn TaskSubmitter>,
}

impl SyncQueue {
    pub fn new(submitter: Arc<dyn TaskSubmitter>) -> Self {
        Self { submitter }
    }

    /// Facade over the broker path.
    pub fn broker(publisher: Publisher) -> Self {
        Self::new(Arc::new(BrokerSubmitter::new(publisher)))
    }

    /// Facade over the direct job path.
    pub fn direct(store: Arc<dyn JobStore>, max_attempts: u32) -> Self {
        Self::new(Arc::new(DirectSubmitter::new(store, max_attempts)))
    }

    /// Connect the backend selected by `config.mode`.
    pub async fn from_config(config: &QueueConfig) -> QueueResult<Self> {
        match config.mode {
            ExecutionMode::Broker => {
                let broker = RedisBroker::connect(config).await?;
                let publisher = Publisher::new(Arc::new(broker), config.topology());
                publisher.init().await?;
                info!(prefix = %config.queue_prefix, "Sync queue using broker");
                Ok(Self::broker(publisher))
            }
            ExecutionMode::Direct => {
                let store = PgJobStore::connect(config).await?;
                store.migrate().await?;
                info!("Sync queue using direct job store");
                Ok(Self::direct(Arc::new(store), config.job_max_attempts))
            }
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.submitter.mode()
    }

    /// Schedule one sync task. The envelope is validated before any I/O, so
    /// an unknown type or bad payload never reaches the broker or the store.
    pub async fn enqueue_sync(
        &self,
        task_type: &str,
        payload: Value,
        priority: Priority,
    ) -> QueueResult<()> {
        let envelope = TaskEnvelope::build(task_type, payload)?;
        self.enqueue(&envelope, priority).await
    }

    /// Schedule an already-built envelope.
    pub async fn enqueue(&self, envelope: &TaskEnvelope, priority: Priority) -> QueueResult<()> {
        let mode = self.submitter.mode();
        let id = self.submitter.submit(envelope, priority).await?;

        let labels = [
            ("mode", mode.as_str().to_string()),
            ("type", envelope.task_type().to_string()),
        ];
        counter!(TASKS_SUBMITTED_TOTAL, &labels).increment(1);

        info!(
            mode = %mode,
            task_type = %envelope.task_type(),
            priority = %priority,
            id = %id,
            provider_id = ?envelope.provider_id(),
            path = ?envelope.path(),
            "Enqueued sync task"
        );
        Ok(())
    }

    /// Fan a provider sync out into independent sub-tasks at normal priority.
    pub async fn enqueue_provider_sync(&self, provider: &Provider) -> QueueResult<()> {
        self.enqueue_provider_sync_with_priority(provider, Priority::default())
            .await
    }

    /// Fan-out at an explicit priority. Every sub-task is attempted; the
    /// first error is returned once all have been tried.
    pub async fn enqueue_provider_sync_with_priority(
        &self,
        provider: &Provider,
        priority: Priority,
    ) -> QueueResult<()> {
        let envelopes = provider.sync_envelopes();
        let total = envelopes.len();
        let mut first_error = None;
        let mut failed = 0;

        for envelope in &envelopes {
            if let Err(e) = self.enqueue(envelope, priority).await {
                warn!(
                    provider_id = provider.id(),
                    task_type = %envelope.task_type(),
                    path = ?envelope.path(),
                    "Failed to enqueue sub-task: {}",
                    e
                );
                failed += 1;
                first_error.get_or_insert(e);
            }
        }

        info!(
            provider_id = provider.id(),
            total,
            failed,
            "Provider sync fan-out submitted"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

//! Envelope publisher.

use std::sync::Arc;

use streamix_models::{Priority, TaskEnvelope};
use tracing::debug;

use crate::broker::MessageBroker;
use crate::config::QueueTopology;
use crate::error::QueueResult;

/// Serializes envelopes and routes them to the queue of their priority tier.
///
/// Publishing is fire-and-forget: it returns once the broker accepted the
/// message, not once a consumer processed it.
#[derive(Clone)]
pub struct Publisher {
    broker: Arc<dyn MessageBroker>,
    topology: QueueTopology,
}

impl Publisher {
    pub fn new(broker: Arc<dyn MessageBroker>, topology: QueueTopology) -> Self {
        Self { broker, topology }
    }

    /// Create every tier queue on the broker.
    pub async fn init(&self) -> QueueResult<()> {
        for queue in self.topology.queue_names() {
            self.broker.ensure_queue(&queue).await?;
        }
        Ok(())
    }

    /// Publish an envelope at the given priority. Returns the broker message id.
    pub async fn publish(&self, envelope: &TaskEnvelope, priority: Priority) -> QueueResult<String> {
        let body = envelope.encode()?;
        let queue = self.topology.queue_name(priority);

        let message_id = self.broker.send(&queue, &body, 1).await?;

        debug!(
            queue = %queue,
            message_id = %message_id,
            task_type = %envelope.task_type(),
            "Published task"
        );
        Ok(message_id)
    }

    pub fn topology(&self) -> &QueueTopology {
        &self.topology
    }

    pub fn broker(&self) -> &Arc<dyn MessageBroker> {
        &self.broker
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use streamix_models::TaskType;

    #[tokio::test]
    async fn test_publish_routes_by_priority() {
        let broker = Arc::new(MemoryBroker::new());
        let publisher = Publisher::new(broker.clone(), QueueTopology::default());

        let envelope = TaskEnvelope::for_provider(TaskType::IptvLive, 42);
        publisher.publish(&envelope, Priority::Normal).await.unwrap();
        publisher.publish(&envelope, Priority::High).await.unwrap();

        let sent = broker.sent().await;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].queue, "streamix.sync.normal");
        assert_eq!(sent[0].payload, r#"{"type":"iptv_live","provider_id":42}"#);
        assert_eq!(sent[0].attempt, 1);
        assert_eq!(sent[1].queue, "streamix.sync.high");
    }

    #[tokio::test]
    async fn test_publish_surfaces_transport_errors() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_unavailable(true).await;
        let publisher = Publisher::new(broker, QueueTopology::default());

        let err = publisher
            .publish(&TaskEnvelope::for_provider(TaskType::IptvLive, 1), Priority::Low)
            .await
            .unwrap_err();
        assert!(err.is_transport());
    }
}

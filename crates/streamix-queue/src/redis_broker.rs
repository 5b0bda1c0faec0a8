//! Broker transport over Redis Streams.
//!
//! Each priority queue is a stream read through a consumer group. A stream
//! entry carries two fields: `payload` (the encoded envelope) and `attempt`
//! (the delivery attempt, starting at 1). Requeueing appends a new entry
//! with the next attempt and removes the old one, so an entry is never
//! rewritten in place. Claiming a stale entry also advances its attempt by
//! the number of times it was already delivered.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamClaimReply, StreamId, StreamPendingCountReply, StreamReadReply};
use redis::AsyncCommands;
use tracing::{debug, info, warn};

use crate::broker::{Delivery, MessageBroker};
use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};

const PAYLOAD_FIELD: &str = "payload";
const ATTEMPT_FIELD: &str = "attempt";

/// Redis Streams broker client.
///
/// Short commands share one reconnecting connection. Blocking reads open
/// their own multiplexed connection so they never stall acks queued behind
/// them.
#[derive(Clone)]
pub struct RedisBroker {
    client: redis::Client,
    conn: ConnectionManager,
    consumer_group: String,
}

impl RedisBroker {
    /// Connect to Redis using the queue configuration.
    pub async fn connect(config: &QueueConfig) -> QueueResult<Self> {
        let client = redis::Client::open(config.redis_url.as_str())?;

        let conn = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| {
                QueueError::connection_failed(format!(
                    "Redis did not answer within {:?}",
                    config.connect_timeout
                ))
            })??;

        Ok(Self {
            client,
            conn,
            consumer_group: config.consumer_group.clone(),
        })
    }

    /// Connect using environment variables.
    pub async fn from_env() -> QueueResult<Self> {
        Self::connect(&QueueConfig::from_env()).await
    }

    fn to_delivery(&self, queue: &str, entry: &StreamId) -> Delivery {
        let payload = entry.get::<String>(PAYLOAD_FIELD).unwrap_or_else(|| {
            warn!(
                queue = %queue,
                message_id = %entry.id,
                "Stream entry has no payload field"
            );
            String::new()
        });

        Delivery {
            id: entry.id.clone(),
            queue: queue.to_string(),
            payload,
            attempt: entry.get::<u32>(ATTEMPT_FIELD).unwrap_or(1).max(1),
        }
    }
}

#[async_trait]
impl MessageBroker for RedisBroker {
    async fn ensure_queue(&self, queue: &str) -> QueueResult<()> {
        let mut conn = self.conn.clone();

        // Start at 0 so messages published before the group existed are consumed.
        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(queue)
            .arg(&self.consumer_group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => info!("Created consumer group {} on {}", self.consumer_group, queue),
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("Consumer group already exists on {}", queue);
            }
            Err(e) => return Err(QueueError::Redis(e)),
        }

        Ok(())
    }

    async fn send(&self, queue: &str, payload: &str, attempt: u32) -> QueueResult<String> {
        let mut conn = self.conn.clone();

        let message_id: String = redis::cmd("XADD")
            .arg(queue)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(payload)
            .arg(ATTEMPT_FIELD)
            .arg(attempt)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::publish_failed(format!("XADD to {} failed: {}", queue, e)))?;

        debug!(queue = %queue, message_id = %message_id, attempt, "Appended message");
        Ok(message_id)
    }

    async fn fetch(
        &self,
        queue: &str,
        consumer: &str,
        max: usize,
        block: Duration,
    ) -> QueueResult<Vec<Delivery>> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.client.get_multiplexed_async_connection().await?;

        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.consumer_group)
            .arg(consumer)
            .arg("COUNT")
            .arg(max)
            .arg("BLOCK")
            .arg(block.as_millis() as u64)
            .arg("STREAMS")
            .arg(queue)
            .arg(">") // Only new messages
            .query_async(&mut conn)
            .await?;

        let deliveries = reply
            .map(|reply| {
                reply
                    .keys
                    .iter()
                    .flat_map(|key| key.ids.iter().map(|entry| self.to_delivery(queue, entry)))
                    .collect()
            })
            .unwrap_or_default();

        Ok(deliveries)
    }

    async fn claim_stale(
        &self,
        queue: &str,
        consumer: &str,
        min_idle: Duration,
        max: usize,
    ) -> QueueResult<Vec<Delivery>> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let min_idle_ms = min_idle.as_millis() as u64;

        let pending: StreamPendingCountReply = redis::cmd("XPENDING")
            .arg(queue)
            .arg(&self.consumer_group)
            .arg("IDLE")
            .arg(min_idle_ms)
            .arg("-")
            .arg("+")
            .arg(max)
            .query_async(&mut conn)
            .await?;

        if pending.ids.is_empty() {
            return Ok(Vec::new());
        }

        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(queue)
            .arg(&self.consumer_group)
            .arg(consumer)
            .arg(min_idle_ms);
        for entry in &pending.ids {
            cmd.arg(&entry.id);
        }

        let claimed: StreamClaimReply = cmd.query_async(&mut conn).await?;

        // Each earlier delivery of the entry used up one attempt.
        let times_delivered: HashMap<&str, usize> = pending
            .ids
            .iter()
            .map(|p| (p.id.as_str(), p.times_delivered))
            .collect();

        let deliveries: Vec<Delivery> = claimed
            .ids
            .iter()
            .map(|entry| {
                let mut delivery = self.to_delivery(queue, entry);
                let earlier = times_delivered.get(entry.id.as_str()).copied().unwrap_or(1);
                delivery.attempt = delivery.attempt.saturating_add(earlier.max(1) as u32);
                delivery
            })
            .collect();

        if !deliveries.is_empty() {
            info!(queue = %queue, count = deliveries.len(), "Claimed stale deliveries");
        }

        Ok(deliveries)
    }

    async fn touch(&self, delivery: &Delivery, consumer: &str) -> QueueResult<()> {
        let mut conn = self.conn.clone();

        // XCLAIM with zero idle resets the idle time; JUSTID keeps the
        // delivery counter untouched.
        redis::cmd("XCLAIM")
            .arg(&delivery.queue)
            .arg(&self.consumer_group)
            .arg(consumer)
            .arg(0)
            .arg(&delivery.id)
            .arg("JUSTID")
            .query_async::<()>(&mut conn)
            .await?;

        Ok(())
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut conn = self.conn.clone();

        redis::pipe()
            .atomic()
            .cmd("XACK")
            .arg(&delivery.queue)
            .arg(&self.consumer_group)
            .arg(&delivery.id)
            .ignore()
            .cmd("XDEL")
            .arg(&delivery.queue)
            .arg(&delivery.id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        debug!(queue = %delivery.queue, message_id = %delivery.id, "Acknowledged message");
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut conn = self.conn.clone();

        redis::pipe()
            .atomic()
            .cmd("XADD")
            .arg(&delivery.queue)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(&delivery.payload)
            .arg(ATTEMPT_FIELD)
            .arg(delivery.attempt + 1)
            .ignore()
            .cmd("XACK")
            .arg(&delivery.queue)
            .arg(&self.consumer_group)
            .arg(&delivery.id)
            .ignore()
            .cmd("XDEL")
            .arg(&delivery.queue)
            .arg(&delivery.id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        debug!(
            queue = %delivery.queue,
            message_id = %delivery.id,
            next_attempt = delivery.attempt + 1,
            "Requeued message"
        );
        Ok(())
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        dead_letter_queue: &str,
        reason: &str,
    ) -> QueueResult<()> {
        let mut conn = self.conn.clone();

        redis::pipe()
            .atomic()
            .cmd("XADD")
            .arg(dead_letter_queue)
            .arg("*")
            .arg(PAYLOAD_FIELD)
            .arg(&delivery.payload)
            .arg(ATTEMPT_FIELD)
            .arg(delivery.attempt)
            .arg("error")
            .arg(reason)
            .arg("original_id")
            .arg(&delivery.id)
            .arg("original_queue")
            .arg(&delivery.queue)
            .ignore()
            .cmd("XACK")
            .arg(&delivery.queue)
            .arg(&self.consumer_group)
            .arg(&delivery.id)
            .ignore()
            .cmd("XDEL")
            .arg(&delivery.queue)
            .arg(&delivery.id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        warn!(
            queue = %delivery.queue,
            message_id = %delivery.id,
            dead_letter_queue = %dead_letter_queue,
            "Moved message to dead letter queue: {}",
            reason
        );
        Ok(())
    }

    async fn depth(&self, queue: &str) -> QueueResult<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.xlen(queue).await?;
        Ok(len)
    }

    async fn health_check(&self) -> QueueResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn provider_name(&self) -> &'static str {
        "redis"
    }
}

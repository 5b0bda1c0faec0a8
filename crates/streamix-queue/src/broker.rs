//! Broker transport abstraction.
//!
//! The core only needs a handful of primitives from a broker: send a body
//! to a named queue, pull deliveries as a consumer group member, and settle
//! each delivery by ack, requeue or dead-letter. Queue naming and envelope
//! encoding stay outside the transport.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::QueueResult;

/// A message handed to a consumer.
///
/// Delivery metadata is opaque to the pipeline apart from `attempt`, which
/// drives the requeue-once policy. It is passed back untouched to settle
/// the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Broker-assigned message id (delivery tag)
    pub id: String,
    /// Queue the message was read from
    pub queue: String,
    /// Raw message body
    pub payload: String,
    /// 1 for the first delivery, incremented on every requeue
    pub attempt: u32,
}

/// Transport counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub sent: u64,
    pub delivered: u64,
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
}

#[async_trait]
pub trait MessageBroker: Send + Sync + 'static {
    /// Create the queue and its consumer group if missing.
    async fn ensure_queue(&self, queue: &str) -> QueueResult<()>;

    /// Append a durable message. Returns the broker message id.
    async fn send(&self, queue: &str, payload: &str, attempt: u32) -> QueueResult<String>;

    /// Read at most `max` new messages for `consumer`, waiting up to `block`.
    async fn fetch(
        &self,
        queue: &str,
        consumer: &str,
        max: usize,
        block: Duration,
    ) -> QueueResult<Vec<Delivery>>;

    /// Take over messages left unsettled by another consumer for at least
    /// `min_idle`. A claimed delivery carries the next attempt number, since
    /// the abandoned delivery already used one.
    async fn claim_stale(
        &self,
        queue: &str,
        consumer: &str,
        min_idle: Duration,
        max: usize,
    ) -> QueueResult<Vec<Delivery>>;

    /// Reset the idle clock of a delivery still being processed so it is
    /// not claimed as stale.
    async fn touch(&self, delivery: &Delivery, consumer: &str) -> QueueResult<()>;

    /// Settle a delivery as processed.
    async fn ack(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Redeliver later: a fresh message with `attempt + 1` replaces this one.
    async fn requeue(&self, delivery: &Delivery) -> QueueResult<()>;

    /// Move a delivery to `dead_letter_queue`, recording `reason`.
    async fn dead_letter(
        &self,
        delivery: &Delivery,
        dead_letter_queue: &str,
        reason: &str,
    ) -> QueueResult<()>;

    /// Number of messages in a queue.
    async fn depth(&self, queue: &str) -> QueueResult<u64>;

    /// Round-trip to the broker.
    async fn health_check(&self) -> QueueResult<()>;

    fn provider_name(&self) -> &'static str;
}

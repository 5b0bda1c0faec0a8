//! In-memory broker for tests and single-process development.
//!
//! Mirrors the Redis Streams semantics the pipeline relies on: each queue is
//! FIFO, fetched messages stay pending until settled, requeueing appends a
//! new message with the next attempt, claiming a stale message counts as a
//! new attempt, and dead letters are kept per queue.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::broker::{BrokerStats, Delivery, MessageBroker};
use crate::error::{QueueError, QueueResult};

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    payload: String,
    attempt: u32,
}

#[derive(Debug)]
struct PendingMessage {
    delivery: Delivery,
    consumer: String,
    delivered_at: Instant,
}

/// A message moved to a dead letter queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub original_id: String,
    pub original_queue: String,
    pub payload: String,
    pub attempt: u32,
    pub reason: String,
}

/// A message accepted by [`MemoryBroker::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub queue: String,
    pub payload: String,
    pub attempt: u32,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    queues: HashMap<String, VecDeque<StoredMessage>>,
    pending: HashMap<String, PendingMessage>,
    dead: HashMap<String, Vec<DeadLetter>>,
    sent: Vec<SentMessage>,
    stats: BrokerStats,
    unavailable: bool,
}

impl State {
    fn next_id(&mut self) -> String {
        self.next_id += 1;
        format!("{}-0", self.next_id)
    }

    fn push(&mut self, queue: &str, payload: &str, attempt: u32) -> String {
        let id = self.next_id();
        self.queues
            .entry(queue.to_string())
            .or_default()
            .push_back(StoredMessage {
                id: id.clone(),
                payload: payload.to_string(),
                attempt,
            });
        id
    }

    fn settle(&mut self, delivery: &Delivery) -> QueueResult<PendingMessage> {
        self.pending.remove(&delivery.id).ok_or_else(|| {
            QueueError::publish_failed(format!("Message {} is not pending", delivery.id))
        })
    }

    fn check_available(&self) -> QueueResult<()> {
        if self.unavailable {
            Err(QueueError::connection_failed("In-memory broker is unavailable"))
        } else {
            Ok(())
        }
    }
}

/// In-memory implementation of [`MessageBroker`].
#[derive(Debug, Default)]
pub struct MemoryBroker {
    state: Mutex<State>,
    arrivals: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate a broker outage: every call fails until restored.
    pub async fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().await.unavailable = unavailable;
    }

    /// Every message accepted by `send`, in order. Requeues are not included.
    pub async fn sent(&self) -> Vec<SentMessage> {
        self.state.lock().await.sent.clone()
    }

    /// Dead letters recorded for a dead letter queue.
    pub async fn dead_letters(&self, dead_letter_queue: &str) -> Vec<DeadLetter> {
        self.state
            .lock()
            .await
            .dead
            .get(dead_letter_queue)
            .cloned()
            .unwrap_or_default()
    }

    /// Messages delivered but not yet settled.
    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Unsettled messages currently owned by `consumer`.
    pub async fn pending_for(&self, consumer: &str) -> usize {
        self.state
            .lock()
            .await
            .pending
            .values()
            .filter(|p| p.consumer == consumer)
            .count()
    }

    pub async fn stats(&self) -> BrokerStats {
        self.state.lock().await.stats
    }

    fn take_ready(state: &mut State, queue: &str, consumer: &str, max: usize) -> Vec<Delivery> {
        let Some(messages) = state.queues.get_mut(queue) else {
            return Vec::new();
        };

        let count = max.min(messages.len());
        let taken: Vec<StoredMessage> = messages.drain(..count).collect();

        let deliveries: Vec<Delivery> = taken
            .into_iter()
            .map(|message| Delivery {
                id: message.id,
                queue: queue.to_string(),
                payload: message.payload,
                attempt: message.attempt,
            })
            .collect();

        for delivery in &deliveries {
            state.pending.insert(
                delivery.id.clone(),
                PendingMessage {
                    delivery: delivery.clone(),
                    consumer: consumer.to_string(),
                    delivered_at: Instant::now(),
                },
            );
        }
        state.stats.delivered += deliveries.len() as u64;

        deliveries
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn ensure_queue(&self, queue: &str) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        state.queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn send(&self, queue: &str, payload: &str, attempt: u32) -> QueueResult<String> {
        let id = {
            let mut state = self.state.lock().await;
            state.check_available()?;
            let id = state.push(queue, payload, attempt);
            state.sent.push(SentMessage {
                queue: queue.to_string(),
                payload: payload.to_string(),
                attempt,
            });
            state.stats.sent += 1;
            id
        };
        self.arrivals.notify_waiters();
        Ok(id)
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

        // Register interest before checking so an arrival in between is not missed.
        let arrival = self.arrivals.notified();
        tokio::pin!(arrival);
        arrival.as_mut().enable();

        {
            let mut state = self.state.lock().await;
            state.check_available()?;
            let deliveries = Self::take_ready(&mut state, queue, consumer, max);
            if !deliveries.is_empty() {
                return Ok(deliveries);
            }
        }

        let _ = tokio::time::timeout(block, arrival).await;

        let mut state = self.state.lock().await;
        state.check_available()?;
        Ok(Self::take_ready(&mut state, queue, consumer, max))
    }

    async fn claim_stale(
        &self,
        queue: &str,
        consumer: &str,
        min_idle: Duration,
        max: usize,
    ) -> QueueResult<Vec<Delivery>> {
        let mut state = self.state.lock().await;
        state.check_available()?;

        let mut claimed: Vec<Delivery> = Vec::new();
        for pending in state.pending.values_mut() {
            if claimed.len() >= max {
                break;
            }
            if pending.delivery.queue == queue && pending.delivered_at.elapsed() >= min_idle {
                pending.consumer = consumer.to_string();
                pending.delivered_at = Instant::now();
                pending.delivery.attempt += 1;
                claimed.push(pending.delivery.clone());
            }
        }
        claimed.sort_by(|a, b| a.id.cmp(&b.id));

        Ok(claimed)
    }

    async fn touch(&self, delivery: &Delivery, consumer: &str) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        if let Some(pending) = state.pending.get_mut(&delivery.id) {
            pending.consumer = consumer.to_string();
            pending.delivered_at = Instant::now();
        }
        Ok(())
    }

    async fn ack(&self, delivery: &Delivery) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        state.settle(delivery)?;
        state.stats.acked += 1;
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery) -> QueueResult<()> {
        {
            let mut state = self.state.lock().await;
            state.check_available()?;
            state.settle(delivery)?;
            state.push(&delivery.queue, &delivery.payload, delivery.attempt + 1);
            state.stats.requeued += 1;
        }
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn dead_letter(
        &self,
        delivery: &Delivery,
        dead_letter_queue: &str,
        reason: &str,
    ) -> QueueResult<()> {
        let mut state = self.state.lock().await;
        state.check_available()?;
        state.settle(delivery)?;
        state
            .dead
            .entry(dead_letter_queue.to_string())
            .or_default()
            .push(DeadLetter {
                original_id: delivery.id.clone(),
                original_queue: delivery.queue.clone(),
                payload: delivery.payload.clone(),
                attempt: delivery.attempt,
                reason: reason.to_string(),
            });
        state.stats.dead_lettered += 1;
        Ok(())
    }

    async fn depth(&self, queue: &str) -> QueueResult<u64> {
        let state = self.state.lock().await;
        state.check_available()?;
        let ready = state.queues.get(queue).map_or(0, VecDeque::len);
        let pending = state
            .pending
            .values()
            .filter(|p| p.delivery.queue == queue)
            .count();
        Ok((ready + pending) as u64)
    }

    async fn health_check(&self) -> QueueResult<()> {
        self.state.lock().await.check_available()
    }

    fn provider_name(&self) -> &'static str {
        "memory"
    }
}

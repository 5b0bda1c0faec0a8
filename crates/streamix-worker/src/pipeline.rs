//! Consumer pipeline for one priority queue.
//!
//! A pipeline owns a fixed number of handler slots. It only fetches as many
//! messages as it has free slots, so the broker never hands it more
//! unsettled messages than it can run. Every delivery ends in exactly one
//! of ack, requeue or dead-letter.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use streamix_models::{Priority, SyncSummary, TaskEnvelope};
use streamix_queue::{Delivery, MessageBroker, QueueResult, QueueTopology};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn, Instrument};

use crate::config::WorkerConfig;
use crate::dispatch::{decode, DispatchError, Dispatcher};
use crate::error::{WorkerError, WorkerResult};
use crate::logging::{payload_snippet, TaskLogger};
use crate::metrics::{self, outcome};
use crate::retry::{Backoff, FailureTracker};
use crate::supervisor::Component;

/// Metrics label for payloads that never decoded to a task type.
const UNDECODABLE: &str = "undecodable";

/// How a delivery was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Acked,
    Requeued,
    DeadLettered,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Disposition::Acked => outcome::ACKED,
            Disposition::Requeued => outcome::REQUEUED,
            Disposition::DeadLettered => outcome::DEAD_LETTERED,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    /// Handler slots
    pub concurrency: usize,
    /// Deliveries allowed per message, initial delivery included
    pub max_deliveries: u32,
    pub fetch_block: Duration,
    pub claim_interval: Duration,
    pub claim_min_idle: Duration,
    pub shutdown_timeout: Duration,
}

impl PipelineSettings {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            concurrency: config.processor_concurrency,
            max_deliveries: config.queue.max_deliveries,
            fetch_block: config.fetch_block,
            claim_interval: config.claim_interval,
            claim_min_idle: config.claim_min_idle,
            shutdown_timeout: config.shutdown_timeout,
        }
    }

    /// Idle-clock refresh period for deliveries being processed.
    fn heartbeat_interval(&self) -> Duration {
        (self.claim_min_idle / 3).max(Duration::from_secs(1))
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default())
    }
}

#[derive(Clone)]
pub struct ConsumerPipeline {
    broker: Arc<dyn MessageBroker>,
    dispatcher: Dispatcher,
    priority: Priority,
    queue: String,
    dead_letter_queue: String,
    consumer: String,
    settings: PipelineSettings,
    slots: Arc<Semaphore>,
}

impl ConsumerPipeline {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        dispatcher: Dispatcher,
        topology: &QueueTopology,
        priority: Priority,
        worker_id: &str,
        mut settings: PipelineSettings,
    ) -> Self {
        settings.concurrency = settings.concurrency.max(1);
        settings.max_deliveries = settings.max_deliveries.max(1);

        Self {
            broker,
            dispatcher,
            priority,
            queue: topology.queue_name(priority),
            dead_letter_queue: topology.dead_letter_name(priority),
            consumer: format!("{}-{}", worker_id, priority),
            slots: Arc::new(Semaphore::new(settings.concurrency)),
            settings,
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn dead_letter_queue(&self) -> &str {
        &self.dead_letter_queue
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    /// Handlers currently running.
    pub fn in_flight(&self) -> usize {
        self.settings.concurrency - self.slots.available_permits()
    }

    /// Decode, dispatch and settle one delivery.
    ///
    /// An error means the delivery could not be settled; it stays pending
    /// on the broker and is claimed again once idle.
    pub async fn process_delivery(&self, delivery: &Delivery) -> QueueResult<Disposition> {
        let envelope = match decode(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(
                    queue = %delivery.queue,
                    message_id = %delivery.id,
                    payload = %payload_snippet(&delivery.payload),
                    "Dead-lettering undecodable message: {}",
                    e
                );
                self.broker
                    .dead_letter(delivery, &self.dead_letter_queue, &e.to_string())
                    .await?;
                metrics::record_task_processed(UNDECODABLE, outcome::DEAD_LETTERED);
                return Ok(Disposition::DeadLettered);
            }
        };

        let logger = TaskLogger::from_envelope(&envelope, &delivery.queue);

        // A claimed delivery whose earlier attempts died mid-handler.
        if delivery.attempt > self.settings.max_deliveries {
            let reason = format!(
                "delivery_limit_exceeded: attempt {} of {}",
                delivery.attempt, self.settings.max_deliveries
            );
            logger.log_failure(delivery.attempt, &reason);
            self.broker
                .dead_letter(delivery, &self.dead_letter_queue, &reason)
                .await?;
            metrics::record_task_processed(
                metrics::task_type_label(logger.task_type()),
                outcome::DEAD_LETTERED,
            );
            return Ok(Disposition::DeadLettered);
        }

        logger.log_start(delivery.attempt);
        let started = Instant::now();

        let result = self
            .dispatch_with_heartbeat(delivery, &envelope)
            .instrument(logger.create_span())
            .await;

        let disposition = match result {
            Ok(summary) => {
                self.broker.ack(delivery).await?;
                logger.log_success(&summary, started.elapsed());
                Disposition::Acked
            }
            Err(e) if e.is_permanent() || delivery.attempt >= self.settings.max_deliveries => {
                let reason = e.to_string();
                logger.log_failure(delivery.attempt, &reason);
                self.broker
                    .dead_letter(delivery, &self.dead_letter_queue, &reason)
                    .await?;
                Disposition::DeadLettered
            }
            Err(e) => {
                logger.log_retry(delivery.attempt, &e.to_string());
                self.broker.requeue(delivery).await?;
                Disposition::Requeued
            }
        };

        metrics::record_task_processed(
            metrics::task_type_label(logger.task_type()),
            disposition.as_str(),
        );
        Ok(disposition)
    }

    /// Run the handler while periodically refreshing the delivery's idle
    /// clock so other consumers do not claim it.
    async fn dispatch_with_heartbeat(
        &self,
        delivery: &Delivery,
        envelope: &TaskEnvelope,
    ) -> Result<SyncSummary, DispatchError> {
        let dispatch = self.dispatcher.dispatch(envelope);
        tokio::pin!(dispatch);

        let period = self.settings.heartbeat_interval();
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            tokio::select! {
                result = &mut dispatch => return result,
                _ = heartbeat.tick() => {
                    if let Err(e) = self.broker.touch(delivery, &self.consumer).await {
                        warn!(message_id = %delivery.id, "Failed to refresh delivery: {}", e);
                    }
                }
            }
        }
    }

    /// Wait for one free slot, then take every other free slot.
    async fn acquire_slots(&self) -> WorkerResult<Vec<OwnedSemaphorePermit>> {
        let first = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::component_failed("pipeline slots closed"))?;

        let mut permits = vec![first];
        while let Ok(permit) = self.slots.clone().try_acquire_owned() {
            permits.push(permit);
        }
        Ok(permits)
    }

    /// Fetch at most as many messages as there are free slots.
    async fn fetch_into(&self, permits: Vec<OwnedSemaphorePermit>) -> WorkerResult<usize> {
        let deliveries = self
            .broker
            .fetch(
                &self.queue,
                &self.consumer,
                permits.len(),
                self.settings.fetch_block,
            )
            .await?;

        let count = deliveries.len();
        if count > 0 {
            debug!(queue = %self.queue, count, "Fetched deliveries");
        }

        for (delivery, permit) in deliveries.into_iter().zip(permits) {
            self.spawn_delivery(delivery, permit);
        }
        Ok(count)
    }

    /// Take over deliveries orphaned by a dead consumer.
    ///
    /// Queues for a slot like the fetch loop; the semaphore is fair, so the
    /// claim runs as soon as the current fetch releases its slots.
    async fn claim_stale(&self) -> WorkerResult<usize> {
        let permits = self.acquire_slots().await?;

        let claimed = self
            .broker
            .claim_stale(
                &self.queue,
                &self.consumer,
                self.settings.claim_min_idle,
                permits.len(),
            )
            .await?;

        let count = claimed.len();
        if count > 0 {
            info!(queue = %self.queue, count, "Recovered stale deliveries");
            metrics::record_stale_recovered("broker", count as u64);
        }

        for (delivery, permit) in claimed.into_iter().zip(permits) {
            self.spawn_delivery(delivery, permit);
        }
        Ok(count)
    }

    fn spawn_delivery(&self, delivery: Delivery, permit: OwnedSemaphorePermit) {
        let pipeline = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = pipeline.process_delivery(&delivery).await {
                error!(
                    queue = %delivery.queue,
                    message_id = %delivery.id,
                    "Failed to settle delivery, leaving it pending: {}",
                    e
                );
            }
        });
    }

    fn spawn_claim_task(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let pipeline = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(pipeline.settings.claim_interval);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        if let Err(e) = pipeline.claim_stale().await {
                            warn!(queue = %pipeline.queue, "Failed to claim stale deliveries: {}", e);
                        }
                        match pipeline.broker.depth(&pipeline.queue).await {
                            Ok(depth) => metrics::set_queue_depth(&pipeline.queue, depth),
                            Err(e) => debug!(queue = %pipeline.queue, "Failed to read queue depth: {}", e),
                        }
                    }
                }
            }
        })
    }

    /// Consume until shutdown, then wait for in-flight handlers.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> WorkerResult<()> {
        self.broker.ensure_queue(&self.queue).await?;

        info!(
            "Starting pipeline '{}' on {} with {} slots",
            self.consumer, self.queue, self.settings.concurrency
        );

        let claim_task = self.spawn_claim_task(shutdown.clone());
        let mut failures = FailureTracker::new(3);
        let backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(5));

        while !*shutdown.borrow() {
            let permits = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
                permits = self.acquire_slots() => match permits {
                    Ok(permits) => permits,
                    Err(e) => {
                        claim_task.abort();
                        return Err(e);
                    }
                },
            };

            // Runs to completion: the broker may deliver even if the read
            // is dropped, and those deliveries need a slot. Bounded by
            // `fetch_block`.
            match self.fetch_into(permits).await {
                Ok(_) => failures.record_success(),
                Err(e) => {
                    if failures.record_failure() {
                        error!(queue = %self.queue, "Error fetching from queue: {}", e);
                    }
                    let delay = backoff.delay_for_attempt(failures.failure_count() - 1);
                    tokio::select! {
                        _ = shutdown.changed() => {}
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        claim_task.abort();
        self.drain().await;
        info!(queue = %self.queue, "Pipeline stopped");
        Ok(())
    }

    async fn drain(&self) {
        let in_flight = self.in_flight();
        if in_flight > 0 {
            info!(queue = %self.queue, in_flight, "Waiting for in-flight tasks to complete");
        }

        let all = self.settings.concurrency as u32;
        match tokio::time::timeout(self.settings.shutdown_timeout, self.slots.acquire_many(all)).await {
            Ok(_) => {}
            Err(_) => warn!(
                queue = %self.queue,
                in_flight = self.in_flight(),
                "Shutdown timeout elapsed with tasks still running"
            ),
        }
    }
}

#[async_trait]
impl Component for ConsumerPipeline {
    fn name(&self) -> String {
        format!("pipeline:{}", self.priority)
    }

    async fn run(&self, shutdown: watch::Receiver<bool>) -> WorkerResult<()> {
        ConsumerPipeline::run(self, shutdown).await
    }
}

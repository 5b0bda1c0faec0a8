//! Direct job pool.
//!
//! Runs the jobs inserted by the broker-less submission path. Claims as many
//! due jobs as it has free slots, runs them through the same dispatcher as
//! the broker pipeline, then completes, reschedules with backoff or discards
//! each one.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use streamix_queue::{JobRecord, JobStore, QueueResult};
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

/// How a claimed job was settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Retried,
    Discarded,
}

impl JobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobOutcome::Completed => outcome::COMPLETED,
            JobOutcome::Retried => outcome::RETRIED,
            JobOutcome::Discarded => outcome::DISCARDED,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FallbackSettings {
    pub concurrency: usize,
    pub poll_interval: Duration,
    pub rescue_interval: Duration,
    /// Jobs executing longer than this are returned to the queue
    pub stale_after: Duration,
    pub shutdown_timeout: Duration,
    pub retry_backoff: Backoff,
}

impl FallbackSettings {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            concurrency: config.fallback_concurrency,
            poll_interval: config.poll_interval,
            rescue_interval: config.claim_interval,
            stale_after: config.stale_job_after(),
            shutdown_timeout: config.shutdown_timeout,
            retry_backoff: Backoff::new(config.retry_base_delay, config.retry_max_delay),
        }
    }
}

impl Default for FallbackSettings {
    fn default() -> Self {
        Self::from_config(&WorkerConfig::default())
    }
}

#[derive(Clone)]
pub struct FallbackWorker {
    store: Arc<dyn JobStore>,
    dispatcher: Dispatcher,
    worker_id: String,
    settings: FallbackSettings,
    slots: Arc<Semaphore>,
}

impl FallbackWorker {
    pub fn new(
        store: Arc<dyn JobStore>,
        dispatcher: Dispatcher,
        worker_id: impl Into<String>,
        mut settings: FallbackSettings,
    ) -> Self {
        settings.concurrency = settings.concurrency.max(1);

        Self {
            store,
            dispatcher,
            worker_id: worker_id.into(),
            slots: Arc::new(Semaphore::new(settings.concurrency)),
            settings,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.settings.concurrency - self.slots.available_permits()
    }

    /// Run one claimed job and record its outcome in the store.
    pub async fn process_job(&self, job: &JobRecord) -> QueueResult<JobOutcome> {
        let source = format!("job:{}", job.id);

        let envelope = match decode(&job.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                error!(
                    job_id = %job.id,
                    payload = %payload_snippet(&job.payload),
                    "Discarding undecodable job: {}",
                    e
                );
                self.store.discard(job.id, &e.to_string()).await?;
                metrics::record_task_processed("undecodable", outcome::DISCARDED);
                return Ok(JobOutcome::Discarded);
            }
        };

        let logger = TaskLogger::from_envelope(&envelope, source);

        if job.attempt > job.max_attempts {
            let reason = format!(
                "attempts_exhausted: attempt {} of {}",
                job.attempt, job.max_attempts
            );
            logger.log_failure(job.attempt, &reason);
            self.store.discard(job.id, &reason).await?;
            metrics::record_task_processed(
                metrics::task_type_label(logger.task_type()),
                outcome::DISCARDED,
            );
            return Ok(JobOutcome::Discarded);
        }

        logger.log_start(job.attempt);
        let started = Instant::now();

        let result = self
            .dispatcher
            .dispatch(&envelope)
            .instrument(logger.create_span())
            .await;

        let job_outcome = match result {
            Ok(summary) => {
                self.store.complete(job.id).await?;
                logger.log_success(&summary, started.elapsed());
                JobOutcome::Completed
            }
            Err(e) if Self::is_final(&e) || !job.can_retry() => {
                let reason = e.to_string();
                logger.log_failure(job.attempt, &reason);
                self.store.discard(job.id, &reason).await?;
                JobOutcome::Discarded
            }
            Err(e) => {
                let reason = e.to_string();
                let at = self
                    .settings
                    .retry_backoff
                    .retry_at(job.attempt.saturating_sub(1));
                logger.log_retry(job.attempt, &reason);
                debug!(job_id = %job.id, retry_at = %at, "Rescheduled job");
                self.store.retry(job.id, at, &reason).await?;
                JobOutcome::Retried
            }
        };

        metrics::record_task_processed(
            metrics::task_type_label(logger.task_type()),
            job_outcome.as_str(),
        );
        Ok(job_outcome)
    }

    /// Jobs the store can never run, whatever the attempt.
    fn is_final(error: &DispatchError) -> bool {
        error.is_permanent() || matches!(error, DispatchError::UnknownTaskType(_))
    }

    /// Claim as many due jobs as there are free slots and start them.
    /// Waits for a free slot first. Returns the number of jobs started.
    pub async fn poll_once(&self) -> WorkerResult<usize> {
        let permits = self.acquire_slots().await?;
        self.claim_into(permits).await
    }

    /// Wait for one free slot, then take every other free slot.
    async fn acquire_slots(&self) -> WorkerResult<Vec<OwnedSemaphorePermit>> {
        let first = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| WorkerError::component_failed("fallback slots closed"))?;

        let mut permits = vec![first];
        while let Ok(permit) = self.slots.clone().try_acquire_owned() {
            permits.push(permit);
        }
        Ok(permits)
    }

    async fn claim_into(&self, permits: Vec<OwnedSemaphorePermit>) -> WorkerResult<usize> {
        let jobs = self.store.claim(&self.worker_id, permits.len()).await?;
        let count = jobs.len();
        if count > 0 {
            debug!(count, "Claimed jobs");
        }

        for (job, permit) in jobs.into_iter().zip(permits) {
            self.spawn_job(job, permit);
        }
        Ok(count)
    }

    fn spawn_job(&self, job: JobRecord, permit: OwnedSemaphorePermit) {
        let worker = self.clone();
        tokio::spawn(async move {
            let _permit = permit;
            if let Err(e) = worker.process_job(&job).await {
                error!(job_id = %job.id, "Failed to record job outcome: {}", e);
            }
        });
    }

    fn spawn_rescue_task(&self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let worker = self.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(worker.settings.rescue_interval);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = interval.tick() => {
                        match worker.store.rescue_stale(worker.settings.stale_after).await {
                            Ok(0) => {}
                            Ok(rescued) => {
                                info!(rescued, "Returned stuck jobs to the queue");
                                metrics::record_stale_recovered("job_store", rescued);
                            }
                            Err(e) => warn!("Failed to rescue stuck jobs: {}", e),
                        }
                    }
                }
            }
        })
    }

    /// Poll until shutdown, then wait for in-flight jobs.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> WorkerResult<()> {
        self.store.health_check().await?;

        info!(
            "Starting job pool '{}' with {} slots",
            self.worker_id, self.settings.concurrency
        );

        let rescue_task = self.spawn_rescue_task(shutdown.clone());
        let mut failures = FailureTracker::new(3);

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
                        rescue_task.abort();
                        return Err(e);
                    }
                },
            };

            // Never dropped mid-flight: a cancelled claim can still commit.
            let idle = match self.claim_into(permits).await {
                Ok(claimed) => {
                    failures.record_success();
                    (claimed == 0).then_some(self.settings.poll_interval)
                }
                Err(e) => {
                    if failures.record_failure() {
                        error!("Error claiming jobs: {}", e);
                    }
                    Some(self.settings.poll_interval * 5)
                }
            };

            if let Some(delay) = idle {
                tokio::select! {
                    _ = shutdown.changed() => {}
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }

        rescue_task.abort();
        self.drain().await;
        info!("Job pool stopped");
        Ok(())
    }

    async fn drain(&self) {
        let in_flight = self.in_flight();
        if in_flight > 0 {
            info!(in_flight, "Waiting for in-flight jobs to complete");
        }

        let all = self.settings.concurrency as u32;
        if tokio::time::timeout(self.settings.shutdown_timeout, self.slots.acquire_many(all))
            .await
            .is_err()
        {
            warn!(
                in_flight = self.in_flight(),
                "Shutdown timeout elapsed with jobs still running"
            );
        }
    }
}

#[async_trait]
impl Component for FallbackWorker {
    fn name(&self) -> String {
        "fallback".to_string()
    }

    async fn run(&self, shutdown: watch::Receiver<bool>) -> WorkerResult<()> {
        FallbackWorker::run(self, shutdown).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::{HandlerError, HandlerResult, HandlerTable, SyncHandler};
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use streamix_models::{Priority, SyncSummary, TaskArgs, TaskEnvelope, TaskType};
    use streamix_queue::{JobState, MemoryJobStore};

    struct AlwaysFails {
        calls: AtomicU32,
    }

    #[async_trait]
    impl SyncHandler for AlwaysFails {
        async fn handle(&self, _args: &TaskArgs) -> HandlerResult {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(HandlerError::new("m3u download failed"))
        }
    }

    struct Succeeds;

    #[async_trait]
    impl SyncHandler for Succeeds {
        async fn handle(&self, _args: &TaskArgs) -> HandlerResult {
            Ok(SyncSummary::new().with_count("series", 3))
        }
    }

    fn worker(store: Arc<MemoryJobStore>, handler: Arc<dyn SyncHandler>) -> FallbackWorker {
        let settings = FallbackSettings {
            retry_backoff: Backoff::new(Duration::from_secs(60), Duration::from_secs(60)),
            ..Default::default()
        };
        FallbackWorker::new(
            store,
            Dispatcher::new(Arc::new(HandlerTable::uniform(handler)), Duration::from_secs(5)),
            "test-worker",
            settings,
        )
    }

    #[tokio::test]
    async fn test_success_completes_job() {
        let store = Arc::new(MemoryJobStore::new());
        let worker = worker(store.clone(), Arc::new(Succeeds));
        let id = store
            .insert(&TaskEnvelope::for_provider(TaskType::IptvSeries, 1), Priority::Normal, 5)
            .await
            .unwrap();

        let job = store.claim("test-worker", 1).await.unwrap().remove(0);
        assert_eq!(worker.process_job(&job).await.unwrap(), JobOutcome::Completed);
        assert_eq!(store.state(id).await, Some(JobState::Completed));
    }

    #[tokio::test]
    async fn test_failures_retry_until_attempts_exhausted() {
        let store = Arc::new(MemoryJobStore::new());
        let handler = Arc::new(AlwaysFails {
            calls: AtomicU32::new(0),
        });
        let worker = worker(store.clone(), handler.clone());
        let id = store
            .insert(&TaskEnvelope::for_provider(TaskType::IptvLive, 1), Priority::Normal, 2)
            .await
            .unwrap();

        let job = store.claim("test-worker", 1).await.unwrap().remove(0);
        assert_eq!(worker.process_job(&job).await.unwrap(), JobOutcome::Retried);
        assert!(store.claim("test-worker", 1).await.unwrap().is_empty());

        store.release_scheduled().await;
        let job = store.claim("test-worker", 1).await.unwrap().remove(0);
        assert_eq!(job.attempt, 2);
        assert_eq!(worker.process_job(&job).await.unwrap(), JobOutcome::Discarded);

        assert_eq!(store.state(id).await, Some(JobState::Discarded));
        assert_eq!(
            store.last_error(id).await.as_deref(),
            Some("handler_error: m3u download failed")
        );
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_type_discarded_immediately() {
        let store = Arc::new(MemoryJobStore::new());
        let handler = Arc::new(AlwaysFails {
            calls: AtomicU32::new(0),
        });
        let worker = worker(store.clone(), handler.clone());

        let envelope = TaskEnvelope::decode(r#"{"type":"iptv_radio","provider_id":1}"#).unwrap();
        let id = store.insert(&envelope, Priority::Normal, 5).await.unwrap();

        let job = store.claim("test-worker", 1).await.unwrap().remove(0);
        assert_eq!(worker.process_job(&job).await.unwrap(), JobOutcome::Discarded);
        assert_eq!(store.state(id).await, Some(JobState::Discarded));
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_drains_queue_and_stops() {
        let store = Arc::new(MemoryJobStore::new());
        let worker = worker(store.clone(), Arc::new(Succeeds));
        for id in 0..7 {
            let envelope = TaskEnvelope::build("iptv_movies", json!({ "provider_id": id })).unwrap();
            store.insert(&envelope, Priority::Low, 5).await.unwrap();
        }

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run(rx).await }
        });

        tokio::time::timeout(Duration::from_secs(5), async {
            while store.counts().await.unwrap().completed < 7 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
        assert_eq!(worker.in_flight(), 0);
    }

    /// Commits the claim, then is slow to answer.
    struct SlowClaim {
        inner: Arc<MemoryJobStore>,
        committed: tokio::sync::Notify,
    }

    #[async_trait]
    impl JobStore for SlowClaim {
        async fn insert(
            &self,
            envelope: &TaskEnvelope,
            priority: Priority,
            max_attempts: u32,
        ) -> QueueResult<streamix_queue::JobId> {
            self.inner.insert(envelope, priority, max_attempts).await
        }

        async fn claim(&self, worker: &str, limit: usize) -> QueueResult<Vec<JobRecord>> {
            let jobs = self.inner.claim(worker, limit).await?;
            if !jobs.is_empty() {
                self.committed.notify_one();
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            Ok(jobs)
        }

        async fn complete(&self, id: streamix_queue::JobId) -> QueueResult<()> {
            self.inner.complete(id).await
        }

        async fn retry(
            &self,
            id: streamix_queue::JobId,
            at: chrono::DateTime<chrono::Utc>,
            error: &str,
        ) -> QueueResult<()> {
            self.inner.retry(id, at, error).await
        }

        async fn discard(&self, id: streamix_queue::JobId, error: &str) -> QueueResult<()> {
            self.inner.discard(id, error).await
        }

        async fn rescue_stale(&self, older_than: Duration) -> QueueResult<u64> {
            self.inner.rescue_stale(older_than).await
        }

        async fn counts(&self) -> QueueResult<streamix_queue::JobCounts> {
            self.inner.counts().await
        }

        async fn health_check(&self) -> QueueResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_shutdown_during_claim_still_runs_claimed_jobs() {
        let inner = Arc::new(MemoryJobStore::new());
        let id = inner
            .insert(&TaskEnvelope::for_provider(TaskType::IptvMovies, 2), Priority::Normal, 5)
            .await
            .unwrap();
        let store = Arc::new(SlowClaim {
            inner: inner.clone(),
            committed: tokio::sync::Notify::new(),
        });

        let worker = FallbackWorker::new(
            store.clone(),
            Dispatcher::new(
                Arc::new(HandlerTable::uniform(Arc::new(Succeeds))),
                Duration::from_secs(5),
            ),
            "test-worker",
            FallbackSettings::default(),
        );

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run(rx).await }
        });

        store.committed.notified().await;
        tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        assert_eq!(inner.state(id).await, Some(JobState::Completed));
        assert_eq!(inner.counts().await.unwrap().executing, 0);
    }

    #[tokio::test]
    async fn test_shutdown_is_not_delayed_by_idle_poll() {
        let store = Arc::new(MemoryJobStore::new());
        let worker = FallbackWorker::new(
            store,
            Dispatcher::new(
                Arc::new(HandlerTable::uniform(Arc::new(Succeeds))),
                Duration::from_secs(5),
            ),
            "test-worker",
            FallbackSettings {
                poll_interval: Duration::from_secs(30),
                ..Default::default()
            },
        );

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run(rx).await }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("shutdown waited for the poll interval")
            .unwrap()
            .unwrap();
    }
}

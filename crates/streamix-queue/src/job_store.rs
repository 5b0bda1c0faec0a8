//! Durable job store for the direct (broker-less) mode.
//!
//! One row per sync task. Workers claim available rows, run them through
//! the same handler table the broker consumers use, and then complete,
//! reschedule or discard them. Retry mechanics live here, not in the broker.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use streamix_models::{Priority, TaskEnvelope};
use tokio::sync::Mutex;

use crate::error::{QueueError, QueueResult};

/// Job row identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Job lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be claimed (possibly scheduled in the future)
    Available,
    /// Claimed by a worker
    Executing,
    /// Finished successfully
    Completed,
    /// Gave up: attempts exhausted or permanently invalid
    Discarded,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Available => "available",
            JobState::Executing => "executing",
            JobState::Completed => "completed",
            JobState::Discarded => "discarded",
        }
    }
}

/// A claimed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub id: JobId,
    /// Encoded envelope, exactly as inserted
    pub payload: String,
    pub priority: Priority,
    /// 1-based attempt this claim represents
    pub attempt: u32,
    pub max_attempts: u32,
}

impl JobRecord {
    /// Returns true if another attempt is allowed after this one fails.
    pub fn can_retry(&self) -> bool {
        self.attempt < self.max_attempts
    }
}

/// Recorded on jobs abandoned during their final attempt.
pub const ABANDONED_ERROR: &str = "abandoned: worker stopped during the final attempt";

/// Row counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobCounts {
    pub available: u64,
    pub executing: u64,
    pub completed: u64,
    pub discarded: u64,
}

#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Persist a new available job.
    async fn insert(
        &self,
        envelope: &TaskEnvelope,
        priority: Priority,
        max_attempts: u32,
    ) -> QueueResult<JobId>;

    /// Atomically claim up to `limit` due jobs, highest priority first.
    async fn claim(&self, worker: &str, limit: usize) -> QueueResult<Vec<JobRecord>>;

    async fn complete(&self, id: JobId) -> QueueResult<()>;

    /// Make the job available again at `at`, recording the error.
    async fn retry(&self, id: JobId, at: DateTime<Utc>, error: &str) -> QueueResult<()>;

    /// Give up on the job, recording the error.
    async fn discard(&self, id: JobId, error: &str) -> QueueResult<()>;

    /// Return jobs stuck executing for longer than `older_than` to the
    /// available state. Jobs that were on their final attempt are discarded
    /// instead. Returns how many were made available again.
    async fn rescue_stale(&self, older_than: Duration) -> QueueResult<u64>;

    async fn counts(&self) -> QueueResult<JobCounts>;

    async fn health_check(&self) -> QueueResult<()>;
}

#[derive(Debug, Clone)]
struct MemoryJob {
    record: JobRecord,
    state: JobState,
    scheduled_at: DateTime<Utc>,
    attempted_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

/// In-process job store for tests and single-node development.
#[derive(Debug, Default)]
pub struct MemoryJobStore {
    jobs: Mutex<Vec<MemoryJob>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current state of a job.
    pub async fn state(&self, id: JobId) -> Option<JobState> {
        self.jobs
            .lock()
            .await
            .iter()
            .find(|j| j.record.id == id)
            .map(|j| j.state)
    }

    /// Last recorded error of a job.
    pub async fn last_error(&self, id: JobId) -> Option<String> {
        self.jobs
            .lock()
            .await
            .iter()
            .find(|j| j.record.id == id)
            .and_then(|j| j.last_error.clone())
    }

    /// Encoded envelopes of every inserted job, in insertion order.
    pub async fn payloads(&self) -> Vec<String> {
        self.jobs
            .lock()
            .await
            .iter()
            .map(|j| j.record.payload.clone())
            .collect()
    }

    /// Make every scheduled retry due now.
    pub async fn release_scheduled(&self) {
        let now = Utc::now();
        for job in self.jobs.lock().await.iter_mut() {
            if job.state == JobState::Available && job.scheduled_at > now {
                job.scheduled_at = now;
            }
        }
    }

    async fn update<F>(&self, id: JobId, f: F) -> QueueResult<()>
    where
        F: FnOnce(&mut MemoryJob) + Send,
    {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .iter_mut()
            .find(|j| j.record.id == id)
            .ok_or(QueueError::JobNotFound(id.0))?;
        f(job);
        Ok(())
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(
        &self,
        envelope: &TaskEnvelope,
        priority: Priority,
        max_attempts: u32,
    ) -> QueueResult<JobId> {
        let payload = envelope.encode()?;
        let mut jobs = self.jobs.lock().await;
        let id = JobId(jobs.len() as i64 + 1);

        jobs.push(MemoryJob {
            record: JobRecord {
                id,
                payload,
                priority,
                attempt: 0,
                max_attempts,
            },
            state: JobState::Available,
            scheduled_at: Utc::now(),
            attempted_at: None,
            last_error: None,
        });

        Ok(id)
    }

    async fn claim(&self, _worker: &str, limit: usize) -> QueueResult<Vec<JobRecord>> {
        let now = Utc::now();
        let mut jobs = self.jobs.lock().await;

        let mut due: Vec<usize> = jobs
            .iter()
            .enumerate()
            .filter(|(_, j)| j.state == JobState::Available && j.scheduled_at <= now)
            .map(|(i, _)| i)
            .collect();
        due.sort_by_key(|&i| (jobs[i].record.priority.rank(), jobs[i].scheduled_at, jobs[i].record.id.0));
        due.truncate(limit);

        let claimed = due
            .into_iter()
            .map(|i| {
                let job = &mut jobs[i];
                job.state = JobState::Executing;
                job.record.attempt += 1;
                job.attempted_at = Some(now);
                job.record.clone()
            })
            .collect();

        Ok(claimed)
    }

    async fn complete(&self, id: JobId) -> QueueResult<()> {
        self.update(id, |job| job.state = JobState::Completed).await
    }

    async fn retry(&self, id: JobId, at: DateTime<Utc>, error: &str) -> QueueResult<()> {
        let error = error.to_string();
        self.update(id, move |job| {
            job.state = JobState::Available;
            job.scheduled_at = at;
            job.last_error = Some(error);
        })
        .await
    }

    async fn discard(&self, id: JobId, error: &str) -> QueueResult<()> {
        let error = error.to_string();
        self.update(id, move |job| {
            job.state = JobState::Discarded;
            job.last_error = Some(error);
        })
        .await
    }

    async fn rescue_stale(&self, older_than: Duration) -> QueueResult<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let mut rescued = 0;

        for job in self.jobs.lock().await.iter_mut() {
            if job.state != JobState::Executing || job.attempted_at.map_or(true, |t| t > cutoff) {
                continue;
            }
            if job.record.can_retry() {
                job.state = JobState::Available;
                job.scheduled_at = Utc::now();
                rescued += 1;
            } else {
                job.state = JobState::Discarded;
                job.last_error = Some(ABANDONED_ERROR.to_string());
            }
        }

        Ok(rescued)
    }

    async fn counts(&self) -> QueueResult<JobCounts> {
        let mut counts = JobCounts::default();
        for job in self.jobs.lock().await.iter() {
            match job.state {
                JobState::Available => counts.available += 1,
                JobState::Executing => counts.executing += 1,
                JobState::Completed => counts.completed += 1,
                JobState::Discarded => counts.discarded += 1,
            }
        }
        Ok(counts)
    }

    async fn health_check(&self) -> QueueResult<()> {
        Ok(())
    }
}

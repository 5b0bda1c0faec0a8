//! Postgres-backed job store.
//!
//! Jobs live in `streamix_sync_jobs`. Claims use `FOR UPDATE SKIP LOCKED` so
//! any number of workers can poll the table concurrently without handing
//! the same row to two of them. `payload` keeps the encoded envelope byte
//! for byte; `args` is the same document as JSONB for ad hoc queries.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use streamix_models::{Priority, TaskEnvelope};
use tracing::{info, warn};

use crate::config::QueueConfig;
use crate::error::{QueueError, QueueResult};
use crate::job_store::{JobCounts, JobId, JobRecord, JobStore, ABANDONED_ERROR};

/// Job store on a Postgres pool.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a pool from the queue configuration.
    pub async fn connect(config: &QueueConfig) -> QueueResult<Self> {
        let url = config
            .database_url
            .as_deref()
            .ok_or_else(|| QueueError::config("DATABASE_URL is required for the direct job store"))?;

        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(config.connect_timeout)
            .connect(url)
            .await
            .map_err(|e| QueueError::connection_failed(format!("Postgres connection failed: {}", e)))?;

        Ok(Self { pool })
    }

    /// Create the jobs table and its indexes if they don't exist.
    pub async fn migrate(&self) -> QueueResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS streamix_sync_jobs (
                id BIGSERIAL PRIMARY KEY,
                task_type TEXT NOT NULL,
                args JSONB NOT NULL,
                payload TEXT,
                priority SMALLINT NOT NULL DEFAULT 1,
                state TEXT NOT NULL DEFAULT 'available',
                attempt INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                scheduled_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                attempted_at TIMESTAMPTZ,
                attempted_by TEXT,
                completed_at TIMESTAMPTZ,
                discarded_at TIMESTAMPTZ,
                last_error TEXT,
                inserted_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // Tables created before the payload column existed.
        sqlx::query("ALTER TABLE streamix_sync_jobs ADD COLUMN IF NOT EXISTS payload TEXT")
            .execute(&self.pool)
            .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_streamix_sync_jobs_fetch
            ON streamix_sync_jobs (state, priority, scheduled_at, id)
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Job store schema ready");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn record_from_row(row: &PgRow) -> QueueResult<JobRecord> {
        let rank: i16 = row.try_get("priority")?;
        let priority = Priority::from_rank(rank).unwrap_or_else(|| {
            warn!(rank, "Job row has an unknown priority, treating as normal");
            Priority::Normal
        });

        Ok(JobRecord {
            id: JobId(row.try_get("id")?),
            payload: row.try_get("payload")?,
            priority,
            attempt: row.try_get::<i32, _>("attempt")?.max(0) as u32,
            max_attempts: row.try_get::<i32, _>("max_attempts")?.max(1) as u32,
        })
    }

    async fn set_state(&self, id: JobId, sql: &str) -> QueueResult<()> {
        let result = sqlx::query(sql).bind(id.0).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(QueueError::JobNotFound(id.0));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(
        &self,
        envelope: &TaskEnvelope,
        priority: Priority,
        max_attempts: u32,
    ) -> QueueResult<JobId> {
        let payload = envelope.encode()?;

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO streamix_sync_jobs (task_type, args, payload, priority, max_attempts)
            VALUES ($1, $2::jsonb, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(envelope.task_type())
        .bind(&payload)
        .bind(&payload)
        .bind(priority.rank())
        .bind(max_attempts as i32)
        .fetch_one(&self.pool)
        .await?;

        Ok(JobId(id))
    }

    async fn claim(&self, worker: &str, limit: usize) -> QueueResult<Vec<JobRecord>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            UPDATE streamix_sync_jobs
            SET state = 'executing',
                attempt = attempt + 1,
                attempted_at = NOW(),
                attempted_by = $1
            WHERE id IN (
                SELECT id
                FROM streamix_sync_jobs
                WHERE state = 'available'
                  AND scheduled_at <= NOW()
                ORDER BY priority ASC, scheduled_at ASC, id ASC
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, COALESCE(payload, args::text) AS payload, priority, attempt, max_attempts
            "#,
        )
        .bind(worker)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut records = rows
            .iter()
            .map(Self::record_from_row)
            .collect::<QueueResult<Vec<_>>>()?;
        // RETURNING does not preserve the subquery order.
        records.sort_by_key(|r| (r.priority.rank(), r.id.0));

        Ok(records)
    }

    async fn complete(&self, id: JobId) -> QueueResult<()> {
        self.set_state(
            id,
            r#"
            UPDATE streamix_sync_jobs
            SET state = 'completed', completed_at = NOW()
            WHERE id = $1
            "#,
        )
        .await
    }

    async fn retry(&self, id: JobId, at: DateTime<Utc>, error: &str) -> QueueResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE streamix_sync_jobs
            SET state = 'available', scheduled_at = $2, last_error = $3
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(at)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::JobNotFound(id.0));
        }
        Ok(())
    }

    async fn discard(&self, id: JobId, error: &str) -> QueueResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE streamix_sync_jobs
            SET state = 'discarded', discarded_at = NOW(), last_error = $2
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(error)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::JobNotFound(id.0));
        }
        Ok(())
    }

    async fn rescue_stale(&self, older_than: Duration) -> QueueResult<u64> {
        let states: Vec<String> = sqlx::query_scalar(
            r#"
            UPDATE streamix_sync_jobs
            SET state = CASE WHEN attempt >= max_attempts THEN 'discarded' ELSE 'available' END,
                scheduled_at = NOW(),
                discarded_at = CASE WHEN attempt >= max_attempts THEN NOW() ELSE discarded_at END,
                last_error = CASE WHEN attempt >= max_attempts THEN $2 ELSE last_error END
            WHERE state = 'executing'
              AND attempted_at < NOW() - make_interval(secs => $1)
            RETURNING state
            "#,
        )
        .bind(older_than.as_secs_f64())
        .bind(ABANDONED_ERROR)
        .fetch_all(&self.pool)
        .await?;

        let discarded = states.iter().filter(|s| s.as_str() == "discarded").count();
        if discarded > 0 {
            warn!(discarded, "Discarded jobs abandoned during their final attempt");
        }

        Ok((states.len() - discarded) as u64)
    }

    async fn counts(&self) -> QueueResult<JobCounts> {
        let rows = sqlx::query(
            r#"
            SELECT state, COUNT(*) AS total
            FROM streamix_sync_jobs
            GROUP BY state
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = JobCounts::default();
        for row in rows {
            let state: String = row.try_get("state")?;
            let total = row.try_get::<i64, _>("total")?.max(0) as u64;
            match state.as_str() {
                "available" => counts.available = total,
                "executing" => counts.executing = total,
                "completed" => counts.completed = total,
                "discarded" => counts.discarded = total,
                other => warn!(state = %other, "Unknown job state in store"),
            }
        }

        Ok(counts)
    }

    async fn health_check(&self) -> QueueResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

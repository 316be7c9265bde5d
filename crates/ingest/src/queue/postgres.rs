//! PostgreSQL implementation of JobStore
//!
//! Production persistence using PostgreSQL with:
//! - Atomic job claiming with SKIP LOCKED
//! - Heartbeat-based reclamation of jobs held by stale workers
//! - Row-locked failure accounting for retry/backoff

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use super::store::*;

/// Columns selected whenever a full job row is loaded
const JOB_COLUMNS: &str = "id, source_id, job_type, payload, priority, status, worker_id, \
     progress, progress_metadata, retry_count, error_message, result, scheduled_at, \
     created_at, started_at, completed_at, failed_at";

/// PostgreSQL implementation of JobStore
///
/// Uses a connection pool; any number of worker processes may share one database.
///
/// # Example
///
/// ```ignore
/// use harvester_ingest::PostgresJobStore;
///
/// let store = PostgresJobStore::connect("postgres://localhost/harvester").await?;
/// store.migrate().await?;
/// ```
#[derive(Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
    config: QueueConfig,
}

impl PostgresJobStore {
    /// Create a new PostgreSQL store with the given connection pool
    pub fn new(pool: PgPool) -> Self {
        Self::with_config(pool, QueueConfig::default())
    }

    /// Create a new PostgreSQL store with explicit queue settings
    pub fn with_config(pool: PgPool, config: QueueConfig) -> Self {
        Self { pool, config }
    }

    /// Connect to `database_url` with a default-sized pool
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await
            .map_err(|e| {
                error!("Failed to connect to database: {}", e);
                StoreError::Database(e.to_string())
            })?;
        Ok(Self::new(pool))
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Queue settings in use
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Apply the bundled schema migrations
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to run migrations: {}", e);
                StoreError::Database(e.to_string())
            })
    }

    async fn promote_due_retries<'e, E>(executor: E) -> Result<u64, StoreError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        let result = sqlx::query(
            r#"
            UPDATE ingest_jobs
            SET status = 'pending'
            WHERE status = 'retrying'
              AND scheduled_at <= NOW()
            "#,
        )
        .execute(executor)
        .await
        .map_err(|e| {
            error!("Failed to promote retrying jobs: {}", e);
            StoreError::Database(e.to_string())
        })?;
        Ok(result.rows_affected())
    }
}

fn db_err(e: sqlx::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

fn cutoff(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let job_type: String = row.get("job_type");
    let status: String = row.get("status");
    let progress: i16 = row.get("progress");
    let retry_count: i32 = row.get("retry_count");

    Ok(Job {
        id: row.get("id"),
        source_id: row.get("source_id"),
        job_type: job_type.parse()?,
        payload: row.get("payload"),
        priority: row.get("priority"),
        status: status.parse()?,
        worker_id: row.get("worker_id"),
        progress: progress.clamp(0, 100) as u8,
        progress_metadata: row.get("progress_metadata"),
        retry_count: retry_count.max(0) as u32,
        error_message: row.get("error_message"),
        result: row.get("result"),
        scheduled_at: row.get("scheduled_at"),
        created_at: row.get("created_at"),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        failed_at: row.get("failed_at"),
    })
}

/// Lock a job row and check that `worker_id` may move it to `to`
async fn lock_for_transition(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    job_id: Uuid,
    worker_id: &str,
    to: JobStatus,
) -> Result<(JobStatus, u32), StoreError> {
    let row = sqlx::query(
        r#"
        SELECT status, retry_count, worker_id FROM ingest_jobs WHERE id = $1 FOR UPDATE
        "#,
    )
    .bind(job_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(db_err)?
    .ok_or(StoreError::JobNotFound(job_id))?;

    let status: String = row.get("status");
    let status: JobStatus = status.parse()?;
    let retry_count: i32 = row.get("retry_count");

    if !status.can_transition_to(to) {
        return Err(StoreError::InvalidTransition {
            job_id,
            from: status,
            to,
        });
    }

    let owner: Option<String> = row.get("worker_id");
    if owner.as_deref() != Some(worker_id) {
        return Err(StoreError::NotOwner {
            job_id,
            worker_id: worker_id.to_string(),
        });
    }
    Ok((status, retry_count.max(0) as u32))
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, job), fields(source_id = job.source_id, job_type = %job.job_type))]
    async fn enqueue(&self, job: NewJob) -> Result<Uuid, StoreError> {
        let job_id = Uuid::now_v7();

        sqlx::query(
            r#"
            INSERT INTO ingest_jobs (id, source_id, job_type, payload, priority, status, scheduled_at)
            VALUES ($1, $2, $3, $4, $5, 'pending', COALESCE($6, NOW()))
            "#,
        )
        .bind(job_id)
        .bind(job.source_id)
        .bind(job.job_type.as_str())
        .bind(&job.payload)
        .bind(job.priority)
        .bind(job.scheduled_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to enqueue job: {}", e);
            db_err(e)
        })?;

        debug!(%job_id, "enqueued job");
        Ok(job_id)
    }

    #[instrument(skip(self))]
    async fn dequeue(&self, worker_id: &str) -> Result<Option<Job>, StoreError> {
        Self::promote_due_retries(&self.pool).await?;

        // Claim in one statement; SKIP LOCKED keeps concurrent claimers off
        // rows another transaction is already taking.
        let row = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT id
                FROM ingest_jobs
                WHERE status = 'pending'
                  AND scheduled_at <= NOW()
                ORDER BY priority DESC, created_at, id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE ingest_jobs j
            SET status = 'processing',
                worker_id = $1,
                started_at = NOW(),
                progress = 0
            FROM claimable c
            WHERE j.id = c.id
            RETURNING j.*
            "#,
        )
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to claim job: {}", e);
            db_err(e)
        })?;

        let job = row.as_ref().map(job_from_row).transpose()?;
        if let Some(job) = &job {
            debug!(job_id = %job.id, source_id = job.source_id, "claimed job");
        }
        Ok(job)
    }

    #[instrument(skip(self, result))]
    async fn complete_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        lock_for_transition(&mut tx, job_id, worker_id, JobStatus::Completed).await?;

        sqlx::query(
            r#"
            UPDATE ingest_jobs
            SET status = 'completed',
                completed_at = NOW(),
                progress = 100,
                result = $2
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .bind(&result)
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!("Failed to complete job: {}", e);
            db_err(e)
        })?;

        tx.commit().await.map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn fail_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<FailureOutcome, StoreError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let (_, prior_retries) =
            lock_for_transition(&mut tx, job_id, worker_id, JobStatus::Failed).await?;
        let retry_count = prior_retries + 1;
        let now = Utc::now();

        let outcome = if retryable && self.config.retry.can_retry(prior_retries) {
            let delay = self.config.retry.delay_for_retry(prior_retries);
            let scheduled_at = now + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());

            sqlx::query(
                r#"
                UPDATE ingest_jobs
                SET status = 'retrying',
                    retry_count = $2,
                    error_message = $3,
                    worker_id = NULL,
                    scheduled_at = $4
                WHERE id = $1
                "#,
            )
            .bind(job_id)
            .bind(retry_count as i32)
            .bind(error)
            .bind(scheduled_at)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            FailureOutcome::WillRetry {
                retry_count,
                scheduled_at,
            }
        } else {
            sqlx::query(
                r#"
                UPDATE ingest_jobs
                SET status = 'failed',
                    retry_count = $2,
                    error_message = $3,
                    worker_id = NULL,
                    failed_at = $4
                WHERE id = $1
                "#,
            )
            .bind(job_id)
            .bind(retry_count as i32)
            .bind(error)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;

            FailureOutcome::Failed { retry_count }
        };

        tx.commit().await.map_err(|e| {
            error!("Failed to record job failure: {}", e);
            db_err(e)
        })?;

        Ok(outcome)
    }

    #[instrument(skip(self, metadata))]
    async fn update_progress(
        &self,
        job_id: Uuid,
        progress: u8,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE ingest_jobs
            SET progress = $2,
                progress_metadata = COALESCE($3, progress_metadata)
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(job_id)
        .bind(progress.min(100) as i16)
        .bind(&metadata)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return match self.get_job(job_id).await? {
                Some(job) => Err(StoreError::InvalidTransition {
                    job_id,
                    from: job.status,
                    to: JobStatus::Processing,
                }),
                None => Err(StoreError::JobNotFound(job_id)),
            };
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        let query = format!("SELECT {JOB_COLUMNS} FROM ingest_jobs WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to get job: {}", e);
                db_err(e)
            })?;

        row.as_ref().map(job_from_row).transpose()
    }

    async fn pending_count(&self) -> Result<u64, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS count
            FROM ingest_jobs
            WHERE status IN ('pending', 'retrying')
              AND scheduled_at <= NOW()
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.get::<i64, _>("count").max(0) as u64)
    }

    async fn has_active_job(&self, source_id: i64, job_type: JobType) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM ingest_jobs
                WHERE source_id = $1
                  AND job_type = $2
                  AND status IN ('pending', 'processing', 'retrying')
            ) AS active
            "#,
        )
        .bind(source_id)
        .bind(job_type.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        Ok(row.get("active"))
    }

    #[instrument(skip(self, capabilities))]
    async fn register_worker(
        &self,
        worker_id: &str,
        capabilities: &[String],
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO ingest_workers (worker_id, capabilities, status, registered_at, last_heartbeat)
            VALUES ($1, $2, 'active', NOW(), NOW())
            ON CONFLICT (worker_id) DO UPDATE
            SET capabilities = EXCLUDED.capabilities,
                status = 'active',
                registered_at = NOW(),
                last_heartbeat = NOW()
            "#,
        )
        .bind(worker_id)
        .bind(capabilities)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to register worker: {}", e);
            db_err(e)
        })?;

        info!(worker_id, "registered worker");
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO ingest_workers (worker_id, status, last_heartbeat)
            VALUES ($1, 'active', NOW())
            ON CONFLICT (worker_id) DO UPDATE
            SET status = 'active',
                last_heartbeat = NOW()
            "#,
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn unregister_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE ingest_workers SET status = 'inactive' WHERE worker_id = $1
            "#,
        )
        .bind(worker_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn cleanup(&self) -> Result<CleanupReport, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let mut report = CleanupReport {
            promoted: Self::promote_due_retries(&mut *tx).await?,
            ..Default::default()
        };

        // Owner's heartbeat decides staleness; unknown owners fall back to claim time
        report.reclaimed = sqlx::query(
            r#"
            UPDATE ingest_jobs j
            SET status = 'pending',
                worker_id = NULL,
                started_at = NULL,
                progress = 0
            WHERE j.status = 'processing'
              AND COALESCE(
                    (SELECT w.last_heartbeat FROM ingest_workers w WHERE w.worker_id = j.worker_id),
                    j.started_at
                  ) < $1
            "#,
        )
        .bind(cutoff(now, self.config.stale_worker_threshold))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected();

        report.dead_workers = sqlx::query(
            r#"
            UPDATE ingest_workers
            SET status = 'dead'
            WHERE status <> 'dead'
              AND last_heartbeat < $1
            "#,
        )
        .bind(cutoff(now, self.config.dead_worker_threshold))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected();

        report.purged = sqlx::query(
            r#"
            DELETE FROM ingest_jobs
            WHERE status IN ('completed', 'failed')
              AND COALESCE(completed_at, failed_at) < $1
            "#,
        )
        .bind(cutoff(now, self.config.retention))
        .execute(&mut *tx)
        .await
        .map_err(db_err)?
        .rows_affected();

        tx.commit().await.map_err(|e| {
            error!("Failed to commit cleanup: {}", e);
            db_err(e)
        })?;

        if !report.is_empty() {
            info!(
                promoted = report.promoted,
                reclaimed = report.reclaimed,
                dead_workers = report.dead_workers,
                purged = report.purged,
                "queue cleanup"
            );
        }
        Ok(report)
    }

    #[instrument(skip(self))]
    async fn stats(&self) -> Result<QueueStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status = 'pending') AS pending,
                COUNT(*) FILTER (WHERE status = 'processing') AS processing,
                COUNT(*) FILTER (WHERE status = 'retrying') AS retrying,
                COUNT(*) FILTER (WHERE status = 'completed') AS completed,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed,
                COUNT(*) FILTER (WHERE created_at >= NOW() - INTERVAL '24 hours') AS created_24h,
                COUNT(*) FILTER (WHERE completed_at >= NOW() - INTERVAL '24 hours') AS completed_24h,
                COUNT(*) FILTER (WHERE failed_at >= NOW() - INTERVAL '24 hours') AS failed_24h,
                (AVG(EXTRACT(EPOCH FROM (completed_at - started_at)))
                    FILTER (WHERE status = 'completed'))::float8 AS avg_duration_secs
            FROM ingest_jobs
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to load queue stats: {}", e);
            db_err(e)
        })?;

        let workers = sqlx::query(
            r#"
            SELECT COUNT(*) AS active
            FROM ingest_workers
            WHERE status = 'active'
              AND last_heartbeat >= $1
            "#,
        )
        .bind(cutoff(Utc::now(), self.config.stale_worker_threshold))
        .fetch_one(&self.pool)
        .await
        .map_err(db_err)?;

        let count = |name: &str| row.get::<i64, _>(name).max(0) as u64;

        Ok(QueueStats {
            pending: count("pending"),
            processing: count("processing"),
            retrying: count("retrying"),
            completed: count("completed"),
            failed: count("failed"),
            active_workers: workers.get::<i64, _>("active").max(0) as u64,
            avg_duration_secs: row.get("avg_duration_secs"),
            last_24h: RecentActivity {
                created: count("created_24h"),
                completed: count("completed_24h"),
                failed: count("failed_24h"),
            },
        })
    }
}

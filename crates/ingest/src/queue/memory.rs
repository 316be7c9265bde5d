//! In-memory implementation of JobStore

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::store::*;
use super::store::heartbeat_older_than;

/// In-memory implementation of JobStore
///
/// Every operation takes a single write lock, which makes claiming trivially
/// atomic. Provides the same semantics as the PostgreSQL implementation and
/// backs tests and single-process deployments.
///
/// # Example
///
/// ```
/// use harvester_ingest::InMemoryJobStore;
///
/// let store = InMemoryJobStore::new();
/// ```
pub struct InMemoryJobStore {
    config: QueueConfig,
    jobs: RwLock<HashMap<Uuid, Job>>,
    workers: RwLock<HashMap<String, WorkerRecord>>,
}

impl InMemoryJobStore {
    /// Create a new in-memory store with default queue settings
    pub fn new() -> Self {
        Self::with_config(QueueConfig::default())
    }

    /// Create a new in-memory store with the given queue settings
    pub fn with_config(config: QueueConfig) -> Self {
        Self {
            config,
            jobs: RwLock::new(HashMap::new()),
            workers: RwLock::new(HashMap::new()),
        }
    }

    /// Queue settings in use
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Get the number of jobs in the given status
    pub fn count_by_status(&self, status: JobStatus) -> usize {
        self.jobs
            .read()
            .values()
            .filter(|j| j.status == status)
            .count()
    }

    /// Snapshot of a worker record
    pub fn worker(&self, worker_id: &str) -> Option<WorkerRecord> {
        self.workers.read().get(worker_id).cloned()
    }

    /// Shift a worker's last heartbeat into the past (for testing)
    pub fn backdate_heartbeat(&self, worker_id: &str, by: Duration) {
        if let Some(worker) = self.workers.write().get_mut(worker_id) {
            worker.last_heartbeat -= to_chrono(by);
        }
    }

    /// Shift every timestamp of a job into the past (for testing)
    pub fn backdate_job(&self, job_id: Uuid, by: Duration) {
        if let Some(job) = self.jobs.write().get_mut(&job_id) {
            let by = to_chrono(by);
            job.created_at -= by;
            job.scheduled_at -= by;
            job.started_at = job.started_at.map(|t| t - by);
            job.completed_at = job.completed_at.map(|t| t - by);
            job.failed_at = job.failed_at.map(|t| t - by);
        }
    }

    /// Clear all data (for testing)
    pub fn clear(&self) {
        self.jobs.write().clear();
        self.workers.write().clear();
    }

    fn promote_due_retries(jobs: &mut HashMap<Uuid, Job>, now: DateTime<Utc>) -> u64 {
        let mut promoted = 0;
        for job in jobs.values_mut() {
            if job.status == JobStatus::Retrying && job.scheduled_at <= now {
                job.status = JobStatus::Pending;
                promoted += 1;
            }
        }
        promoted
    }

    fn upsert_worker(&self, worker_id: &str, capabilities: Option<&[String]>) {
        let now = Utc::now();
        let mut workers = self.workers.write();
        let record = workers
            .entry(worker_id.to_string())
            .or_insert_with(|| WorkerRecord {
                worker_id: worker_id.to_string(),
                capabilities: vec![],
                status: WorkerStatus::Active,
                registered_at: now,
                last_heartbeat: now,
            });

        if let Some(capabilities) = capabilities {
            record.capabilities = capabilities.to_vec();
            record.registered_at = now;
        }
        record.status = WorkerStatus::Active;
        record.last_heartbeat = now;
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::zero())
}

/// Look up a job and check the state machine allows moving it to `to`
fn processing_job(
    jobs: &mut HashMap<Uuid, Job>,
    job_id: Uuid,
    to: JobStatus,
) -> Result<&mut Job, StoreError> {
    let job = jobs.get_mut(&job_id).ok_or(StoreError::JobNotFound(job_id))?;
    if !job.status.can_transition_to(to) {
        return Err(StoreError::InvalidTransition {
            job_id,
            from: job.status,
            to,
        });
    }
    Ok(job)
}

/// [`processing_job`] for a job that `worker_id` must currently hold
fn claimed_job<'a>(
    jobs: &'a mut HashMap<Uuid, Job>,
    job_id: Uuid,
    worker_id: &str,
    to: JobStatus,
) -> Result<&'a mut Job, StoreError> {
    let job = processing_job(jobs, job_id, to)?;
    if job.worker_id.as_deref() != Some(worker_id) {
        return Err(StoreError::NotOwner {
            job_id,
            worker_id: worker_id.to_string(),
        });
    }
    Ok(job)
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: NewJob) -> Result<Uuid, StoreError> {
        let job_id = Uuid::now_v7();
        let job = Job::from_new(job_id, job, Utc::now());
        debug!(%job_id, source_id = job.source_id, job_type = %job.job_type, "enqueued job");
        self.jobs.write().insert(job_id, job);
        Ok(job_id)
    }

    async fn dequeue(&self, worker_id: &str) -> Result<Option<Job>, StoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write();
        Self::promote_due_retries(&mut jobs, now);

        let next = jobs
            .values()
            .filter(|j| j.status == JobStatus::Pending && j.scheduled_at <= now)
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then_with(|| b.created_at.cmp(&a.created_at))
                    .then_with(|| b.id.cmp(&a.id))
            })
            .map(|j| j.id);

        let Some(job_id) = next else {
            return Ok(None);
        };

        let job = processing_job(&mut jobs, job_id, JobStatus::Processing)?;
        job.status = JobStatus::Processing;
        job.worker_id = Some(worker_id.to_string());
        job.started_at = Some(now);
        job.progress = 0;

        debug!(%job_id, worker_id, "claimed job");
        Ok(Some(job.clone()))
    }

    async fn complete_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write();
        let job = claimed_job(&mut jobs, job_id, worker_id, JobStatus::Completed)?;

        job.status = JobStatus::Completed;
        job.completed_at = Some(Utc::now());
        job.progress = 100;
        job.result = Some(result);
        Ok(())
    }

    async fn fail_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<FailureOutcome, StoreError> {
        let now = Utc::now();
        let mut jobs = self.jobs.write();
        let job = claimed_job(&mut jobs, job_id, worker_id, JobStatus::Failed)?;

        let prior_retries = job.retry_count;
        job.retry_count += 1;
        job.error_message = Some(error.to_string());
        job.worker_id = None;

        if retryable && self.config.retry.can_retry(prior_retries) {
            let delay = self.config.retry.delay_for_retry(prior_retries);
            job.status = JobStatus::Retrying;
            job.scheduled_at = now + to_chrono(delay);

            Ok(FailureOutcome::WillRetry {
                retry_count: job.retry_count,
                scheduled_at: job.scheduled_at,
            })
        } else {
            job.status = JobStatus::Failed;
            job.failed_at = Some(now);

            Ok(FailureOutcome::Failed {
                retry_count: job.retry_count,
            })
        }
    }

    async fn update_progress(
        &self,
        job_id: Uuid,
        progress: u8,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(&job_id).ok_or(StoreError::JobNotFound(job_id))?;

        if job.status != JobStatus::Processing {
            return Err(StoreError::InvalidTransition {
                job_id,
                from: job.status,
                to: JobStatus::Processing,
            });
        }

        job.progress = progress.min(100);
        if metadata.is_some() {
            job.progress_metadata = metadata;
        }
        Ok(())
    }

    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError> {
        Ok(self.jobs.read().get(&job_id).cloned())
    }

    async fn pending_count(&self) -> Result<u64, StoreError> {
        let now = Utc::now();
        Ok(self.jobs.read().values().filter(|j| j.is_due(now)).count() as u64)
    }

    async fn has_active_job(&self, source_id: i64, job_type: JobType) -> Result<bool, StoreError> {
        Ok(self
            .jobs
            .read()
            .values()
            .any(|j| j.source_id == source_id && j.job_type == job_type && !j.status.is_terminal()))
    }

    async fn register_worker(
        &self,
        worker_id: &str,
        capabilities: &[String],
    ) -> Result<(), StoreError> {
        self.upsert_worker(worker_id, Some(capabilities));
        Ok(())
    }

    async fn heartbeat(&self, worker_id: &str) -> Result<(), StoreError> {
        self.upsert_worker(worker_id, None);
        Ok(())
    }

    async fn unregister_worker(&self, worker_id: &str) -> Result<(), StoreError> {
        if let Some(worker) = self.workers.write().get_mut(worker_id) {
            worker.status = WorkerStatus::Inactive;
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<CleanupReport, StoreError> {
        let now = Utc::now();
        let mut report = CleanupReport::default();

        // Lock order: workers before jobs
        let mut workers = self.workers.write();
        let mut jobs = self.jobs.write();

        report.promoted = Self::promote_due_retries(&mut jobs, now);

        let stale = self.config.stale_worker_threshold;
        for job in jobs.values_mut() {
            if job.status != JobStatus::Processing {
                continue;
            }
            let owner_stale = match job.worker_id.as_deref().and_then(|id| workers.get(id)) {
                Some(worker) => heartbeat_older_than(worker.last_heartbeat, now, stale),
                // Unknown owner: fall back to the claim time
                None => job
                    .started_at
                    .map(|started| heartbeat_older_than(started, now, stale))
                    .unwrap_or(true),
            };
            if owner_stale {
                info!(job_id = %job.id, worker_id = ?job.worker_id, "reclaiming job from stale worker");
                job.status = JobStatus::Pending;
                job.worker_id = None;
                job.started_at = None;
                job.progress = 0;
                report.reclaimed += 1;
            }
        }

        for worker in workers.values_mut() {
            if worker.status != WorkerStatus::Dead
                && heartbeat_older_than(worker.last_heartbeat, now, self.config.dead_worker_threshold)
            {
                info!(worker_id = %worker.worker_id, "marking worker dead");
                worker.status = WorkerStatus::Dead;
                report.dead_workers += 1;
            }
        }

        let retention = self.config.retention;
        let before = jobs.len();
        jobs.retain(|_, job| {
            let finished = job.completed_at.or(job.failed_at);
            !(job.status.is_terminal()
                && finished
                    .map(|at| heartbeat_older_than(at, now, retention))
                    .unwrap_or(false))
        });
        report.purged = (before - jobs.len()) as u64;

        Ok(report)
    }

    async fn stats(&self) -> Result<QueueStats, StoreError> {
        let now = Utc::now();
        let day_ago = now - chrono::Duration::hours(24);
        let jobs = self.jobs.read();
        let mut stats = QueueStats::default();
        let mut durations = Vec::new();

        for job in jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Retrying => stats.retrying += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
            if let Some(duration) = job.duration() {
                durations.push(duration.as_secs_f64());
            }
            if job.created_at >= day_ago {
                stats.last_24h.created += 1;
            }
            if job.completed_at.is_some_and(|t| t >= day_ago) {
                stats.last_24h.completed += 1;
            }
            if job.failed_at.is_some_and(|t| t >= day_ago) {
                stats.last_24h.failed += 1;
            }
        }

        if !durations.is_empty() {
            stats.avg_duration_secs = Some(durations.iter().sum::<f64>() / durations.len() as f64);
        }

        stats.active_workers = self
            .workers
            .read()
            .values()
            .filter(|w| w.is_alive(now, self.config.stale_worker_threshold))
            .count() as u64;

        Ok(stats)
    }
}

//! JobStore trait definition

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::retry::RetryPolicy;
use crate::config::{duration_millis, env_parse};

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Job not found
    #[error("job not found: {0}")]
    JobNotFound(Uuid),

    /// Job is not in a state that allows the requested transition
    #[error("invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        to: JobStatus,
    },

    /// Job is not claimed by the calling worker, e.g. after stale reclamation
    #[error("job {job_id} is not held by worker {worker_id}")]
    NotOwner { job_id: Uuid, worker_id: String },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Kind of work a job performs against its source
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Fetch and parse the source, storing discovered events
    ScrapeSource,
    /// Analyse the source configuration and tune it
    OptimizeSource,
    /// Health check: test the source and optimize if needed
    TestSource,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ScrapeSource => "scrape_source",
            Self::OptimizeSource => "optimize_source",
            Self::TestSource => "test_source",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobType {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scrape_source" => Ok(Self::ScrapeSource),
            "optimize_source" => Ok(Self::OptimizeSource),
            "test_source" => Ok(Self::TestSource),
            other => Err(StoreError::Serialization(format!("unknown job type: {other}"))),
        }
    }
}

/// Job status in the queue
///
/// ```text
/// pending ──► processing ──► completed
///    ▲            │
///    │            ├────────► failed
///    │            ▼
///    └──────── retrying
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting to be claimed
    Pending,
    /// Claimed by a worker
    Processing,
    /// Failed with a retryable error, waiting for its backoff delay
    Retrying,
    /// Finished successfully
    Completed,
    /// Finished unsuccessfully, no further attempts
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Retrying => "retrying",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Terminal jobs never change status again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the state machine allows moving from `self` to `next`
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Processing)
                | (Self::Processing, Self::Completed)
                | (Self::Processing, Self::Retrying)
                | (Self::Processing, Self::Failed)
                | (Self::Processing, Self::Pending)
                | (Self::Retrying, Self::Pending)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "retrying" => Ok(Self::Retrying),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(StoreError::Serialization(format!("unknown job status: {other}"))),
        }
    }
}

/// Priority tiers (higher = more urgent)
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl Priority {
    /// Numeric value stored on the job
    pub fn value(&self) -> i32 {
        match self {
            Self::Low => 1,
            Self::Normal => 5,
            Self::High => 8,
            Self::Urgent => 10,
        }
    }
}

impl From<Priority> for i32 {
    fn from(priority: Priority) -> Self {
        priority.value()
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => f.write_str("low"),
            Self::Normal => f.write_str("normal"),
            Self::High => f.write_str("high"),
            Self::Urgent => f.write_str("urgent"),
        }
    }
}

/// Definition of a job to be enqueued
#[derive(Debug, Clone)]
pub struct NewJob {
    pub source_id: i64,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub priority: i32,
    /// Earliest time the job may be claimed (defaults to now)
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new(source_id: i64, job_type: JobType) -> Self {
        Self {
            source_id,
            job_type,
            payload: serde_json::Value::Object(Default::default()),
            priority: Priority::Normal.value(),
            scheduled_at: None,
        }
    }

    /// Scrape job for a source
    pub fn scrape(source_id: i64) -> Self {
        Self::new(source_id, JobType::ScrapeSource)
    }

    /// Optimization job for a source
    pub fn optimize(source_id: i64) -> Self {
        Self::new(source_id, JobType::OptimizeSource)
    }

    /// Health-check job for a source
    pub fn test(source_id: i64) -> Self {
        Self::new(source_id, JobType::TestSource)
    }

    pub fn with_priority(mut self, priority: impl Into<i32>) -> Self {
        self.priority = priority.into();
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn scheduled_at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_at = Some(at);
        self
    }

    /// Schedule the job `delay` from now
    pub fn delayed_by(self, delay: Duration) -> Self {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::zero());
        self.scheduled_at(Utc::now() + delay)
    }
}

/// A job as stored in the queue
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub source_id: i64,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub priority: i32,
    pub status: JobStatus,
    pub worker_id: Option<String>,
    pub progress: u8,
    pub progress_metadata: Option<serde_json::Value>,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub scheduled_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
}

impl Job {
    /// Build a freshly enqueued job
    pub(crate) fn from_new(id: Uuid, job: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            source_id: job.source_id,
            job_type: job.job_type,
            payload: job.payload,
            priority: job.priority,
            status: JobStatus::Pending,
            worker_id: None,
            progress: 0,
            progress_metadata: None,
            retry_count: 0,
            error_message: None,
            result: None,
            scheduled_at: job.scheduled_at.unwrap_or(now),
            created_at: now,
            started_at: None,
            completed_at: None,
            failed_at: None,
        }
    }

    /// `dry_run` flag carried in the payload (maintenance jobs)
    pub fn dry_run(&self) -> bool {
        self.payload
            .get("dry_run")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    /// Wall-clock time between claim and completion
    pub fn duration(&self) -> Option<Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => end.signed_duration_since(start).to_std().ok(),
            _ => None,
        }
    }

    /// Eligible for dequeue at `now` (retrying jobs are promoted first)
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        matches!(self.status, JobStatus::Pending | JobStatus::Retrying) && self.scheduled_at <= now
    }
}

/// Outcome of failing a job
#[derive(Debug, Clone, PartialEq)]
pub enum FailureOutcome {
    /// Job will be retried once `scheduled_at` passes
    WillRetry {
        retry_count: u32,
        scheduled_at: DateTime<Utc>,
    },

    /// Job failed permanently
    Failed { retry_count: u32 },
}

/// Worker liveness status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Active,
    Inactive,
    Dead,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::Dead => "dead",
        }
    }
}

impl FromStr for WorkerStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "dead" => Ok(Self::Dead),
            other => Err(StoreError::Serialization(format!(
                "unknown worker status: {other}"
            ))),
        }
    }
}

/// Worker registration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub capabilities: Vec<String>,
    pub status: WorkerStatus,
    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl WorkerRecord {
    /// Active and heard from within `window`
    pub fn is_alive(&self, now: DateTime<Utc>, window: Duration) -> bool {
        self.status == WorkerStatus::Active && !heartbeat_older_than(self.last_heartbeat, now, window)
    }
}

/// Whether `heartbeat` is more than `window` before `now`
pub(crate) fn heartbeat_older_than(
    heartbeat: DateTime<Utc>,
    now: DateTime<Utc>,
    window: Duration,
) -> bool {
    now.signed_duration_since(heartbeat)
        .to_std()
        .map(|age| age > window)
        .unwrap_or(false)
}

/// What a cleanup pass changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CleanupReport {
    /// Retrying jobs whose delay elapsed, moved back to pending
    pub promoted: u64,
    /// Processing jobs reclaimed from stale workers
    pub reclaimed: u64,
    /// Workers marked dead
    pub dead_workers: u64,
    /// Terminal jobs deleted after the retention period
    pub purged: u64,
}

impl CleanupReport {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Job activity over the last 24 hours
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecentActivity {
    pub created: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Queue statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub retrying: u64,
    pub completed: u64,
    pub failed: u64,
    pub active_workers: u64,
    /// Average claim-to-completion time of completed jobs, in seconds
    pub avg_duration_secs: Option<f64>,
    pub last_24h: RecentActivity,
}

impl QueueStats {
    pub fn total(&self) -> u64 {
        self.pending + self.processing + self.retrying + self.completed + self.failed
    }
}

/// Queue behaviour settings shared by all store implementations
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueConfig {
    /// Backoff for retryable failures
    pub retry: RetryPolicy,

    /// Processing jobs owned by a worker silent for longer are reclaimed
    #[serde(with = "duration_millis")]
    pub stale_worker_threshold: Duration,

    /// Workers silent for longer are marked dead
    #[serde(with = "duration_millis")]
    pub dead_worker_threshold: Duration,

    /// Terminal jobs older than this are deleted
    #[serde(with = "duration_millis")]
    pub retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            stale_worker_threshold: Duration::from_secs(5 * 60),
            dead_worker_threshold: Duration::from_secs(10 * 60),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
        }
    }
}

impl QueueConfig {
    /// Create configuration from environment variables
    ///
    /// - `QUEUE_MAX_RETRIES` (default 3)
    /// - `QUEUE_BACKOFF_BASE_SECS` (default 60)
    /// - `QUEUE_STALE_WORKER_SECS` (default 300)
    /// - `QUEUE_DEAD_WORKER_SECS` (default 600)
    /// - `QUEUE_RETENTION_DAYS` (default 7)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            retry: defaults
                .retry
                .clone()
                .with_max_retries(env_parse("QUEUE_MAX_RETRIES").unwrap_or(3))
                .with_base_delay(Duration::from_secs(
                    env_parse("QUEUE_BACKOFF_BASE_SECS").unwrap_or(60),
                )),
            stale_worker_threshold: env_parse("QUEUE_STALE_WORKER_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.stale_worker_threshold),
            dead_worker_threshold: env_parse("QUEUE_DEAD_WORKER_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.dead_worker_threshold),
            retention: env_parse::<u64>("QUEUE_RETENTION_DAYS")
                .map(|days| Duration::from_secs(days * 24 * 60 * 60))
                .unwrap_or(defaults.retention),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_stale_worker_threshold(mut self, threshold: Duration) -> Self {
        self.stale_worker_threshold = threshold;
        self
    }

    pub fn with_dead_worker_threshold(mut self, threshold: Duration) -> Self {
        self.dead_worker_threshold = threshold;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }
}

/// Durable, concurrency-safe job and worker bookkeeping
///
/// Implementations must guarantee that concurrent [`dequeue`](Self::dequeue)
/// calls never hand the same job to two callers.
#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    // =========================================================================
    // Job Operations
    // =========================================================================

    /// Enqueue a job; returns its id. The job starts `pending`.
    async fn enqueue(&self, job: NewJob) -> Result<Uuid, StoreError>;

    /// Atomically claim the most urgent due job
    ///
    /// Orders by priority (desc) then creation time; only jobs whose
    /// `scheduled_at` has passed are eligible. Returns `None` when nothing is due.
    async fn dequeue(&self, worker_id: &str) -> Result<Option<Job>, StoreError>;

    /// Mark a job completed and store its result
    ///
    /// Only the worker holding the claim may complete it.
    async fn complete_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        result: serde_json::Value,
    ) -> Result<(), StoreError>;

    /// Record a failure by the claiming worker, scheduling a retry with
    /// backoff when allowed
    async fn fail_job(
        &self,
        job_id: Uuid,
        worker_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<FailureOutcome, StoreError>;

    /// Report progress (0-100) without changing status
    async fn update_progress(
        &self,
        job_id: Uuid,
        progress: u8,
        metadata: Option<serde_json::Value>,
    ) -> Result<(), StoreError>;

    /// Load a job by id
    async fn get_job(&self, job_id: Uuid) -> Result<Option<Job>, StoreError>;

    /// Number of jobs that could be claimed right now
    async fn pending_count(&self) -> Result<u64, StoreError>;

    /// Whether a non-terminal job of `job_type` exists for the source
    async fn has_active_job(&self, source_id: i64, job_type: JobType) -> Result<bool, StoreError>;

    // =========================================================================
    // Worker Registry Operations
    // =========================================================================

    /// Register (or re-activate) a worker
    async fn register_worker(&self, worker_id: &str, capabilities: &[String])
        -> Result<(), StoreError>;

    /// Refresh a worker's heartbeat, registering it if unknown
    async fn heartbeat(&self, worker_id: &str) -> Result<(), StoreError>;

    /// Mark a worker inactive
    async fn unregister_worker(&self, worker_id: &str) -> Result<(), StoreError>;

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Promote due retries, reclaim jobs from stale workers, mark dead workers
    /// and purge old terminal jobs. Idempotent.
    async fn cleanup(&self) -> Result<CleanupReport, StoreError>;

    /// Queue statistics
    async fn stats(&self) -> Result<QueueStats, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trip_strings() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Retrying,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("bogus".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_state_machine() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Processing));
        assert!(JobStatus::Processing.can_transition_to(JobStatus::Retrying));
        assert!(JobStatus::Retrying.can_transition_to(JobStatus::Pending));

        // No skipping states
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Completed));
        assert!(!JobStatus::Retrying.can_transition_to(JobStatus::Processing));
        assert!(!JobStatus::Completed.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Retrying));
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(!JobStatus::Retrying.is_terminal());
    }

    #[test]
    fn test_priority_values() {
        assert!(Priority::Urgent > Priority::High);
        assert_eq!(Priority::default().value(), 5);
        assert_eq!(i32::from(Priority::Low), 1);
    }

    #[test]
    fn test_new_job_builder() {
        let job = NewJob::optimize(7)
            .with_priority(Priority::Low)
            .with_payload(serde_json::json!({"dry_run": true}));

        assert_eq!(job.source_id, 7);
        assert_eq!(job.job_type, JobType::OptimizeSource);
        assert_eq!(job.priority, 1);

        let stored = Job::from_new(Uuid::now_v7(), job, Utc::now());
        assert!(stored.dry_run());
        assert_eq!(stored.status, JobStatus::Pending);
    }

    #[test]
    fn test_worker_liveness() {
        let now = Utc::now();
        let mut worker = WorkerRecord {
            worker_id: "w-1".into(),
            capabilities: vec![],
            status: WorkerStatus::Active,
            registered_at: now,
            last_heartbeat: now - chrono::Duration::minutes(2),
        };
        assert!(worker.is_alive(now, Duration::from_secs(300)));

        worker.last_heartbeat = now - chrono::Duration::minutes(6);
        assert!(!worker.is_alive(now, Duration::from_secs(300)));
    }

    #[test]
    fn test_default_queue_config() {
        let config = QueueConfig::default();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.stale_worker_threshold, Duration::from_secs(300));
        assert_eq!(config.dead_worker_threshold, Duration::from_secs(600));
        assert_eq!(config.retention, Duration::from_secs(604_800));
    }
}

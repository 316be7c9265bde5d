//! Sequential job execution loop
//!
//! Decision: a worker handles one job at a time; concurrency comes from the
//! pool running several workers.
//! Decision: a rate-limited job fails as non-retryable instead of blocking
//! the worker; the scheduler re-enqueues it once the budget resets.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::config::{duration_millis, env_parse};
use crate::queue::{FailureOutcome, Job, JobStore, JobType};
use crate::ratelimit::{domain_key, source_key, RateLimitScope, RateLimitTier, RateLimiter};
use crate::source::{FetchError, SourceDescriptor, SourceFetcher, SourceRegistry};

/// Progress reported once the source has been loaded
pub const PROGRESS_SOURCE_LOADED: u8 = 10;
/// Progress reported once rate limits have been checked
pub const PROGRESS_LIMITS_CHECKED: u8 = 30;
/// Progress reported when the fetcher is invoked
pub const PROGRESS_FETCHING: u8 = 50;
/// Progress reported while results are being stored
pub const PROGRESS_RECORDING: u8 = 90;

/// Configuration for a single worker
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerConfig {
    /// Worker ID (unique per worker instance)
    pub worker_id: String,

    /// Capabilities advertised at registration
    pub capabilities: Vec<String>,

    /// Jobs processed before the worker exits
    pub max_jobs: u32,

    #[serde(with = "duration_millis")]
    pub heartbeat_interval: Duration,

    /// Wait when the queue has nothing due
    #[serde(with = "duration_millis")]
    pub idle_wait: Duration,

    /// Pause after each job
    #[serde(with = "duration_millis")]
    pub job_pause: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::now_v7()),
            capabilities: [JobType::ScrapeSource, JobType::OptimizeSource, JobType::TestSource]
                .iter()
                .map(|t| t.as_str().to_string())
                .collect(),
            max_jobs: 50,
            heartbeat_interval: Duration::from_secs(30),
            idle_wait: Duration::from_secs(5),
            job_pause: Duration::from_millis(500),
        }
    }
}

impl WorkerConfig {
    /// Create configuration from environment variables
    ///
    /// - `WORKER_ID` (default: `worker-<uuid>`)
    /// - `WORKER_MAX_JOBS` (default: 50)
    /// - `WORKER_HEARTBEAT_SECS` (default: 30)
    /// - `WORKER_IDLE_WAIT_MS` (default: 5000)
    /// - `WORKER_JOB_PAUSE_MS` (default: 500)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            worker_id: std::env::var("WORKER_ID").unwrap_or(defaults.worker_id),
            capabilities: defaults.capabilities,
            max_jobs: env_parse("WORKER_MAX_JOBS").unwrap_or(defaults.max_jobs),
            heartbeat_interval: env_parse("WORKER_HEARTBEAT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.heartbeat_interval),
            idle_wait: env_parse("WORKER_IDLE_WAIT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.idle_wait),
            job_pause: env_parse("WORKER_JOB_PAUSE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.job_pause),
        }
    }

    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_max_jobs(mut self, max_jobs: u32) -> Self {
        self.max_jobs = max_jobs.max(1);
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_idle_wait(mut self, wait: Duration) -> Self {
        self.idle_wait = wait;
        self
    }

    pub fn with_job_pause(mut self, pause: Duration) -> Self {
        self.job_pause = pause;
        self
    }
}

/// Collaborators shared by every worker
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Arc<dyn JobStore>,
    pub limiter: Arc<RateLimiter>,
    pub fetcher: Arc<dyn SourceFetcher>,
    pub registry: Arc<dyn SourceRegistry>,
}

impl WorkerContext {
    pub fn new(
        store: Arc<dyn JobStore>,
        limiter: Arc<RateLimiter>,
        fetcher: Arc<dyn SourceFetcher>,
        registry: Arc<dyn SourceRegistry>,
    ) -> Self {
        Self {
            store,
            limiter,
            fetcher,
            registry,
        }
    }
}

/// Live view of a worker, shared with its supervisor
#[derive(Debug, Default)]
pub struct WorkerActivity {
    busy: AtomicBool,
    processed: AtomicU64,
}

impl WorkerActivity {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Whether a job is in progress
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Acquire)
    }

    fn start_job(&self) {
        self.busy.store(true, Ordering::Release);
    }

    fn finish_job(&self) {
        self.processed.fetch_add(1, Ordering::AcqRel);
        self.busy.store(false, Ordering::Release);
    }
}

/// How a single job ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// Failed with a retryable error and was rescheduled
    Retrying,
    Failed,
    RateLimited,
}

/// Totals for one `Worker::run`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRunSummary {
    pub processed: u32,
    pub completed: u32,
    pub failed: u32,
    pub retried: u32,
    pub rate_limited: u32,
}

impl WorkerRunSummary {
    fn record(&mut self, outcome: JobOutcome) {
        self.processed += 1;
        match outcome {
            JobOutcome::Completed => self.completed += 1,
            JobOutcome::Retrying => self.retried += 1,
            JobOutcome::Failed => self.failed += 1,
            JobOutcome::RateLimited => self.rate_limited += 1,
        }
    }
}

/// Claims jobs one at a time and runs them through the source fetcher
pub struct Worker {
    config: WorkerConfig,
    ctx: WorkerContext,
    activity: Arc<WorkerActivity>,
    shutdown_rx: Option<watch::Receiver<bool>>,
}

impl Worker {
    pub fn new(ctx: WorkerContext, config: WorkerConfig) -> Self {
        Self {
            config,
            ctx,
            activity: WorkerActivity::new(),
            shutdown_rx: None,
        }
    }

    /// Stop claiming jobs once `true` is sent on this channel
    pub fn with_shutdown(mut self, shutdown_rx: watch::Receiver<bool>) -> Self {
        self.shutdown_rx = Some(shutdown_rx);
        self
    }

    /// Share activity state with a supervisor
    pub fn with_activity(mut self, activity: Arc<WorkerActivity>) -> Self {
        self.activity = activity;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.config.worker_id
    }

    pub fn activity(&self) -> Arc<WorkerActivity> {
        Arc::clone(&self.activity)
    }

    /// Run until the job budget is spent or shutdown is signalled
    #[instrument(skip(self), fields(worker_id = %self.config.worker_id))]
    pub async fn run(mut self) -> WorkerRunSummary {
        let worker_id = self.config.worker_id.clone();
        info!(
            worker_id = %worker_id,
            max_jobs = self.config.max_jobs,
            "Starting worker"
        );

        if let Err(e) = self
            .ctx
            .store
            .register_worker(&worker_id, &self.config.capabilities)
            .await
        {
            error!(worker_id = %worker_id, error = %e, "Failed to register worker");
        }

        let mut summary = WorkerRunSummary::default();
        let mut last_heartbeat = Instant::now();

        while summary.processed < self.config.max_jobs && !self.is_shutdown() {
            if last_heartbeat.elapsed() >= self.config.heartbeat_interval {
                self.heartbeat().await;
                last_heartbeat = Instant::now();
            }

            match self.ctx.store.dequeue(&worker_id).await {
                Ok(Some(job)) => {
                    self.activity.start_job();
                    let outcome = self.execute_with_heartbeat(&job).await;
                    self.activity.finish_job();
                    summary.record(outcome);
                    last_heartbeat = Instant::now();

                    if self.wait(self.config.job_pause).await {
                        break;
                    }
                }
                Ok(None) => {
                    debug!(worker_id = %worker_id, "No job available");
                    if self.wait(self.config.idle_wait).await {
                        break;
                    }
                }
                Err(e) => {
                    error!(worker_id = %worker_id, error = %e, "Failed to dequeue job");
                    if self.wait(self.config.idle_wait).await {
                        break;
                    }
                }
            }
        }

        if let Err(e) = self.ctx.store.unregister_worker(&worker_id).await {
            warn!(worker_id = %worker_id, error = %e, "Failed to unregister worker");
        }

        info!(
            worker_id = %worker_id,
            processed = summary.processed,
            completed = summary.completed,
            failed = summary.failed,
            retried = summary.retried,
            rate_limited = summary.rate_limited,
            "Worker stopped"
        );
        summary
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown_rx
            .as_ref()
            .map(|rx| *rx.borrow())
            .unwrap_or(false)
    }

    /// Sleep for `duration`; returns true if shutdown was signalled meanwhile
    async fn wait(&mut self, duration: Duration) -> bool {
        let Some(rx) = self.shutdown_rx.as_mut() else {
            tokio::time::sleep(duration).await;
            return false;
        };

        let closed = tokio::select! {
            _ = tokio::time::sleep(duration) => false,
            changed = rx.changed() => changed.is_err(),
        };
        if closed {
            // Sender gone: nobody can ask us to stop any more
            self.shutdown_rx = None;
            return false;
        }
        self.is_shutdown()
    }

    async fn heartbeat(&self) {
        if let Err(e) = self.ctx.store.heartbeat(&self.config.worker_id).await {
            warn!(worker_id = %self.config.worker_id, error = %e, "Heartbeat failed");
        }
    }

    /// Execute a job while a background task keeps the worker's heartbeat fresh
    async fn execute_with_heartbeat(&self, job: &Job) -> JobOutcome {
        let store = Arc::clone(&self.ctx.store);
        let worker_id = self.config.worker_id.clone();
        let interval = self.config.heartbeat_interval.max(Duration::from_millis(100));
        let (cancel_tx, mut cancel_rx) = tokio::sync::oneshot::channel::<()>();

        let heartbeat_handle = tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = store.heartbeat(&worker_id).await {
                            warn!(worker_id = %worker_id, error = %e, "Heartbeat failed");
                        }
                    }
                    _ = &mut cancel_rx => break,
                }
            }
        });

        let outcome = self.execute(job).await;

        let _ = cancel_tx.send(());
        let _ = heartbeat_handle.await;
        outcome
    }

    #[instrument(
        skip(self, job),
        fields(job_id = %job.id, source_id = job.source_id, job_type = %job.job_type)
    )]
    async fn execute(&self, job: &Job) -> JobOutcome {
        info!(
            job_id = %job.id,
            source_id = job.source_id,
            job_type = %job.job_type,
            retry_count = job.retry_count,
            "Processing job"
        );

        let source = match self.ctx.registry.get_source(job.source_id).await {
            Ok(Some(source)) => source,
            Ok(None) => {
                return self
                    .fail(job, &format!("source {} not found", job.source_id), false)
                    .await;
            }
            Err(e) => return self.fail(job, &e.to_string(), e.is_retryable()).await,
        };
        self.progress(job, PROGRESS_SOURCE_LOADED, "source_loaded").await;

        // Reserve usage on the source and domain keys before fetching
        let keys = limit_keys(&source);
        let requests: Vec<(&str, &[RateLimitTier])> = keys
            .iter()
            .map(|(scope, key)| (key.as_str(), self.ctx.limiter.tiers(*scope)))
            .collect();
        if let Err(key) = self.ctx.limiter.try_acquire_all(&requests).await {
            let tiers = keys
                .iter()
                .find(|(_, k)| *k == key)
                .map(|(scope, _)| self.ctx.limiter.tiers(*scope))
                .unwrap_or_default();
            let reset = self.ctx.limiter.exhausted_reset_time(&key, tiers).await;
            warn!(
                job_id = %job.id,
                source_id = job.source_id,
                key = %key,
                reset_secs = reset.as_secs(),
                "Rate limit exceeded, skipping job"
            );
            let message = format!("rate limited: {key} (resets in {}s)", reset.as_secs());
            self.fail(job, &message, false).await;
            return JobOutcome::RateLimited;
        }
        self.progress(job, PROGRESS_LIMITS_CHECKED, "rate_limits_checked").await;

        self.progress(job, PROGRESS_FETCHING, "fetching").await;
        let started = Instant::now();
        let result = self.dispatch(job, &source).await;

        match result {
            Ok(output) => {
                self.progress(job, PROGRESS_RECORDING, "recording_results").await;

                match self.ctx.store.complete_job(job.id, &self.config.worker_id, output).await {
                    Ok(()) => {
                        info!(
                            job_id = %job.id,
                            source_id = job.source_id,
                            duration_ms = started.elapsed().as_millis() as u64,
                            "Job completed"
                        );
                        JobOutcome::Completed
                    }
                    Err(e) => {
                        error!(job_id = %job.id, error = %e, "Failed to complete job");
                        JobOutcome::Failed
                    }
                }
            }
            Err(e) => {
                let retryable = e.is_retryable();
                warn!(
                    job_id = %job.id,
                    source_id = job.source_id,
                    error = %e,
                    retryable,
                    "Job execution failed"
                );
                self.fail(job, &e.to_string(), retryable).await
            }
        }
    }

    async fn dispatch(
        &self,
        job: &Job,
        source: &SourceDescriptor,
    ) -> Result<serde_json::Value, FetchError> {
        match job.job_type {
            JobType::ScrapeSource => {
                let summary = self.ctx.fetcher.scrape(source).await?;
                Ok(serde_json::json!({
                    "events_found": summary.events_found,
                    "events_added": summary.events_added,
                    "completed_at": Utc::now(),
                }))
            }
            JobType::OptimizeSource => {
                let report = self.ctx.fetcher.optimize(source.id, job.dry_run()).await?;
                Ok(report.0)
            }
            JobType::TestSource => {
                let report = self
                    .ctx
                    .fetcher
                    .test_and_optimize(source.id, job.dry_run())
                    .await?;
                Ok(report.0)
            }
        }
    }

    async fn fail(&self, job: &Job, message: &str, retryable: bool) -> JobOutcome {
        let recorded = self
            .ctx
            .store
            .fail_job(job.id, &self.config.worker_id, message, retryable)
            .await;
        match recorded {
            Ok(FailureOutcome::WillRetry {
                retry_count,
                scheduled_at,
            }) => {
                info!(
                    job_id = %job.id,
                    source_id = job.source_id,
                    worker_id = %self.config.worker_id,
                    retry_count,
                    %scheduled_at,
                    error = message,
                    "Job scheduled for retry"
                );
                JobOutcome::Retrying
            }
            Ok(FailureOutcome::Failed { retry_count }) => {
                warn!(
                    job_id = %job.id,
                    source_id = job.source_id,
                    worker_id = %self.config.worker_id,
                    retry_count,
                    error = message,
                    "Job failed permanently"
                );
                JobOutcome::Failed
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to record job failure");
                JobOutcome::Failed
            }
        }
    }

    async fn progress(&self, job: &Job, progress: u8, stage: &str) {
        let metadata = serde_json::json!({
            "stage": stage,
            "worker_id": self.config.worker_id,
        });
        if let Err(e) = self
            .ctx
            .store
            .update_progress(job.id, progress, Some(metadata))
            .await
        {
            debug!(job_id = %job.id, error = %e, "Failed to report progress");
        }
    }
}

/// Rate limit keys that apply to a source: its own budget plus its domain's
fn limit_keys(source: &SourceDescriptor) -> Vec<(RateLimitScope, String)> {
    let mut keys = vec![(RateLimitScope::Source, source_key(source.id))];
    if let Some(domain) = domain_key(&source.url) {
        keys.push((RateLimitScope::Domain, domain));
    }
    keys
}

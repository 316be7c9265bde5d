//! Worker pool manager
//!
//! Keeps the number of live workers proportional to the queue backlog,
//! restarts long-lived workers and drains everything on shutdown.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use sysinfo::System;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};

use super::execution::{
    ExecutionMode, ExecutionUnit, StopOutcome, StopSignal, UnitHandle, WorkerFactory,
    WorkerFuture,
};
use super::runner::{Worker, WorkerActivity, WorkerConfig, WorkerContext};
use crate::config::{duration_millis, env_parse};
use crate::queue::StoreError;

/// Memory budgeted per worker when deriving the default pool size
const MEMORY_PER_WORKER: u64 = 256 * 1024 * 1024;

/// Pool manager configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PoolConfig {
    /// Upper bound on live workers
    pub max_workers: usize,

    /// Workers kept alive even with an empty backlog
    pub min_workers: usize,

    /// Pending jobs each worker is expected to absorb
    pub jobs_per_worker: u64,

    /// Backlog size at which `large_backlog_cap` applies
    pub large_backlog_threshold: u64,
    pub large_backlog_cap: usize,

    /// Workers spawned per adjustment cycle at most
    pub max_spawn_per_cycle: usize,

    #[serde(with = "duration_millis")]
    pub adjust_interval: Duration,

    /// Grace period when stopping a single worker
    #[serde(with = "duration_millis")]
    pub stop_grace: Duration,

    /// Grace period for all workers on shutdown
    #[serde(with = "duration_millis")]
    pub shutdown_grace: Duration,

    /// Workers older than this are restarted by the health pass
    #[serde(with = "duration_millis")]
    pub max_worker_lifetime: Duration,

    pub execution_mode: ExecutionMode,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            min_workers: 1,
            jobs_per_worker: 5,
            large_backlog_threshold: 50,
            large_backlog_cap: 8,
            max_spawn_per_cycle: 2,
            adjust_interval: Duration::from_secs(10),
            stop_grace: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(30),
            max_worker_lifetime: Duration::from_secs(3600),
            execution_mode: ExecutionMode::Task,
        }
    }
}

impl PoolConfig {
    /// Create configuration from environment variables
    ///
    /// - `MAX_WORKERS` (default: derived from CPU and memory)
    /// - `MIN_WORKERS` (default: 1)
    /// - `POOL_ADJUST_INTERVAL_SECS` (default: 10)
    /// - `POOL_MAX_WORKER_LIFETIME_SECS` (default: 3600)
    /// - `POOL_EXECUTION_MODE`: `task`, `thread` or `inline` (default: task)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            max_workers: env_parse("MAX_WORKERS").unwrap_or(defaults.max_workers),
            min_workers: env_parse("MIN_WORKERS").unwrap_or(defaults.min_workers),
            adjust_interval: env_parse("POOL_ADJUST_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.adjust_interval),
            max_worker_lifetime: env_parse("POOL_MAX_WORKER_LIFETIME_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.max_worker_lifetime),
            execution_mode: env_parse("POOL_EXECUTION_MODE").unwrap_or(defaults.execution_mode),
            ..defaults
        }
    }

    pub fn with_max_workers(mut self, max: usize) -> Self {
        self.max_workers = max.max(1);
        self
    }

    pub fn with_min_workers(mut self, min: usize) -> Self {
        self.min_workers = min;
        self
    }

    pub fn with_adjust_interval(mut self, interval: Duration) -> Self {
        self.adjust_interval = interval;
        self
    }

    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_max_worker_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_worker_lifetime = lifetime;
        self
    }

    pub fn with_execution_mode(mut self, mode: ExecutionMode) -> Self {
        self.execution_mode = mode;
        self
    }
}

/// Default worker ceiling: one per CPU, fewer when memory is short
pub fn default_max_workers() -> usize {
    let cpus = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);

    let mut system = System::new();
    system.refresh_memory();
    let available = system.available_memory();

    // Some sandboxes report zero; trust the CPU count then
    let by_memory = if available == 0 {
        cpus
    } else {
        usize::try_from(available / MEMORY_PER_WORKER).unwrap_or(usize::MAX)
    };

    cpus.min(by_memory).max(1)
}

/// Number of workers the pool should run for a given backlog
///
/// Growth is bounded to `max_spawn_per_cycle` per call; shrinking only
/// happens when the backlog is empty.
pub fn target_worker_count(pending: u64, active: usize, config: &PoolConfig) -> usize {
    let max = config.max_workers.max(1);
    let floor = config.min_workers.min(max);
    if pending == 0 {
        return floor;
    }

    let per_worker = config.jobs_per_worker.max(1);
    let mut theoretical = usize::try_from(pending.div_ceil(per_worker))
        .unwrap_or(usize::MAX)
        .min(max);
    if pending >= config.large_backlog_threshold {
        theoretical = theoretical.min(config.large_backlog_cap);
    }

    theoretical
        .min(active.saturating_add(config.max_spawn_per_cycle))
        .max(floor)
}

/// Pool manager errors
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("failed to spawn worker: {0}")]
    Spawn(String),

    #[error("worker pool is already running")]
    AlreadyRunning,

    #[error("worker pool is not running")]
    NotRunning,
}

/// Lifecycle state of the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    Stopped,
    Running,
    /// Shutdown in progress, no new workers
    Draining,
}

/// Result of one sizing cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolAdjustment {
    pub pending: u64,
    pub active_before: usize,
    pub target: usize,
    pub spawned: usize,
    pub retired: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolWorkerStatus {
    pub worker_id: String,
    pub age_secs: u64,
    pub busy: bool,
    pub processed: u64,
}

/// Snapshot of the pool for the admin surface
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub state: PoolState,
    pub execution_mode: ExecutionMode,
    pub max_workers: usize,
    pub active_workers: usize,
    pub busy_workers: usize,
    pub workers: Vec<PoolWorkerStatus>,
}

struct ManagedWorker {
    handle: UnitHandle,
    activity: Arc<WorkerActivity>,
}

/// Supervises a set of workers
///
/// # Example
///
/// ```ignore
/// let pool = Arc::new(WorkerPoolManager::new(ctx, WorkerConfig::from_env(), PoolConfig::from_env()));
///
/// let runner = Arc::clone(&pool);
/// tokio::spawn(async move { runner.run().await });
///
/// // ... later
/// pool.shutdown().await?;
/// ```
pub struct WorkerPoolManager {
    ctx: WorkerContext,
    worker_template: WorkerConfig,
    config: PoolConfig,
    unit: Arc<dyn ExecutionUnit>,
    /// Oldest first
    workers: Mutex<Vec<ManagedWorker>>,
    /// Stop signal of the worker running in degraded inline mode
    inline_worker: Mutex<Option<StopSignal>>,
    next_seq: AtomicU64,
    state: RwLock<PoolState>,
    shutdown_tx: watch::Sender<bool>,
}

impl WorkerPoolManager {
    pub fn new(ctx: WorkerContext, worker_template: WorkerConfig, config: PoolConfig) -> Self {
        let unit = config.execution_mode.unit();
        Self::with_execution_unit(ctx, worker_template, config, unit)
    }

    /// Use a custom execution unit instead of the configured mode
    pub fn with_execution_unit(
        ctx: WorkerContext,
        worker_template: WorkerConfig,
        config: PoolConfig,
        unit: Arc<dyn ExecutionUnit>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            ctx,
            worker_template,
            config,
            unit,
            workers: Mutex::new(Vec::new()),
            inline_worker: Mutex::new(None),
            next_seq: AtomicU64::new(0),
            state: RwLock::new(PoolState::Stopped),
            shutdown_tx,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    pub fn state(&self) -> PoolState {
        *self.state.read()
    }

    /// Workers whose execution unit is still alive
    pub fn active_workers(&self) -> usize {
        self.workers
            .lock()
            .iter()
            .filter(|w| !w.handle.is_finished())
            .count()
    }

    pub fn status(&self) -> PoolStatus {
        let workers: Vec<PoolWorkerStatus> = self
            .workers
            .lock()
            .iter()
            .filter(|w| !w.handle.is_finished())
            .map(|w| PoolWorkerStatus {
                worker_id: w.handle.worker_id().to_string(),
                age_secs: w.handle.age().as_secs(),
                busy: w.activity.is_busy(),
                processed: w.activity.processed(),
            })
            .collect();

        PoolStatus {
            state: self.state(),
            execution_mode: self.config.execution_mode,
            max_workers: self.config.max_workers,
            active_workers: workers.len(),
            busy_workers: workers.iter().filter(|w| w.busy).count(),
            workers,
        }
    }

    /// Start the pool with its minimum worker count
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), PoolError> {
        {
            let mut state = self.state.write();
            if *state != PoolState::Stopped {
                return Err(PoolError::AlreadyRunning);
            }
            *state = PoolState::Running;
        }
        self.shutdown_tx.send_replace(false);

        info!(
            execution_unit = self.unit.name(),
            max_workers = self.config.max_workers,
            min_workers = self.config.min_workers,
            "Starting worker pool"
        );

        if !self.unit.supports_concurrency() {
            warn!(
                execution_unit = self.unit.name(),
                "Execution unit has no concurrency, running a single blocking worker (degraded mode)"
            );
            return Ok(());
        }

        for _ in 0..self.config.min_workers.min(self.config.max_workers) {
            self.spawn_worker()?;
        }
        Ok(())
    }

    /// One sizing cycle: grow towards the backlog-derived target or retire idle workers
    #[instrument(skip(self))]
    pub async fn adjust(&self) -> Result<PoolAdjustment, PoolError> {
        if self.state() != PoolState::Running {
            return Err(PoolError::NotRunning);
        }
        self.reap_finished();

        let pending = self.ctx.store.pending_count().await?;
        let active_before = self.active_workers();

        if !self.unit.supports_concurrency() {
            return Ok(PoolAdjustment {
                pending,
                active_before,
                target: 1,
                ..Default::default()
            });
        }

        let target = target_worker_count(pending, active_before, &self.config);
        let mut adjustment = PoolAdjustment {
            pending,
            active_before,
            target,
            ..Default::default()
        };

        if target > active_before {
            for _ in active_before..target {
                self.spawn_worker()?;
                adjustment.spawned += 1;
            }
        } else if pending == 0 && active_before > target {
            adjustment.retired = self.retire_idle(active_before - target).await;
        }

        if adjustment.spawned > 0 || adjustment.retired > 0 {
            info!(
                pending,
                active_before,
                target,
                spawned = adjustment.spawned,
                retired = adjustment.retired,
                "Adjusted worker pool"
            );
        } else {
            debug!(pending, active = active_before, target, "Worker pool size unchanged");
        }
        Ok(adjustment)
    }

    /// Restart workers that have been alive longer than the configured lifetime
    ///
    /// Returns the number of workers restarted.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> usize {
        let lifetime = self.config.max_worker_lifetime;
        let expired: Vec<ManagedWorker> = {
            let mut workers = self.workers.lock();
            let (expired, keep) = std::mem::take(&mut *workers)
                .into_iter()
                .partition(|w| !w.handle.is_finished() && w.handle.age() >= lifetime);
            *workers = keep;
            expired
        };

        if expired.is_empty() {
            return 0;
        }

        let count = expired.len();
        for worker in &expired {
            info!(
                worker_id = %worker.handle.worker_id(),
                age_secs = worker.handle.age().as_secs(),
                "Restarting long-lived worker"
            );
        }
        self.stop_all(expired, self.config.stop_grace).await;

        let mut restarted = 0;
        for _ in 0..count {
            match self.spawn_worker() {
                Ok(()) => restarted += 1,
                Err(e) => {
                    warn!(error = %e, "Failed to replace restarted worker");
                    break;
                }
            }
        }
        restarted
    }

    /// Supervise until shutdown is requested
    pub async fn run(&self) -> Result<(), PoolError> {
        if self.state() == PoolState::Stopped {
            self.start().await?;
        }
        if !self.unit.supports_concurrency() {
            return self.run_degraded().await;
        }

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(self.config.adjust_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.is_draining() {
                        break;
                    }
                    match self.adjust().await {
                        Ok(_) => {}
                        Err(PoolError::NotRunning) => break,
                        Err(e) => error!(error = %e, "Worker pool adjustment failed"),
                    }
                    self.health_check().await;
                }
                _ = shutdown_rx.changed() => {
                    if self.is_draining() {
                        break;
                    }
                }
            }
        }

        debug!("Worker pool supervisor exited");
        Ok(())
    }

    /// Single blocking worker, restarted whenever its job budget runs out
    async fn run_degraded(&self) -> Result<(), PoolError> {
        while !self.is_draining() {
            let (handle, _) = self.spawn_handle()?;
            *self.inline_worker.lock() = Some(handle.stop_signal());
            if self.is_draining() {
                handle.signal_stop();
            }

            let summary = handle.join().await;
            self.inline_worker.lock().take();
            debug!(?summary, "Inline worker finished");
        }
        Ok(())
    }

    /// Stop every worker, forcing those still alive after the shutdown grace
    #[instrument(skip(self))]
    pub async fn shutdown(&self) -> Result<(), PoolError> {
        {
            let mut state = self.state.write();
            if *state != PoolState::Running {
                return Ok(());
            }
            *state = PoolState::Draining;
        }

        info!("Initiating worker pool shutdown");
        self.shutdown_tx.send_replace(true);
        if let Some(signal) = self.inline_worker.lock().as_ref() {
            signal.stop();
        }

        let workers = std::mem::take(&mut *self.workers.lock());
        let (graceful, forced) = self.stop_all(workers, self.config.shutdown_grace).await;

        *self.state.write() = PoolState::Stopped;
        info!(graceful, forced, "Worker pool stopped");
        Ok(())
    }

    fn is_draining(&self) -> bool {
        self.state() != PoolState::Running
    }

    fn spawn_handle(&self) -> Result<(UnitHandle, Arc<WorkerActivity>), PoolError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let config = self
            .worker_template
            .clone()
            .with_worker_id(format!("{}-{}", self.worker_template.worker_id, seq));
        let activity = WorkerActivity::new();
        let worker = Worker::new(self.ctx.clone(), config).with_activity(Arc::clone(&activity));
        let worker_id = worker.worker_id().to_string();

        let factory: WorkerFactory = Box::new(move |shutdown_rx: watch::Receiver<bool>| {
            Box::pin(worker.with_shutdown(shutdown_rx).run()) as WorkerFuture
        });
        let handle = self.unit.spawn(&worker_id, factory)?;
        Ok((handle, activity))
    }

    fn spawn_worker(&self) -> Result<(), PoolError> {
        if self.is_draining() {
            return Err(PoolError::NotRunning);
        }
        let (handle, activity) = self.spawn_handle()?;
        info!(worker_id = %handle.worker_id(), "Spawned worker");
        self.workers.lock().push(ManagedWorker { handle, activity });
        Ok(())
    }

    /// Drop handles of workers that exited on their own (budget spent)
    fn reap_finished(&self) {
        self.workers.lock().retain(|w| {
            let finished = w.handle.is_finished();
            if finished {
                debug!(worker_id = %w.handle.worker_id(), "Worker exited");
            }
            !finished
        });
    }

    /// Stop up to `count` idle workers, oldest first
    async fn retire_idle(&self, count: usize) -> usize {
        let victims: Vec<ManagedWorker> = {
            let mut workers = self.workers.lock();
            let mut victims = Vec::new();
            let mut idx = 0;
            while idx < workers.len() && victims.len() < count {
                if workers[idx].activity.is_busy() {
                    idx += 1;
                } else {
                    victims.push(workers.remove(idx));
                }
            }
            victims
        };

        let retired = victims.len();
        for worker in &victims {
            info!(worker_id = %worker.handle.worker_id(), "Retiring idle worker");
        }
        self.stop_all(victims, self.config.stop_grace).await;
        retired
    }

    /// Stop workers concurrently; returns (graceful, forced)
    async fn stop_all(&self, workers: Vec<ManagedWorker>, grace: Duration) -> (usize, usize) {
        for worker in &workers {
            worker.handle.signal_stop();
        }

        let outcomes = join_all(workers.into_iter().map(|w| w.handle.stop(grace))).await;
        let forced = outcomes
            .iter()
            .filter(|o| **o == StopOutcome::Forced)
            .count();
        if forced > 0 {
            warn!(forced, "Force-stopped workers after grace period");
        }
        (outcomes.len() - forced, forced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{InMemoryJobStore, JobStore, NewJob};
    use crate::ratelimit::RateLimiter;
    use crate::source::{
        FetchError, InMemorySourceRegistry, OptimizationReport, ScrapeSummary, SourceDescriptor,
        SourceFetcher,
    };
    use async_trait::async_trait;

    fn config(max: usize) -> PoolConfig {
        PoolConfig {
            max_workers: max,
            ..Default::default()
        }
    }

    #[test]
    fn test_target_growth_is_bounded_per_cycle() {
        let config = config(16);
        assert_eq!(target_worker_count(100, 1, &config), 3);
        assert_eq!(target_worker_count(100, 3, &config), 5);
        assert_eq!(target_worker_count(100, 7, &config), 8);
        assert_eq!(target_worker_count(100, 8, &config), 8);
    }

    #[test]
    fn test_target_follows_backlog() {
        let config = config(4);
        assert_eq!(target_worker_count(3, 1, &config), 1);
        assert_eq!(target_worker_count(12, 1, &config), 3);
        assert_eq!(target_worker_count(40, 4, &config), 4);
        // Smaller than active: no shrink while work remains
        assert_eq!(target_worker_count(4, 4, &config), 1);
    }

    #[test]
    fn test_target_empty_backlog_keeps_floor() {
        let config = config(8);
        assert_eq!(target_worker_count(0, 6, &config), 1);
        assert_eq!(target_worker_count(0, 0, &config.clone().with_min_workers(0)), 0);
    }

    #[test]
    fn test_default_max_workers_positive() {
        assert!(default_max_workers() >= 1);
    }

    struct IdleFetcher;

    #[async_trait]
    impl SourceFetcher for IdleFetcher {
        async fn scrape(&self, _source: &SourceDescriptor) -> Result<ScrapeSummary, FetchError> {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(ScrapeSummary::default())
        }

        async fn optimize(
            &self,
            _source_id: i64,
            _dry_run: bool,
        ) -> Result<OptimizationReport, FetchError> {
            Ok(OptimizationReport::default())
        }

        async fn test_and_optimize(
            &self,
            _source_id: i64,
            _dry_run: bool,
        ) -> Result<OptimizationReport, FetchError> {
            Ok(OptimizationReport::default())
        }
    }

    fn manager(store: Arc<InMemoryJobStore>, config: PoolConfig) -> WorkerPoolManager {
        let ctx = WorkerContext::new(
            store,
            Arc::new(RateLimiter::in_memory()),
            Arc::new(IdleFetcher),
            Arc::new(InMemorySourceRegistry::new()),
        );
        let template = WorkerConfig::default()
            .with_worker_id("pool-test")
            .with_idle_wait(Duration::from_secs(60));
        WorkerPoolManager::new(ctx, template, config)
    }

    #[tokio::test]
    async fn test_adjust_spawns_at_most_two() {
        let store = Arc::new(InMemoryJobStore::new());
        for source_id in 0..100 {
            store.enqueue(NewJob::scrape(source_id)).await.unwrap();
        }
        let pool = manager(
            Arc::clone(&store),
            config(16).with_stop_grace(Duration::from_millis(200)),
        );

        pool.start().await.unwrap();
        assert_eq!(pool.active_workers(), 1);

        let adjustment = pool.adjust().await.unwrap();
        assert_eq!(adjustment.active_before, 1);
        assert!(adjustment.spawned <= 2);
        assert!(pool.active_workers() <= 3);

        pool.shutdown().await.unwrap();
        assert_eq!(pool.state(), PoolState::Stopped);
        assert_eq!(pool.active_workers(), 0);
    }

    #[tokio::test]
    async fn test_adjust_retires_idle_workers_on_empty_backlog() {
        let store = Arc::new(InMemoryJobStore::new());
        let pool = manager(
            Arc::clone(&store),
            config(8).with_stop_grace(Duration::from_secs(1)),
        );
        pool.start().await.unwrap();
        pool.spawn_worker().unwrap();
        pool.spawn_worker().unwrap();
        assert_eq!(pool.active_workers(), 3);

        let adjustment = pool.adjust().await.unwrap();
        assert_eq!(adjustment.pending, 0);
        assert_eq!(adjustment.target, 1);
        assert_eq!(adjustment.retired, 2);
        assert_eq!(pool.active_workers(), 1);

        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_health_check_restarts_old_workers() {
        let store = Arc::new(InMemoryJobStore::new());
        let pool = manager(
            store,
            config(4)
                .with_max_worker_lifetime(Duration::from_millis(20))
                .with_stop_grace(Duration::from_secs(1)),
        );
        pool.start().await.unwrap();
        let before = pool.status().workers[0].worker_id.clone();

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.health_check().await, 1);

        let status = pool.status();
        assert_eq!(status.active_workers, 1);
        assert_ne!(status.workers[0].worker_id, before);

        pool.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let pool = manager(Arc::new(InMemoryJobStore::new()), config(2));
        tokio_test::assert_ok!(pool.start().await);
        let err = tokio_test::assert_err!(pool.start().await);
        assert!(matches!(err, PoolError::AlreadyRunning));

        tokio_test::assert_ok!(pool.shutdown().await);
        let err = tokio_test::assert_err!(pool.adjust().await);
        assert!(matches!(err, PoolError::NotRunning));
    }

    #[tokio::test]
    async fn test_inline_mode_runs_until_shutdown() {
        let store = Arc::new(InMemoryJobStore::new());
        let pool = Arc::new(manager(
            store,
            config(4).with_execution_mode(ExecutionMode::Inline),
        ));

        let runner = Arc::clone(&pool);
        let run = tokio::spawn(async move { runner.run().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(pool.state(), PoolState::Running);
        pool.shutdown().await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("inline worker did not stop");
        assert!(result.unwrap().is_ok());
    }
}

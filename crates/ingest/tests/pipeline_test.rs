//! End-to-end tests over the in-memory backends
//!
//! Scheduler -> queue -> pool -> worker -> fetcher, with a scripted fetcher
//! standing in for the network.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use harvester_ingest::queue::{InMemoryJobStore, JobStatus, JobStore, NewJob, WorkerStatus};
use harvester_ingest::ratelimit::RateLimiter;
use harvester_ingest::scheduler::{Scheduler, SchedulerConfig};
use harvester_ingest::source::{
    FetchError, InMemorySourceRegistry, OptimizationReport, ScrapeAttempt, ScrapeSummary,
    SourceDescriptor, SourceFetcher,
};
use harvester_ingest::worker::{
    PoolConfig, Worker, WorkerConfig, WorkerContext, WorkerPoolManager,
};

/// Fetcher that fails each source a scripted number of times, then succeeds
struct FlakyFetcher {
    registry: Arc<InMemorySourceRegistry>,
    failures_left: Mutex<HashMap<i64, u32>>,
    calls: AtomicU32,
}

impl FlakyFetcher {
    fn new(registry: Arc<InMemorySourceRegistry>) -> Self {
        Self {
            registry,
            failures_left: Mutex::new(HashMap::new()),
            calls: AtomicU32::new(0),
        }
    }

    fn fail_times(self, source_id: i64, times: u32) -> Self {
        self.failures_left.lock().insert(source_id, times);
        self
    }
}

#[async_trait]
impl SourceFetcher for FlakyFetcher {
    async fn scrape(&self, source: &SourceDescriptor) -> Result<ScrapeSummary, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let fail = {
            let mut failures = self.failures_left.lock();
            match failures.get_mut(&source.id) {
                Some(left) if *left > 0 => {
                    *left -= 1;
                    true
                }
                _ => false,
            }
        };

        let elapsed = Duration::from_millis(5);
        if fail {
            self.registry.record_attempt(
                source.id,
                ScrapeAttempt::failure("connection reset by peer", elapsed, Utc::now()),
            );
            return Err(FetchError::Connection("connection reset by peer".into()));
        }

        self.registry
            .record_attempt(source.id, ScrapeAttempt::success(6, elapsed, Utc::now()));
        Ok(ScrapeSummary {
            events_found: 6,
            events_added: 2,
        })
    }

    async fn optimize(
        &self,
        source_id: i64,
        dry_run: bool,
    ) -> Result<OptimizationReport, FetchError> {
        Ok(OptimizationReport(
            serde_json::json!({"source_id": source_id, "dry_run": dry_run, "changes": []}),
        ))
    }

    async fn test_and_optimize(
        &self,
        source_id: i64,
        dry_run: bool,
    ) -> Result<OptimizationReport, FetchError> {
        Ok(OptimizationReport(
            serde_json::json!({"source_id": source_id, "dry_run": dry_run, "healthy": true}),
        ))
    }
}

fn sources() -> Vec<SourceDescriptor> {
    vec![
        SourceDescriptor::new(1, "Library", "https://library.example.org/events.ics")
            .with_scrape_type("ical"),
        SourceDescriptor::new(2, "Museum", "https://museum.example.org/whatson"),
        SourceDescriptor::new(3, "Parks", "https://parks.example.gov/calendar"),
    ]
}

fn worker_config(id: &str) -> WorkerConfig {
    WorkerConfig::default()
        .with_worker_id(id)
        .with_idle_wait(Duration::from_millis(20))
        .with_job_pause(Duration::ZERO)
        .with_heartbeat_interval(Duration::from_millis(200))
}

async fn wait_for<F>(mut done: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !done() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[test_log::test(tokio::test)]
async fn test_scheduled_sources_are_scraped_by_pool() {
    let store = Arc::new(InMemoryJobStore::new());
    let limiter = Arc::new(RateLimiter::in_memory());
    let registry = Arc::new(InMemorySourceRegistry::with_sources(sources()));
    let fetcher = Arc::new(FlakyFetcher::new(registry.clone()));

    let scheduler = Scheduler::new(
        store.clone(),
        limiter.clone(),
        registry.clone(),
        SchedulerConfig::default()
            .with_jitter_max(Duration::ZERO)
            .with_min_schedule_weight(1.0)
            .with_maintenance(false),
    );
    let report = scheduler.run_once().await.unwrap();
    assert_eq!(report.scheduled, 3);

    let ctx = WorkerContext::new(store.clone(), limiter.clone(), fetcher.clone(), registry.clone());
    let pool = Arc::new(WorkerPoolManager::new(
        ctx,
        worker_config("pipeline"),
        PoolConfig::default()
            .with_max_workers(4)
            .with_adjust_interval(Duration::from_millis(50)),
    ));
    let runner = Arc::clone(&pool);
    let supervisor = tokio::spawn(async move { runner.run().await });

    wait_for(|| store.count_by_status(JobStatus::Completed) == 3).await;
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);

    pool.shutdown().await.unwrap();
    supervisor.await.unwrap().unwrap();

    // Freshly scraped sources are not scheduled again right away
    let again = scheduler.run_once().await.unwrap();
    assert_eq!(again.scheduled, 0);
    assert!(again
        .decisions
        .iter()
        .all(|d| d.reasons.last().map(String::as_str) == Some("score too low")));

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.completed, 3);
    assert_eq!(stats.active_workers, 0);
}

#[test_log::test(tokio::test)]
async fn test_transient_failure_is_retried_after_backoff() {
    let store = Arc::new(InMemoryJobStore::new());
    let limiter = Arc::new(RateLimiter::in_memory());
    let registry = Arc::new(InMemorySourceRegistry::with_sources(sources()));
    let fetcher = Arc::new(FlakyFetcher::new(registry.clone()).fail_times(2, 1));
    let ctx = WorkerContext::new(store.clone(), limiter, fetcher.clone(), registry);

    let job_id = store.enqueue(NewJob::scrape(2)).await.unwrap();

    Worker::new(ctx.clone(), worker_config("w-1").with_max_jobs(1))
        .run()
        .await;
    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Retrying);
    assert_eq!(job.retry_count, 1);
    assert!(job.scheduled_at > Utc::now() + chrono::Duration::seconds(50));

    // Not claimable until the backoff elapses
    assert!(store.dequeue("idle-check").await.unwrap().is_none());

    store.backdate_job(job_id, Duration::from_secs(61));
    let cleanup = store.cleanup().await.unwrap();
    assert_eq!(cleanup.promoted, 1);

    let summary = Worker::new(ctx, worker_config("w-2").with_max_jobs(1))
        .run()
        .await;
    assert_eq!(summary.completed, 1);

    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 1);
    assert_eq!(job.result.unwrap()["events_added"], 2);
}

#[test_log::test(tokio::test)]
async fn test_job_of_crashed_worker_is_reclaimed() {
    let store = Arc::new(InMemoryJobStore::new());
    let limiter = Arc::new(RateLimiter::in_memory());
    let registry = Arc::new(InMemorySourceRegistry::with_sources(sources()));
    let fetcher = Arc::new(FlakyFetcher::new(registry.clone()));
    let ctx = WorkerContext::new(store.clone(), limiter, fetcher, registry);

    // A worker claims the job and then goes silent
    let job_id = store.enqueue(NewJob::scrape(3)).await.unwrap();
    store.register_worker("crashed", &[]).await.unwrap();
    let claimed = store.dequeue("crashed").await.unwrap().unwrap();
    assert_eq!(claimed.id, job_id);

    store.backdate_heartbeat("crashed", Duration::from_secs(6 * 60));
    let report = store.cleanup().await.unwrap();
    assert_eq!(report.reclaimed, 1);

    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Pending);
    assert!(job.worker_id.is_none());

    let summary = Worker::new(ctx, worker_config("rescuer").with_max_jobs(1))
        .run()
        .await;
    assert_eq!(summary.completed, 1);

    store.backdate_heartbeat("crashed", Duration::from_secs(11 * 60));
    store.cleanup().await.unwrap();
    assert_eq!(store.worker("crashed").unwrap().status, WorkerStatus::Dead);
}

#[test_log::test(tokio::test)]
async fn test_domain_budget_is_shared_across_sources() {
    let store = Arc::new(InMemoryJobStore::new());
    let limiter = Arc::new(RateLimiter::in_memory());
    let registry = Arc::new(InMemorySourceRegistry::with_sources([
        SourceDescriptor::new(10, "Events A", "https://city.example.org/a"),
        SourceDescriptor::new(11, "Events B", "https://city.example.org/b"),
    ]));
    let fetcher = Arc::new(FlakyFetcher::new(registry.clone()));
    let ctx = WorkerContext::new(store.clone(), limiter.clone(), fetcher.clone(), registry);

    // Domain burst tier allows 5 per 5 minutes
    for _ in 0..5 {
        limiter.record_usage("domain_city.example.org").await;
    }
    let job_id = store.enqueue(NewJob::scrape(11)).await.unwrap();

    let summary = Worker::new(ctx, worker_config("w-domain").with_max_jobs(1))
        .run()
        .await;
    assert_eq!(summary.rate_limited, 1);
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);

    let job = store.get_job(job_id).await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job
        .error_message
        .unwrap()
        .contains("domain_city.example.org"));
}

//! Decision engine and scheduling loop

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::config::SchedulerConfig;
use super::factors::{default_factors, since, FactorContext, SchedulingFactor};
use crate::queue::{JobStore, JobType, NewJob, Priority, StoreError};
use crate::ratelimit::RateLimiter;
use crate::source::{FetchError, ScrapeAttempt, SourceDescriptor, SourceRegistry};

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("source registry error: {0}")]
    Registry(#[from] FetchError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Outcome of evaluating one source
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulingDecision {
    pub source_id: i64,
    pub should_schedule: bool,
    pub priority: Priority,
    /// Delay before the job becomes claimable (or before re-evaluation, when skipped)
    #[serde(with = "crate::config::duration_millis")]
    pub delay: Duration,
    pub total_weight: f64,
    pub reasons: Vec<String>,
}

impl SchedulingDecision {
    fn skipped(source_id: i64, reason: impl Into<String>, delay: Duration) -> Self {
        Self {
            source_id,
            should_schedule: false,
            priority: Priority::Low,
            delay,
            total_weight: 0.0,
            reasons: vec![reason.into()],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MaintenanceReport {
    pub optimize_jobs: usize,
    pub test_jobs: usize,
    /// Sources skipped because the store failed
    pub errors: usize,
}

/// Totals for one scheduling pass
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SchedulerRunReport {
    pub evaluated: usize,
    pub scheduled: usize,
    pub skipped: usize,
    pub errors: usize,
    pub maintenance: MaintenanceReport,
    pub decisions: Vec<SchedulingDecision>,
}

/// Multi-factor scheduler
pub struct Scheduler {
    store: Arc<dyn JobStore>,
    limiter: Arc<RateLimiter>,
    registry: Arc<dyn SourceRegistry>,
    config: SchedulerConfig,
    factors: Vec<Box<dyn SchedulingFactor>>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn JobStore>,
        limiter: Arc<RateLimiter>,
        registry: Arc<dyn SourceRegistry>,
        config: SchedulerConfig,
    ) -> Self {
        let factors = default_factors(&config);
        Self {
            store,
            limiter,
            registry,
            config,
            factors,
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Names of the factors, in evaluation order
    pub fn factor_names(&self) -> Vec<&'static str> {
        self.factors.iter().map(|f| f.name()).collect()
    }

    /// Decide whether, when and how urgently to scrape `source`
    #[instrument(skip(self, source), fields(source_id = source.id))]
    pub async fn evaluate(
        &self,
        source: &SourceDescriptor,
    ) -> Result<SchedulingDecision, SchedulerError> {
        if self
            .store
            .has_active_job(source.id, JobType::ScrapeSource)
            .await?
        {
            return Ok(SchedulingDecision::skipped(
                source.id,
                "already queued",
                Duration::ZERO,
            ));
        }

        let now = Utc::now();
        let history = self
            .registry
            .history(source.id, since(now, self.config.history_window()))
            .await?;
        let ctx = FactorContext {
            source,
            history: &history,
            limiter: &self.limiter,
            now,
        };

        let mut total_weight = 0.0;
        let mut reasons = Vec::with_capacity(self.factors.len());
        let mut explicit_delay: Option<Duration> = None;

        for factor in &self.factors {
            let score = factor.score(&ctx).await;
            if score.skip {
                debug!(
                    source_id = source.id,
                    factor = factor.name(),
                    reason = %score.reason,
                    "Factor vetoed scheduling"
                );
                return Ok(SchedulingDecision::skipped(
                    source.id,
                    format!("{}: {}", factor.name(), score.reason),
                    score.delay.unwrap_or_default(),
                ));
            }

            total_weight += score.weight;
            if let Some(delay) = score.delay {
                explicit_delay = Some(explicit_delay.map_or(delay, |d| d.max(delay)));
            }
            reasons.push(format!("{} ({:+.1}): {}", factor.name(), score.weight, score.reason));
        }

        if total_weight < self.config.min_schedule_weight {
            reasons.push("score too low".to_string());
            return Ok(SchedulingDecision {
                source_id: source.id,
                should_schedule: false,
                priority: Priority::Low,
                delay: Duration::ZERO,
                total_weight,
                reasons,
            });
        }

        Ok(SchedulingDecision {
            source_id: source.id,
            should_schedule: true,
            priority: self.config.priority_for(total_weight),
            delay: explicit_delay.unwrap_or_else(|| self.jitter()),
            total_weight,
            reasons,
        })
    }

    fn jitter(&self) -> Duration {
        let max_ms = u64::try_from(self.config.jitter_max.as_millis()).unwrap_or(u64::MAX);
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    /// Evaluate every active source and enqueue the ones that should run
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> Result<SchedulerRunReport, SchedulerError> {
        let sources = self.registry.active_sources().await?;
        let mut report = SchedulerRunReport::default();

        for source in &sources {
            report.evaluated += 1;
            let decision = match self.evaluate(source).await {
                Ok(decision) => decision,
                Err(e) => {
                    warn!(source_id = source.id, error = %e, "Failed to evaluate source, skipping");
                    report.errors += 1;
                    continue;
                }
            };

            if decision.should_schedule {
                let job = NewJob::scrape(source.id)
                    .with_priority(decision.priority)
                    .with_payload(serde_json::json!({
                        "scheduled_by": "scheduler",
                        "total_weight": decision.total_weight,
                        "reasons": decision.reasons,
                    }))
                    .delayed_by(decision.delay);
                match self.store.enqueue(job).await {
                    Ok(job_id) => {
                        info!(
                            source_id = source.id,
                            %job_id,
                            priority = %decision.priority,
                            total_weight = decision.total_weight,
                            delay_secs = decision.delay.as_secs(),
                            "Scheduled scrape"
                        );
                        report.scheduled += 1;
                    }
                    Err(e) => {
                        error!(source_id = source.id, error = %e, "Failed to enqueue scrape");
                        report.errors += 1;
                    }
                }
            } else {
                debug!(source_id = source.id, reasons = ?decision.reasons, "Source not scheduled");
                report.skipped += 1;
            }
            report.decisions.push(decision);
        }

        if self.config.maintenance.enabled {
            match self.schedule_maintenance().await {
                Ok(maintenance) => {
                report.errors += maintenance.errors;
                report.maintenance = maintenance;
            }
                Err(e) => {
                    warn!(error = %e, "Maintenance scheduling failed");
                    report.errors += 1;
                }
            }
        }

        info!(
            evaluated = report.evaluated,
            scheduled = report.scheduled,
            skipped = report.skipped,
            errors = report.errors,
            optimize_jobs = report.maintenance.optimize_jobs,
            test_jobs = report.maintenance.test_jobs,
            "Scheduling pass finished"
        );
        Ok(report)
    }

    /// Enqueue optimize jobs for underperforming sources and health checks for failing ones
    #[instrument(skip(self))]
    pub async fn schedule_maintenance(&self) -> Result<MaintenanceReport, SchedulerError> {
        let config = &self.config.maintenance;
        let now = Utc::now();
        let window = config.optimize_window.max(config.test_window);
        let mut report = MaintenanceReport::default();

        for source in self.registry.active_sources().await? {
            let history = match self.registry.history(source.id, since(now, window)).await {
                Ok(history) => history,
                Err(e) => {
                    warn!(source_id = source.id, error = %e, "Failed to load history, skipping");
                    report.errors += 1;
                    continue;
                }
            };

            if self.needs_optimization(&history, now) {
                let job = NewJob::optimize(source.id)
                    .with_priority(Priority::Low)
                    .with_payload(serde_json::json!({ "dry_run": false }));
                match self.enqueue_maintenance(source.id, job).await {
                    Ok(Some(job_id)) => {
                        info!(source_id = source.id, %job_id, "Scheduled source optimization");
                        report.optimize_jobs += 1;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(
                            source_id = source.id,
                            error = %e,
                            "Failed to schedule optimization, skipping source"
                        );
                        report.errors += 1;
                        continue;
                    }
                }
            }

            if self.needs_health_check(&history, now) {
                let job = NewJob::test(source.id)
                    .with_priority(Priority::Low)
                    .with_payload(serde_json::json!({ "dry_run": false }))
                    .delayed_by(config.test_delay);
                match self.enqueue_maintenance(source.id, job).await {
                    Ok(Some(job_id)) => {
                        info!(source_id = source.id, %job_id, "Scheduled source health check");
                        report.test_jobs += 1;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(
                            source_id = source.id,
                            error = %e,
                            "Failed to schedule health check"
                        );
                        report.errors += 1;
                    }
                }
            }
        }

        Ok(report)
    }

    /// Enqueue `job` unless one of its type is already active for the source
    async fn enqueue_maintenance(
        &self,
        source_id: i64,
        job: NewJob,
    ) -> Result<Option<Uuid>, StoreError> {
        if self.store.has_active_job(source_id, job.job_type).await? {
            return Ok(None);
        }
        self.store.enqueue(job).await.map(Some)
    }

    fn needs_optimization(&self, history: &[ScrapeAttempt], now: chrono::DateTime<Utc>) -> bool {
        let config = &self.config.maintenance;
        let cutoff = since(now, config.optimize_window);
        let attempts: Vec<_> = history.iter().filter(|a| a.created_at >= cutoff).collect();
        if attempts.len() < config.optimize_min_attempts {
            return false;
        }

        let count = attempts.len() as f64;
        let avg_events = attempts.iter().map(|a| f64::from(a.events_found)).sum::<f64>() / count;
        let avg_secs = attempts.iter().map(|a| a.duration.as_secs_f64()).sum::<f64>() / count;
        avg_events < config.optimize_min_yield
            || avg_secs > config.optimize_max_duration.as_secs_f64()
    }

    fn needs_health_check(&self, history: &[ScrapeAttempt], now: chrono::DateTime<Utc>) -> bool {
        let config = &self.config.maintenance;
        let cutoff = since(now, config.test_window);
        let failures = history
            .iter()
            .filter(|a| a.created_at >= cutoff && !a.is_success())
            .count();
        let success_cutoff = since(now, config.test_success_window);
        let recent_success = history
            .iter()
            .any(|a| a.created_at >= success_cutoff && a.is_success());

        failures >= config.test_min_failures && !recent_success
    }

    /// Enqueue high-priority scrapes immediately, bypassing the decision engine
    ///
    /// `None` runs every active source; unknown ids are logged and ignored.
    #[instrument(skip(self))]
    pub async fn run_sources_now(
        &self,
        source_ids: Option<&[i64]>,
    ) -> Result<Vec<Uuid>, SchedulerError> {
        let sources = match source_ids {
            None => self.registry.active_sources().await?,
            Some(ids) => {
                let mut sources = Vec::with_capacity(ids.len());
                for &id in ids {
                    match self.registry.get_source(id).await? {
                        Some(source) => sources.push(source),
                        None => warn!(source_id = id, "Unknown source, not queued"),
                    }
                }
                sources
            }
        };

        let mut job_ids = Vec::with_capacity(sources.len());
        for source in sources {
            let job_id = self
                .store
                .enqueue(
                    NewJob::scrape(source.id)
                        .with_priority(Priority::High)
                        .with_payload(serde_json::json!({ "scheduled_by": "manual" })),
                )
                .await?;
            info!(source_id = source.id, %job_id, "Queued immediate scrape");
            job_ids.push(job_id);
        }
        Ok(job_ids)
    }

    /// Run scheduling passes on the configured interval until shutdown
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(interval_secs = self.config.interval.as_secs(), "Starting scheduler loop");
        let mut ticker = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Scheduling pass failed");
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        debug!("Scheduler loop stopped");
    }
}

//! Scheduling factors
//!
//! Each factor scores one aspect of a source. The scheduler sums the weights;
//! a factor may also veto scheduling outright (`skip`) or pin the delay.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::config::{
    ErrorPatternFactorConfig, FreshnessFactorConfig, PerformanceFactorConfig,
    RateLimitFactorConfig, ReliabilityFactorConfig, SchedulerConfig, TimeFactorConfig,
};
use crate::ratelimit::{domain_key, source_key, RateLimitScope, RateLimiter};
use crate::source::{classify_failure, FailureKind, ScrapeAttempt, SourceDescriptor};

/// Everything a factor may look at for one source
pub struct FactorContext<'a> {
    pub source: &'a SourceDescriptor,
    /// Attempts within the scheduler's history window, oldest first
    pub history: &'a [ScrapeAttempt],
    pub limiter: &'a RateLimiter,
    pub now: DateTime<Utc>,
}

impl FactorContext<'_> {
    /// Attempts no older than `window`
    pub fn attempts_within(&self, window: Duration) -> impl Iterator<Item = &ScrapeAttempt> + '_ {
        let since = since(self.now, window);
        self.history.iter().filter(move |a| a.created_at >= since)
    }

    /// Most recent successful scrape, from the descriptor or the history
    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        let from_history = self
            .history
            .iter()
            .rev()
            .find(|a| a.is_success())
            .map(|a| a.created_at);
        match (self.source.last_scraped_at, from_history) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

pub(crate) fn since(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|w| now.checked_sub_signed(w))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// One factor's verdict
#[derive(Debug, Clone, PartialEq)]
pub struct FactorScore {
    pub weight: f64,
    pub reason: String,
    /// Veto scheduling this source
    pub skip: bool,
    /// Explicit delay overriding the random jitter
    pub delay: Option<Duration>,
}

impl FactorScore {
    pub fn weighted(weight: f64, reason: impl Into<String>) -> Self {
        Self {
            weight,
            reason: reason.into(),
            skip: false,
            delay: None,
        }
    }

    pub fn neutral(reason: impl Into<String>) -> Self {
        Self::weighted(0.0, reason)
    }

    pub fn skip(reason: impl Into<String>, delay: Duration) -> Self {
        Self {
            weight: 0.0,
            reason: reason.into(),
            skip: true,
            delay: Some(delay),
        }
    }
}

#[async_trait]
pub trait SchedulingFactor: Send + Sync {
    fn name(&self) -> &'static str;

    async fn score(&self, ctx: &FactorContext<'_>) -> FactorScore;
}

/// The fixed factor list, in evaluation order
pub fn default_factors(config: &SchedulerConfig) -> Vec<Box<dyn SchedulingFactor>> {
    vec![
        Box::new(TimeFactor::new(config.time.clone())),
        Box::new(ReliabilityFactor::new(config.reliability.clone())),
        Box::new(RateLimitFactor::new(config.rate_limit.clone())),
        Box::new(PerformanceFactor::new(config.performance.clone())),
        Box::new(FreshnessFactor::new(config.freshness.clone())),
        Box::new(ErrorPatternFactor::new(config.error_pattern.clone())),
    ]
}

/// Favours sources that have not been scraped for a while
pub struct TimeFactor {
    config: TimeFactorConfig,
}

impl TimeFactor {
    pub fn new(config: TimeFactorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SchedulingFactor for TimeFactor {
    fn name(&self) -> &'static str {
        "time"
    }

    async fn score(&self, ctx: &FactorContext<'_>) -> FactorScore {
        let Some(last) = ctx.last_success() else {
            return FactorScore::weighted(self.config.never_scraped_weight, "never scraped");
        };

        let hours = (ctx.now - last).num_hours().max(0);
        if hours < i64::from(self.config.recent_hours) {
            return FactorScore::weighted(
                self.config.recent_weight,
                format!("scraped {hours}h ago"),
            );
        }

        self.config
            .steps
            .iter()
            .find(|step| hours >= i64::from(step.min_hours))
            .map(|step| FactorScore::weighted(step.weight, format!("{hours}h since last scrape")))
            .unwrap_or_else(|| FactorScore::neutral(format!("{hours}h since last scrape")))
    }
}

/// Success rate and yield over the reliability window
pub struct ReliabilityFactor {
    config: ReliabilityFactorConfig,
}

impl ReliabilityFactor {
    pub fn new(config: ReliabilityFactorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SchedulingFactor for ReliabilityFactor {
    fn name(&self) -> &'static str {
        "reliability"
    }

    async fn score(&self, ctx: &FactorContext<'_>) -> FactorScore {
        let attempts: Vec<_> = ctx.attempts_within(self.config.window).collect();
        if attempts.len() < self.config.min_attempts {
            return FactorScore::neutral(format!("{} attempts, not enough history", attempts.len()));
        }

        let successes: Vec<_> = attempts.iter().filter(|a| a.is_success()).collect();
        let rate = successes.len() as f64 / attempts.len() as f64;
        let avg_yield = if successes.is_empty() {
            0.0
        } else {
            successes.iter().map(|a| f64::from(a.events_found)).sum::<f64>()
                / successes.len() as f64
        };
        let summary = format!("success rate {:.0}%, {avg_yield:.1} events avg", rate * 100.0);

        let weight = if rate >= self.config.excellent_rate && avg_yield >= self.config.excellent_yield
        {
            self.config.excellent_weight
        } else if rate >= self.config.good_rate {
            self.config.good_weight
        } else if rate < self.config.failing_rate {
            self.config.failing_weight
        } else if rate < self.config.poor_rate {
            self.config.poor_weight
        } else {
            0.0
        };
        FactorScore::weighted(weight, summary)
    }
}

/// Vetoes sources whose source or domain budget is spent
pub struct RateLimitFactor {
    config: RateLimitFactorConfig,
}

impl RateLimitFactor {
    pub fn new(config: RateLimitFactorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SchedulingFactor for RateLimitFactor {
    fn name(&self) -> &'static str {
        "rate_limit"
    }

    async fn score(&self, ctx: &FactorContext<'_>) -> FactorScore {
        let mut keys = vec![(RateLimitScope::Source, source_key(ctx.source.id))];
        if let Some(domain) = domain_key(&ctx.source.url) {
            keys.push((RateLimitScope::Domain, domain));
        }

        let mut lowest = 1.0_f64;
        for (scope, key) in &keys {
            let tiers = ctx.limiter.tiers(*scope);
            if !ctx.limiter.check_advanced_limit(key, tiers).await {
                let reset = ctx.limiter.exhausted_reset_time(key, tiers).await;
                return FactorScore::skip(
                    format!("rate limit exhausted for {key}, resets in {}s", reset.as_secs()),
                    reset,
                );
            }
            lowest = lowest.min(ctx.limiter.remaining_fraction(key, tiers).await);
        }

        if lowest <= self.config.low_quota_fraction {
            FactorScore::weighted(
                self.config.low_quota_weight,
                format!("{:.0}% quota remaining", lowest * 100.0),
            )
        } else {
            FactorScore::neutral("quota available")
        }
    }
}

/// Speed and yield of recent successful scrapes
pub struct PerformanceFactor {
    config: PerformanceFactorConfig,
}

impl PerformanceFactor {
    pub fn new(config: PerformanceFactorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SchedulingFactor for PerformanceFactor {
    fn name(&self) -> &'static str {
        "performance"
    }

    async fn score(&self, ctx: &FactorContext<'_>) -> FactorScore {
        let successes: Vec<_> = ctx
            .attempts_within(self.config.window)
            .filter(|a| a.is_success())
            .collect();
        if successes.is_empty() {
            return FactorScore::neutral("no recent successful scrapes");
        }

        let count = successes.len() as f64;
        let avg_secs = successes.iter().map(|a| a.duration.as_secs_f64()).sum::<f64>() / count;
        let avg_events = successes.iter().map(|a| f64::from(a.events_found)).sum::<f64>() / count;
        let summary = format!("{avg_secs:.1}s avg, {avg_events:.1} events avg");

        let c = &self.config;
        let weight = if avg_secs < c.fast_duration.as_secs_f64() && avg_events >= c.fast_min_events
        {
            c.fast_weight
        } else if avg_secs < c.ok_duration.as_secs_f64() && avg_events >= c.ok_min_events {
            c.ok_weight
        } else if avg_secs > c.slow_duration.as_secs_f64() || avg_events < c.low_yield_events {
            c.slow_weight
        } else {
            0.0
        };
        FactorScore::weighted(weight, summary)
    }
}

/// Content-type heuristics for how often a source changes
pub struct FreshnessFactor {
    config: FreshnessFactorConfig,
}

impl FreshnessFactor {
    pub fn new(config: FreshnessFactorConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SchedulingFactor for FreshnessFactor {
    fn name(&self) -> &'static str {
        "freshness"
    }

    async fn score(&self, ctx: &FactorContext<'_>) -> FactorScore {
        let haystack = format!("{} {}", ctx.source.scrape_type, ctx.source.url).to_lowercase();

        if let Some(marker) = find_marker(&self.config.frequent_markers, &haystack) {
            FactorScore::weighted(self.config.frequent_weight, format!("{marker} source changes often"))
        } else if let Some(marker) = find_marker(&self.config.moderate_markers, &haystack) {
            FactorScore::weighted(self.config.moderate_weight, format!("{marker} source updates regularly"))
        } else if let Some(marker) = find_marker(&self.config.static_markers, &haystack) {
            FactorScore::weighted(self.config.static_weight, format!("{marker} source rarely changes"))
        } else {
            FactorScore::neutral("no freshness hint")
        }
    }
}

/// First marker contained in `haystack`
fn find_marker<'a>(markers: &'a [String], haystack: &str) -> Option<&'a String> {
    markers.iter().find(|m| haystack.contains(m.as_str()))
}

/// Penalises recent failures, weighted by kind and recency
pub struct ErrorPatternFactor {
    config: ErrorPatternFactorConfig,
}

impl ErrorPatternFactor {
    pub fn new(config: ErrorPatternFactorConfig) -> Self {
        Self { config }
    }

    fn kind_weight(&self, kind: FailureKind) -> f64 {
        match kind {
            FailureKind::Connection => self.config.connection_weight,
            FailureKind::RateLimit => self.config.rate_limit_weight,
            FailureKind::NotFound => self.config.not_found_weight,
            FailureKind::Other => self.config.other_weight,
        }
    }

    fn recency_multiplier(&self, age: chrono::Duration) -> f64 {
        if age <= chrono::Duration::hours(1) {
            self.config.last_hour_multiplier
        } else if age <= chrono::Duration::hours(24) {
            self.config.last_day_multiplier
        } else {
            self.config.older_multiplier
        }
    }
}

#[async_trait]
impl SchedulingFactor for ErrorPatternFactor {
    fn name(&self) -> &'static str {
        "error_pattern"
    }

    async fn score(&self, ctx: &FactorContext<'_>) -> FactorScore {
        let attempts: Vec<_> = ctx.attempts_within(self.config.window).collect();
        let failures: Vec<_> = attempts.iter().filter(|a| !a.is_success()).collect();
        if failures.is_empty() {
            return FactorScore::neutral("no recent failures");
        }

        let mut weight: f64 = failures
            .iter()
            .map(|a| {
                let kind = classify_failure(a.error_message.as_deref().unwrap_or_default());
                self.kind_weight(kind) * self.recency_multiplier(ctx.now - a.created_at)
            })
            .sum();

        let consecutive = attempts.iter().rev().take_while(|a| !a.is_success()).count();
        if consecutive >= self.config.consecutive_failures {
            weight += self.config.consecutive_weight;
        }

        FactorScore::weighted(
            weight.max(self.config.floor),
            format!("{} recent failures, {consecutive} consecutive", failures.len()),
        )
    }
}

//! Source scheduling
//!
//! The [`Scheduler`] scores every active source with an ordered list of
//! [`SchedulingFactor`]s and enqueues scrape jobs for those worth running:
//!
//! | Factor | Looks at |
//! |--------|----------|
//! | `time` | hours since the last successful scrape |
//! | `reliability` | 30-day success rate and yield |
//! | `rate_limit` | source and domain budgets (may veto) |
//! | `performance` | 7-day scrape duration and yield |
//! | `freshness` | content-type hints in scrape type and URL |
//! | `error_pattern` | recent failures by kind and recency |
//!
//! It also schedules maintenance: optimize jobs for underperforming sources
//! and delayed health checks for sources that keep failing.

mod config;
mod engine;
mod factors;

pub use config::{
    ErrorPatternFactorConfig, FreshnessFactorConfig, MaintenanceConfig, PerformanceFactorConfig,
    RateLimitFactorConfig, ReliabilityFactorConfig, SchedulerConfig, StalenessStep,
    TimeFactorConfig,
};
pub use engine::{
    MaintenanceReport, Scheduler, SchedulerError, SchedulerRunReport, SchedulingDecision,
};
pub use factors::{
    default_factors, ErrorPatternFactor, FactorContext, FactorScore, FreshnessFactor,
    PerformanceFactor, RateLimitFactor, ReliabilityFactor, SchedulingFactor, TimeFactor,
};

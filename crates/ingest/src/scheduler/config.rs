//! Scheduler configuration
//!
//! Every heuristic threshold and weight used by the factors lives here so
//! deployments can tune them without code changes.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{duration_millis, env_parse};
use crate::queue::Priority;

const HOUR: u64 = 3600;
const DAY: u64 = 24 * HOUR;

/// Bonus applied once a source has gone `min_hours` without a successful scrape
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StalenessStep {
    pub min_hours: u32,
    pub weight: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeFactorConfig {
    pub never_scraped_weight: f64,
    /// Checked in order; the first step whose `min_hours` is reached applies
    pub steps: Vec<StalenessStep>,
    /// Sources scraped more recently than this are discouraged
    pub recent_hours: u32,
    pub recent_weight: f64,
}

impl Default for TimeFactorConfig {
    fn default() -> Self {
        Self {
            never_scraped_weight: 5.0,
            steps: vec![
                StalenessStep { min_hours: 48, weight: 4.0 },
                StalenessStep { min_hours: 24, weight: 3.0 },
                StalenessStep { min_hours: 12, weight: 2.0 },
                StalenessStep { min_hours: 6, weight: 1.0 },
            ],
            recent_hours: 6,
            recent_weight: -3.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReliabilityFactorConfig {
    #[serde(with = "duration_millis")]
    pub window: Duration,
    pub min_attempts: usize,
    pub excellent_rate: f64,
    /// Average events per successful scrape needed for the excellent bonus
    pub excellent_yield: f64,
    pub excellent_weight: f64,
    pub good_rate: f64,
    pub good_weight: f64,
    pub poor_rate: f64,
    pub poor_weight: f64,
    pub failing_rate: f64,
    pub failing_weight: f64,
}

impl Default for ReliabilityFactorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(30 * DAY),
            min_attempts: 3,
            excellent_rate: 0.9,
            excellent_yield: 5.0,
            excellent_weight: 2.0,
            good_rate: 0.7,
            good_weight: 1.0,
            poor_rate: 0.5,
            poor_weight: -2.0,
            failing_rate: 0.3,
            failing_weight: -3.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitFactorConfig {
    /// Remaining quota fraction at or below which the source is discouraged
    pub low_quota_fraction: f64,
    pub low_quota_weight: f64,
}

impl Default for RateLimitFactorConfig {
    fn default() -> Self {
        Self {
            low_quota_fraction: 0.2,
            low_quota_weight: -2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceFactorConfig {
    #[serde(with = "duration_millis")]
    pub window: Duration,
    #[serde(with = "duration_millis")]
    pub fast_duration: Duration,
    pub fast_min_events: f64,
    pub fast_weight: f64,
    #[serde(with = "duration_millis")]
    pub ok_duration: Duration,
    pub ok_min_events: f64,
    pub ok_weight: f64,
    #[serde(with = "duration_millis")]
    pub slow_duration: Duration,
    pub low_yield_events: f64,
    pub slow_weight: f64,
}

impl Default for PerformanceFactorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(7 * DAY),
            fast_duration: Duration::from_secs(10),
            fast_min_events: 10.0,
            fast_weight: 2.0,
            ok_duration: Duration::from_secs(30),
            ok_min_events: 3.0,
            ok_weight: 1.0,
            slow_duration: Duration::from_secs(60),
            low_yield_events: 1.0,
            slow_weight: -2.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FreshnessFactorConfig {
    /// Markers (matched against scrape type and URL) of feeds that change often
    pub frequent_markers: Vec<String>,
    pub frequent_weight: f64,
    pub moderate_markers: Vec<String>,
    pub moderate_weight: f64,
    pub static_markers: Vec<String>,
    pub static_weight: f64,
}

impl Default for FreshnessFactorConfig {
    fn default() -> Self {
        let markers = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            frequent_markers: markers(&["ical", "ics", "calendar"]),
            frequent_weight: 2.0,
            moderate_markers: markers(&["news", "blog", "rss", "feed"]),
            moderate_weight: 1.0,
            static_markers: markers(&["archive", "static"]),
            static_weight: -1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPatternFactorConfig {
    #[serde(with = "duration_millis")]
    pub window: Duration,
    pub connection_weight: f64,
    pub rate_limit_weight: f64,
    pub not_found_weight: f64,
    pub other_weight: f64,
    /// Severity multiplier for failures within the last hour
    pub last_hour_multiplier: f64,
    /// Severity multiplier for failures within the last day
    pub last_day_multiplier: f64,
    pub older_multiplier: f64,
    pub consecutive_failures: usize,
    pub consecutive_weight: f64,
    /// Lower bound of the factor's total
    pub floor: f64,
}

impl Default for ErrorPatternFactorConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(7 * DAY),
            connection_weight: -1.0,
            rate_limit_weight: -2.0,
            not_found_weight: -3.0,
            other_weight: -0.5,
            last_hour_multiplier: 2.0,
            last_day_multiplier: 1.0,
            older_multiplier: 0.5,
            consecutive_failures: 3,
            consecutive_weight: -2.0,
            floor: -6.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceConfig {
    pub enabled: bool,
    #[serde(with = "duration_millis")]
    pub optimize_window: Duration,
    pub optimize_min_attempts: usize,
    /// Average events per attempt below which a source is underperforming
    pub optimize_min_yield: f64,
    #[serde(with = "duration_millis")]
    pub optimize_max_duration: Duration,
    #[serde(with = "duration_millis")]
    pub test_window: Duration,
    pub test_min_failures: usize,
    /// Any success within this window suppresses the health check
    #[serde(with = "duration_millis")]
    pub test_success_window: Duration,
    #[serde(with = "duration_millis")]
    pub test_delay: Duration,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            optimize_window: Duration::from_secs(14 * DAY),
            optimize_min_attempts: 3,
            optimize_min_yield: 2.0,
            optimize_max_duration: Duration::from_secs(30),
            test_window: Duration::from_secs(7 * DAY),
            test_min_failures: 3,
            test_success_window: Duration::from_secs(DAY),
            test_delay: Duration::from_secs(30 * 60),
        }
    }
}

/// Scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Period of the scheduling loop
    #[serde(with = "duration_millis")]
    pub interval: Duration,

    /// Upper bound of the random delay added to scheduled jobs
    #[serde(with = "duration_millis")]
    pub jitter_max: Duration,

    /// Totals below this are not scheduled
    pub min_schedule_weight: f64,

    pub urgent_threshold: f64,
    pub high_threshold: f64,
    pub normal_threshold: f64,

    pub time: TimeFactorConfig,
    pub reliability: ReliabilityFactorConfig,
    pub rate_limit: RateLimitFactorConfig,
    pub performance: PerformanceFactorConfig,
    pub freshness: FreshnessFactorConfig,
    pub error_pattern: ErrorPatternFactorConfig,
    pub maintenance: MaintenanceConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15 * 60),
            jitter_max: Duration::from_secs(5 * 60),
            min_schedule_weight: 0.0,
            urgent_threshold: 8.0,
            high_threshold: 5.0,
            normal_threshold: 2.0,
            time: TimeFactorConfig::default(),
            reliability: ReliabilityFactorConfig::default(),
            rate_limit: RateLimitFactorConfig::default(),
            performance: PerformanceFactorConfig::default(),
            freshness: FreshnessFactorConfig::default(),
            error_pattern: ErrorPatternFactorConfig::default(),
            maintenance: MaintenanceConfig::default(),
        }
    }
}

impl SchedulerConfig {
    /// Create configuration from environment variables
    ///
    /// - `SCHEDULER_INTERVAL_SECS` (default: 900)
    /// - `SCHEDULER_JITTER_MAX_SECS` (default: 300)
    /// - `SCHEDULER_MIN_WEIGHT` (default: 0.0)
    /// - `SCHEDULER_MAINTENANCE` (default: true)
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let mut maintenance = defaults.maintenance.clone();
        if let Some(enabled) = env_parse("SCHEDULER_MAINTENANCE") {
            maintenance.enabled = enabled;
        }

        Self {
            interval: env_parse("SCHEDULER_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.interval),
            jitter_max: env_parse("SCHEDULER_JITTER_MAX_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.jitter_max),
            min_schedule_weight: env_parse("SCHEDULER_MIN_WEIGHT")
                .unwrap_or(defaults.min_schedule_weight),
            maintenance,
            ..defaults
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_jitter_max(mut self, jitter: Duration) -> Self {
        self.jitter_max = jitter;
        self
    }

    pub fn with_min_schedule_weight(mut self, weight: f64) -> Self {
        self.min_schedule_weight = weight;
        self
    }

    pub fn with_maintenance(mut self, enabled: bool) -> Self {
        self.maintenance.enabled = enabled;
        self
    }

    /// Priority tier for a combined weight
    pub fn priority_for(&self, total_weight: f64) -> Priority {
        if total_weight >= self.urgent_threshold {
            Priority::Urgent
        } else if total_weight >= self.high_threshold {
            Priority::High
        } else if total_weight >= self.normal_threshold {
            Priority::Normal
        } else {
            Priority::Low
        }
    }

    /// Longest history window any factor or maintenance check looks at
    pub fn history_window(&self) -> Duration {
        [
            self.reliability.window,
            self.performance.window,
            self.error_pattern.window,
            self.maintenance.optimize_window,
            self.maintenance.test_window,
        ]
        .into_iter()
        .max()
        .unwrap_or(self.reliability.window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_tiers() {
        let config = SchedulerConfig::default();
        assert_eq!(config.priority_for(9.0), Priority::Urgent);
        assert_eq!(config.priority_for(8.0), Priority::Urgent);
        assert_eq!(config.priority_for(5.5), Priority::High);
        assert_eq!(config.priority_for(2.0), Priority::Normal);
        assert_eq!(config.priority_for(1.9), Priority::Low);
        assert_eq!(config.priority_for(-4.0), Priority::Low);
    }

    #[test]
    fn test_history_window_covers_longest_lookback() {
        let config = SchedulerConfig::default();
        assert_eq!(config.history_window(), Duration::from_secs(30 * DAY));
    }
}

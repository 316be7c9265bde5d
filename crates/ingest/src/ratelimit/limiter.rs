//! Sliding-window rate limiter

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::counter::{CounterStore, InMemoryCounterStore};
use crate::config::{duration_millis, env_parse};

/// Key of the process-wide budget
pub const GLOBAL_KEY: &str = "global";

/// One `{max, window}` budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitTier {
    pub max_requests: u32,
    #[serde(with = "duration_millis")]
    pub window: Duration,
}

impl RateLimitTier {
    pub const fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    pub const fn per_hour(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(60 * 60))
    }

    pub const fn per_minutes(max_requests: u32, minutes: u64) -> Self {
        Self::new(max_requests, Duration::from_secs(minutes * 60))
    }
}

/// What a budget is tracked against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitScope {
    Source,
    Domain,
    Worker,
    Global,
}

impl RateLimitScope {
    /// Built-in tier presets: sustained hourly rate plus burst control
    pub fn default_tiers(&self) -> Vec<RateLimitTier> {
        match self {
            Self::Source => vec![
                RateLimitTier::per_hour(10),
                RateLimitTier::per_minutes(3, 10),
                RateLimitTier::per_minutes(2, 5),
            ],
            Self::Domain => vec![
                RateLimitTier::per_hour(30),
                RateLimitTier::per_minutes(10, 10),
                RateLimitTier::per_minutes(5, 5),
            ],
            Self::Worker => vec![
                RateLimitTier::per_hour(100),
                RateLimitTier::per_minutes(25, 10),
            ],
            Self::Global => vec![
                RateLimitTier::per_hour(500),
                RateLimitTier::per_minutes(100, 10),
            ],
        }
    }

    /// Counter key for `id` within this scope (`id` is ignored for `Global`)
    pub fn key(&self, id: impl fmt::Display) -> String {
        match self {
            Self::Source => format!("source_{id}"),
            Self::Domain => format!("domain_{id}"),
            Self::Worker => format!("worker_{id}"),
            Self::Global => GLOBAL_KEY.to_string(),
        }
    }
}

/// Counter key of a source budget
pub fn source_key(source_id: i64) -> String {
    RateLimitScope::Source.key(source_id)
}

/// Counter key of the domain budget for `url`, if it has a host
pub fn domain_key(url: &str) -> Option<String> {
    domain_of(url).map(|host| RateLimitScope::Domain.key(host))
}

/// Lower-cased host of `url`
pub fn domain_of(url: &str) -> Option<String> {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}

/// Which counter store backs the limiter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CounterBackend {
    #[default]
    Memory,
    Postgres,
}

impl FromStr for CounterBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "postgres" | "database" => Ok(Self::Postgres),
            other => Err(format!("unknown rate limit backend: {other}")),
        }
    }
}

/// Rate limiter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterConfig {
    pub backend: CounterBackend,

    /// Minimum time between purges of expired events
    #[serde(with = "duration_millis")]
    pub cleanup_interval: Duration,

    /// Events older than this are purged (must cover the longest window)
    #[serde(with = "duration_millis")]
    pub retention: Duration,

    pub source_tiers: Vec<RateLimitTier>,
    pub domain_tiers: Vec<RateLimitTier>,
    pub worker_tiers: Vec<RateLimitTier>,
    pub global_tiers: Vec<RateLimitTier>,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            backend: CounterBackend::default(),
            cleanup_interval: Duration::from_secs(60 * 60),
            retention: Duration::from_secs(24 * 60 * 60),
            source_tiers: RateLimitScope::Source.default_tiers(),
            domain_tiers: RateLimitScope::Domain.default_tiers(),
            worker_tiers: RateLimitScope::Worker.default_tiers(),
            global_tiers: RateLimitScope::Global.default_tiers(),
        }
    }
}

impl RateLimiterConfig {
    /// Create configuration from environment variables
    ///
    /// - `RATE_LIMIT_BACKEND`: `memory` or `postgres` (default: memory)
    /// - `RATE_LIMIT_CLEANUP_SECS` (default: 3600)
    /// - `RATE_LIMIT_RETENTION_SECS` (default: 86400)
    /// - `RATE_LIMIT_SOURCE_PER_HOUR`, `RATE_LIMIT_DOMAIN_PER_HOUR`: override
    ///   the hourly tier of the source/domain presets
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(backend) = env_parse("RATE_LIMIT_BACKEND") {
            config.backend = backend;
        }
        if let Some(secs) = env_parse("RATE_LIMIT_CLEANUP_SECS") {
            config.cleanup_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = env_parse("RATE_LIMIT_RETENTION_SECS") {
            config.retention = Duration::from_secs(secs);
        }
        if let Some(max) = env_parse("RATE_LIMIT_SOURCE_PER_HOUR") {
            if let Some(hourly) = config.source_tiers.first_mut() {
                *hourly = RateLimitTier::per_hour(max);
            }
        }
        if let Some(max) = env_parse("RATE_LIMIT_DOMAIN_PER_HOUR") {
            if let Some(hourly) = config.domain_tiers.first_mut() {
                *hourly = RateLimitTier::per_hour(max);
            }
        }
        config
    }

    pub fn with_backend(mut self, backend: CounterBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    pub fn with_tiers(mut self, scope: RateLimitScope, tiers: Vec<RateLimitTier>) -> Self {
        match scope {
            RateLimitScope::Source => self.source_tiers = tiers,
            RateLimitScope::Domain => self.domain_tiers = tiers,
            RateLimitScope::Worker => self.worker_tiers = tiers,
            RateLimitScope::Global => self.global_tiers = tiers,
        }
        self
    }

    /// Configured tiers for `scope`
    pub fn tiers(&self, scope: RateLimitScope) -> &[RateLimitTier] {
        match scope {
            RateLimitScope::Source => &self.source_tiers,
            RateLimitScope::Domain => &self.domain_tiers,
            RateLimitScope::Worker => &self.worker_tiers,
            RateLimitScope::Global => &self.global_tiers,
        }
    }
}

/// Limiter statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimiterStats {
    pub backend: String,
    /// False when the backend could not be queried
    pub available: bool,
    pub keys: u64,
    pub events: u64,
    pub last_cleanup: Option<DateTime<Utc>>,
}

/// Sliding-window rate limiter over a pluggable [`CounterStore`]
///
/// Checks and records are separate so callers can check before committing to
/// an action; [`try_acquire`](Self::try_acquire) combines both atomically per
/// key. Every backend error fails open.
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    config: RateLimiterConfig,
    last_cleanup: Mutex<Option<DateTime<Utc>>>,
    key_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, config: RateLimiterConfig) -> Self {
        Self {
            store,
            config,
            last_cleanup: Mutex::new(None),
            key_locks: DashMap::new(),
        }
    }

    /// Limiter over a fresh in-memory store with default presets
    pub fn in_memory() -> Self {
        Self::new(
            Arc::new(InMemoryCounterStore::new()),
            RateLimiterConfig::default(),
        )
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    /// True iff fewer than `max_requests` events for `key` fall within `window`
    ///
    /// Does not record usage.
    pub async fn check_limit(&self, key: &str, max_requests: u32, window: Duration) -> bool {
        match self.store.count_since(key, window_start(window)).await {
            Ok(count) => count < u64::from(max_requests),
            Err(e) => {
                warn!(key, error = %e, "rate limit check failed, allowing request");
                true
            }
        }
    }

    /// Record one event for `key` now
    pub async fn record_usage(&self, key: &str) {
        if let Err(e) = self.store.record(key, Utc::now()).await {
            warn!(key, error = %e, "failed to record rate limit usage");
        }
        self.maybe_cleanup().await;
    }

    /// Requests left in the window, clamped at zero
    pub async fn get_remaining(&self, key: &str, max_requests: u32, window: Duration) -> u32 {
        match self.store.count_since(key, window_start(window)).await {
            Ok(count) => u64::from(max_requests).saturating_sub(count) as u32,
            Err(e) => {
                warn!(key, error = %e, "rate limit lookup failed, reporting full quota");
                max_requests
            }
        }
    }

    /// Time until the oldest event in the window expires; zero if the window is empty
    pub async fn get_reset_time(&self, key: &str, window: Duration) -> Duration {
        match self.store.oldest_since(key, window_start(window)).await {
            Ok(Some(oldest)) => {
                let window = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero());
                let expires = oldest + window;
                (expires - Utc::now()).to_std().unwrap_or(Duration::ZERO)
            }
            Ok(None) => Duration::ZERO,
            Err(e) => {
                warn!(key, error = %e, "rate limit reset lookup failed");
                Duration::ZERO
            }
        }
    }

    /// AND of [`check_limit`](Self::check_limit) across every tier
    pub async fn check_advanced_limit(&self, key: &str, tiers: &[RateLimitTier]) -> bool {
        for tier in tiers {
            if !self.check_limit(key, tier.max_requests, tier.window).await {
                debug!(
                    key,
                    max = tier.max_requests,
                    window_secs = tier.window.as_secs(),
                    "rate limit tier exhausted"
                );
                return false;
            }
        }
        true
    }

    /// Check every tier and record usage in one step
    ///
    /// Concurrent callers for the same key are serialised, so two callers can
    /// never both pass a check that should deny the second.
    pub async fn try_acquire(&self, key: &str, tiers: &[RateLimitTier]) -> bool {
        self.try_acquire_all(&[(key, tiers)]).await.is_ok()
    }

    /// Check every key against its tiers and record usage on all of them, or on none
    ///
    /// Locks are taken in key order so overlapping callers cannot deadlock.
    /// Returns the first denied key.
    pub async fn try_acquire_all(
        &self,
        requests: &[(&str, &[RateLimitTier])],
    ) -> Result<(), String> {
        let mut keys: Vec<&str> = requests.iter().map(|(key, _)| *key).collect();
        keys.sort_unstable();
        keys.dedup();

        let locks: Vec<_> = keys
            .iter()
            .map(|key| self.key_locks.entry((*key).to_string()).or_default().clone())
            .collect();
        let mut guards = Vec::with_capacity(locks.len());
        for lock in &locks {
            guards.push(lock.lock().await);
        }

        for (key, tiers) in requests {
            if !self.check_advanced_limit(key, tiers).await {
                return Err((*key).to_string());
            }
        }
        for key in &keys {
            self.record_usage(key).await;
        }
        Ok(())
    }

    /// Configured tiers for `scope`
    pub fn tiers(&self, scope: RateLimitScope) -> &[RateLimitTier] {
        self.config.tiers(scope)
    }

    /// Lowest remaining fraction (0.0..=1.0) across `tiers`
    pub async fn remaining_fraction(&self, key: &str, tiers: &[RateLimitTier]) -> f64 {
        let mut fraction: f64 = 1.0;
        for tier in tiers.iter().filter(|t| t.max_requests > 0) {
            let remaining = self.get_remaining(key, tier.max_requests, tier.window).await;
            fraction = fraction.min(f64::from(remaining) / f64::from(tier.max_requests));
        }
        fraction
    }

    /// Longest reset time among the exhausted tiers; zero if none is exhausted
    pub async fn exhausted_reset_time(&self, key: &str, tiers: &[RateLimitTier]) -> Duration {
        let mut reset = Duration::ZERO;
        for tier in tiers {
            if !self.check_limit(key, tier.max_requests, tier.window).await {
                reset = reset.max(self.get_reset_time(key, tier.window).await);
            }
        }
        reset
    }

    /// Purge events older than the retention period and drop idle key locks
    pub async fn cleanup(&self) -> u64 {
        let cutoff = window_start(self.config.retention);
        *self.last_cleanup.lock() = Some(Utc::now());

        // Only the map holds an idle lock; in-flight acquires keep their own clone
        self.key_locks.retain(|_, lock| Arc::strong_count(lock) > 1);

        match self.store.purge_before(cutoff).await {
            Ok(removed) => {
                if removed > 0 {
                    info!(removed, "purged expired rate limit events");
                }
                removed
            }
            Err(e) => {
                warn!(error = %e, "rate limit cleanup failed");
                0
            }
        }
    }

    pub async fn stats(&self) -> RateLimiterStats {
        let last_cleanup = *self.last_cleanup.lock();
        let backend = self.store.backend_name().to_string();

        match self.store.stats().await {
            Ok(stats) => RateLimiterStats {
                backend,
                available: true,
                keys: stats.keys,
                events: stats.events,
                last_cleanup,
            },
            Err(e) => {
                warn!(error = %e, "rate limit stats unavailable");
                RateLimiterStats {
                    backend,
                    available: false,
                    keys: 0,
                    events: 0,
                    last_cleanup,
                }
            }
        }
    }

    async fn maybe_cleanup(&self) {
        let due = match *self.last_cleanup.lock() {
            Some(last) => (Utc::now() - last)
                .to_std()
                .map(|elapsed| elapsed >= self.config.cleanup_interval)
                .unwrap_or(false),
            None => true,
        };
        if due {
            self.cleanup().await;
        }
    }
}

fn window_start(window: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::super::counter::{CounterStats, CounterStoreError};
    use super::*;

    const HOUR: Duration = Duration::from_secs(3600);

    fn limiter() -> (RateLimiter, Arc<InMemoryCounterStore>) {
        let store = Arc::new(InMemoryCounterStore::new());
        let limiter = RateLimiter::new(store.clone(), RateLimiterConfig::default());
        (limiter, store)
    }

    struct FailingStore;

    #[async_trait]
    impl CounterStore for FailingStore {
        fn backend_name(&self) -> &'static str {
            "failing"
        }

        async fn count_since(&self, _: &str, _: DateTime<Utc>) -> Result<u64, CounterStoreError> {
            Err(CounterStoreError::Unavailable("down".into()))
        }

        async fn oldest_since(
            &self,
            _: &str,
            _: DateTime<Utc>,
        ) -> Result<Option<DateTime<Utc>>, CounterStoreError> {
            Err(CounterStoreError::Unavailable("down".into()))
        }

        async fn record(&self, _: &str, _: DateTime<Utc>) -> Result<(), CounterStoreError> {
            Err(CounterStoreError::Unavailable("down".into()))
        }

        async fn purge_before(&self, _: DateTime<Utc>) -> Result<u64, CounterStoreError> {
            Err(CounterStoreError::Unavailable("down".into()))
        }

        async fn stats(&self) -> Result<CounterStats, CounterStoreError> {
            Err(CounterStoreError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn test_limit_then_deny_then_expire() {
        let (limiter, store) = limiter();

        for _ in 0..5 {
            assert!(limiter.check_limit("source_1", 5, HOUR).await);
            limiter.record_usage("source_1").await;
        }
        assert!(!limiter.check_limit("source_1", 5, HOUR).await);

        store.age_events("source_1", HOUR + Duration::from_secs(1));
        assert!(limiter.check_limit("source_1", 5, HOUR).await);
    }

    #[tokio::test]
    async fn test_check_does_not_record() {
        let (limiter, _) = limiter();
        for _ in 0..10 {
            assert!(limiter.check_limit("k", 1, HOUR).await);
        }
    }

    #[tokio::test]
    async fn test_remaining_and_reset() {
        let (limiter, _) = limiter();
        assert_eq!(limiter.get_remaining("k", 3, HOUR).await, 3);
        assert_eq!(limiter.get_reset_time("k", HOUR).await, Duration::ZERO);

        for _ in 0..4 {
            limiter.record_usage("k").await;
        }
        assert_eq!(limiter.get_remaining("k", 3, HOUR).await, 0);

        let reset = limiter.get_reset_time("k", HOUR).await;
        assert!(reset > HOUR - Duration::from_secs(5) && reset <= HOUR);
    }

    #[tokio::test]
    async fn test_advanced_limit_burst_tier() {
        let (limiter, _) = limiter();
        let tiers = RateLimitScope::Source.default_tiers();

        // 2 per 5 minutes is the binding tier
        limiter.record_usage("source_9").await;
        assert!(limiter.check_advanced_limit("source_9", &tiers).await);
        limiter.record_usage("source_9").await;
        assert!(!limiter.check_advanced_limit("source_9", &tiers).await);

        let reset = limiter.exhausted_reset_time("source_9", &tiers).await;
        assert!(reset > Duration::from_secs(290) && reset <= Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_fails_open() {
        let limiter = RateLimiter::new(Arc::new(FailingStore), RateLimiterConfig::default());

        assert!(limiter.check_limit("k", 0, HOUR).await);
        assert_eq!(limiter.get_remaining("k", 7, HOUR).await, 7);
        assert_eq!(limiter.get_reset_time("k", HOUR).await, Duration::ZERO);
        limiter.record_usage("k").await;

        let stats = limiter.stats().await;
        assert!(!stats.available);
        assert_eq!(stats.backend, "failing");
    }

    #[tokio::test]
    async fn test_try_acquire_is_atomic_per_key() {
        let limiter = Arc::new(RateLimiter::in_memory());
        let tiers = vec![RateLimitTier::per_hour(3)];

        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = Arc::clone(&limiter);
            let tiers = tiers.clone();
            handles.push(tokio::spawn(async move {
                limiter.try_acquire("domain_example.com", &tiers).await
            }));
        }

        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }
        assert_eq!(granted, 3);
    }

    #[tokio::test]
    async fn test_try_acquire_all_is_all_or_nothing() {
        let (limiter, _) = limiter();
        let one = vec![RateLimitTier::per_hour(1)];
        let five = vec![RateLimitTier::per_hour(5)];

        limiter.record_usage("source_1").await;
        let denied = limiter
            .try_acquire_all(&[("source_1", one.as_slice()), ("domain_a.org", five.as_slice())])
            .await;
        assert_eq!(denied, Err("source_1".to_string()));
        assert_eq!(limiter.get_remaining("domain_a.org", 5, HOUR).await, 5);

        tokio_test::assert_ok!(
            limiter
                .try_acquire_all(&[("source_2", one.as_slice()), ("domain_a.org", five.as_slice())])
                .await
        );
        assert_eq!(limiter.get_remaining("source_2", 1, HOUR).await, 0);
        assert_eq!(limiter.get_remaining("domain_a.org", 5, HOUR).await, 4);
    }

    #[tokio::test]
    async fn test_cleanup_drops_idle_key_locks() {
        let (limiter, _) = limiter();
        let tiers = vec![RateLimitTier::per_hour(10)];
        for id in 0..20 {
            assert!(limiter.try_acquire(&source_key(id), &tiers).await);
        }
        assert_eq!(limiter.key_locks.len(), 20);

        limiter.cleanup().await;
        assert!(limiter.key_locks.is_empty());
    }

    #[tokio::test]
    async fn test_cleanup_purges_old_events() {
        let (limiter, store) = limiter();
        limiter.record_usage("k").await;
        store.age_events("k", Duration::from_secs(25 * 3600));

        assert_eq!(limiter.cleanup().await, 1);
        let stats = limiter.stats().await;
        assert_eq!(stats.events, 0);
        assert!(stats.last_cleanup.is_some());
    }

    #[tokio::test]
    async fn test_remaining_fraction() {
        let (limiter, _) = limiter();
        let tiers = vec![RateLimitTier::per_hour(10)];
        for _ in 0..8 {
            limiter.record_usage("k").await;
        }
        let fraction = limiter.remaining_fraction("k", &tiers).await;
        assert!((fraction - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_scope_keys() {
        assert_eq!(source_key(42), "source_42");
        assert_eq!(RateLimitScope::Worker.key("w-1"), "worker_w-1");
        assert_eq!(RateLimitScope::Global.key(""), "global");
        assert_eq!(
            domain_key("https://Events.Example.com/cal.ics").as_deref(),
            Some("domain_events.example.com")
        );
        assert_eq!(domain_of("not a url"), None);
    }

    #[test]
    fn test_backend_parse() {
        assert_eq!("postgres".parse::<CounterBackend>().unwrap(), CounterBackend::Postgres);
        assert!("redis".parse::<CounterBackend>().is_err());
    }
}

//! Source collaborators
//!
//! The ingestion core never fetches or parses anything itself. It talks to
//! two collaborators:
//! - [`SourceFetcher`] performs the network fetch + parse for a source
//! - [`SourceRegistry`] gives read-only access to sources and their history
//!
//! [`FetchError`] carries the retryable/permanent classification the worker
//! hands to the queue.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::config::duration_millis;

/// Errors raised by collaborators
#[derive(Debug, Clone, thiserror::Error)]
pub enum FetchError {
    #[error("timeout: {0}")]
    Timeout(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("http {status}: {message}")]
    Http { status: u16, message: String },

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("{0}")]
    Other(String),
}

impl FetchError {
    /// Whether the failure is transient and the job should be retried
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connection(_) | Self::RateLimited(_) => true,
            Self::Http { status, message } => {
                *status >= 500 || *status == 429 || is_retryable_message(message)
            }
            Self::NotFound(_) | Self::Parse(_) | Self::Validation(_) => false,
            Self::Other(message) => is_retryable_message(message),
        }
    }
}

/// Broad failure classes seen in scrape history
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Connection,
    RateLimit,
    NotFound,
    Other,
}

const RETRYABLE_MARKERS: &[&str] = &[
    "network",
    "timeout",
    "timed out",
    "connection",
    "rate limit",
    "too many requests",
    "temporarily unavailable",
    "service unavailable",
    "bad gateway",
    "gateway timeout",
    "internal server error",
];

/// HTTP status named in a message, e.g. `HTTP 503` or `status: 502`
///
/// Bare numbers are ignored so sizes and counts are not mistaken for statuses.
pub fn status_in_message(message: &str) -> Option<u16> {
    let words: Vec<&str> = message
        .split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    words.windows(2).find_map(|pair| {
        let label = pair[0].to_ascii_lowercase();
        if !matches!(label.as_str(), "http" | "status" | "code") || pair[1].len() != 3 {
            return None;
        }
        pair[1].parse().ok()
    })
}

/// Classify a free-form error message as transient
pub fn is_retryable_message(message: &str) -> bool {
    if matches!(status_in_message(message), Some(429 | 500 | 502 | 503 | 504)) {
        return true;
    }
    let message = message.to_ascii_lowercase();
    RETRYABLE_MARKERS.iter().any(|marker| message.contains(marker))
}

/// Classify a recorded failure message
pub fn classify_failure(message: &str) -> FailureKind {
    let status = status_in_message(message);
    let message = message.to_ascii_lowercase();
    if status == Some(429)
        || ["rate limit", "too many requests"]
            .iter()
            .any(|marker| message.contains(marker))
    {
        FailureKind::RateLimit
    } else if status == Some(404) || message.contains("not found") {
        FailureKind::NotFound
    } else if ["connection", "timeout", "timed out", "network", "dns"]
        .iter()
        .any(|marker| message.contains(marker))
    {
        FailureKind::Connection
    } else {
        FailureKind::Other
    }
}

/// A scrapeable source, owned by the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    pub id: i64,
    pub name: String,
    pub url: String,
    /// Content format hint (e.g. `ical`, `html`, `json`, `rss`)
    #[serde(default)]
    pub scrape_type: String,
    #[serde(default)]
    pub last_scraped_at: Option<DateTime<Utc>>,
}

impl SourceDescriptor {
    pub fn new(id: i64, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            url: url.into(),
            scrape_type: String::new(),
            last_scraped_at: None,
        }
    }

    pub fn with_scrape_type(mut self, scrape_type: impl Into<String>) -> Self {
        self.scrape_type = scrape_type.into();
        self
    }

    pub fn with_last_scraped_at(mut self, at: DateTime<Utc>) -> Self {
        self.last_scraped_at = Some(at);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Success,
    Failure,
}

/// One past scrape of a source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrapeAttempt {
    pub status: AttemptStatus,
    pub events_found: u32,
    #[serde(with = "duration_millis")]
    pub duration: Duration,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ScrapeAttempt {
    pub fn success(events_found: u32, duration: Duration, at: DateTime<Utc>) -> Self {
        Self {
            status: AttemptStatus::Success,
            events_found,
            duration,
            error_message: None,
            created_at: at,
        }
    }

    pub fn failure(error: impl Into<String>, duration: Duration, at: DateTime<Utc>) -> Self {
        Self {
            status: AttemptStatus::Failure,
            events_found: 0,
            duration,
            error_message: Some(error.into()),
            created_at: at,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == AttemptStatus::Success
    }
}

/// What a scrape produced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeSummary {
    pub events_found: u32,
    pub events_added: u32,
}

/// Opaque report returned by optimize/test jobs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptimizationReport(pub serde_json::Value);

/// Performs the network fetch and parse for a source
#[async_trait]
pub trait SourceFetcher: Send + Sync + 'static {
    async fn scrape(&self, source: &SourceDescriptor) -> Result<ScrapeSummary, FetchError>;

    /// Analyse and tune a source's configuration
    async fn optimize(&self, source_id: i64, dry_run: bool)
        -> Result<OptimizationReport, FetchError>;

    /// Health check, optimizing if the test fails
    async fn test_and_optimize(
        &self,
        source_id: i64,
        dry_run: bool,
    ) -> Result<OptimizationReport, FetchError>;
}

/// Read-only access to sources and their scrape history
#[async_trait]
pub trait SourceRegistry: Send + Sync + 'static {
    async fn active_sources(&self) -> Result<Vec<SourceDescriptor>, FetchError>;

    async fn get_source(&self, source_id: i64) -> Result<Option<SourceDescriptor>, FetchError>;

    /// Attempts recorded at or after `since`, oldest first
    async fn history(
        &self,
        source_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<ScrapeAttempt>, FetchError>;
}

/// How long the in-memory registry keeps scrape attempts by default
pub const DEFAULT_HISTORY_RETENTION: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// In-memory source registry
///
/// Backs tests and embedded deployments where sources come from a file.
/// Attempts older than the history retention are dropped as new ones arrive.
pub struct InMemorySourceRegistry {
    sources: RwLock<BTreeMap<i64, SourceDescriptor>>,
    history: RwLock<HashMap<i64, Vec<ScrapeAttempt>>>,
    history_retention: Duration,
}

impl Default for InMemorySourceRegistry {
    fn default() -> Self {
        Self {
            sources: RwLock::default(),
            history: RwLock::default(),
            history_retention: DEFAULT_HISTORY_RETENTION,
        }
    }
}

impl InMemorySourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep attempts for `retention`; should cover the longest lookback of the scheduler
    pub fn with_history_retention(mut self, retention: Duration) -> Self {
        self.history_retention = retention;
        self
    }

    pub fn with_sources(sources: impl IntoIterator<Item = SourceDescriptor>) -> Self {
        let registry = Self::new();
        for source in sources {
            registry.upsert(source);
        }
        registry
    }

    pub fn upsert(&self, source: SourceDescriptor) {
        self.sources.write().insert(source.id, source);
    }

    pub fn remove(&self, source_id: i64) -> Option<SourceDescriptor> {
        self.history.write().remove(&source_id);
        self.sources.write().remove(&source_id)
    }

    pub fn len(&self) -> usize {
        self.sources.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.read().is_empty()
    }

    /// Append an attempt; successes also advance `last_scraped_at`
    pub fn record_attempt(&self, source_id: i64, attempt: ScrapeAttempt) {
        if attempt.is_success() {
            if let Some(source) = self.sources.write().get_mut(&source_id) {
                let at = attempt.created_at;
                source.last_scraped_at =
                    Some(source.last_scraped_at.map_or(at, |prev| prev.max(at)));
            }
        }

        let mut history = self.history.write();
        let attempts = history.entry(source_id).or_default();
        let idx = attempts.partition_point(|a| a.created_at <= attempt.created_at);
        attempts.insert(idx, attempt);

        let cutoff = chrono::Duration::from_std(self.history_retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention));
        if let Some(cutoff) = cutoff {
            let expired = attempts.partition_point(|a| a.created_at < cutoff);
            attempts.drain(..expired);
        }
    }
}

#[async_trait]
impl SourceRegistry for InMemorySourceRegistry {
    async fn active_sources(&self) -> Result<Vec<SourceDescriptor>, FetchError> {
        Ok(self.sources.read().values().cloned().collect())
    }

    async fn get_source(&self, source_id: i64) -> Result<Option<SourceDescriptor>, FetchError> {
        Ok(self.sources.read().get(&source_id).cloned())
    }

    async fn history(
        &self,
        source_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<ScrapeAttempt>, FetchError> {
        Ok(self
            .history
            .read()
            .get(&source_id)
            .map(|attempts| {
                attempts
                    .iter()
                    .filter(|a| a.created_at >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        assert!(FetchError::Timeout("slow".into()).is_retryable());
        assert!(FetchError::Http { status: 503, message: String::new() }.is_retryable());
        assert!(FetchError::Http { status: 429, message: String::new() }.is_retryable());
        assert!(!FetchError::Http { status: 404, message: String::new() }.is_retryable());
        assert!(!FetchError::Parse("bad ical".into()).is_retryable());
        assert!(FetchError::Other("Too Many Requests".into()).is_retryable());
        assert!(!FetchError::Other("unsupported layout".into()).is_retryable());
    }

    #[tokio::test]
    async fn test_history_retention_trims_old_attempts() {
        let registry =
            InMemorySourceRegistry::new().with_history_retention(Duration::from_secs(3600));
        let now = Utc::now();
        for minutes in [180, 90, 30, 5] {
            registry.record_attempt(
                7,
                ScrapeAttempt::success(
                    1,
                    Duration::from_secs(1),
                    now - chrono::Duration::minutes(minutes),
                ),
            );
        }

        let kept = registry.history(7, DateTime::<Utc>::MIN_UTC).await.unwrap();
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|a| a.created_at >= now - chrono::Duration::hours(1)));
    }

    #[test]
    fn test_status_codes_need_context() {
        assert_eq!(status_in_message("http 503: https://example.org/feed"), Some(503));
        assert_eq!(status_in_message("upstream returned status: 502"), Some(502));
        assert_eq!(status_in_message("read 5002 bytes"), None);
        assert_eq!(status_in_message("parsed 500 events"), None);

        assert!(is_retryable_message("HTTP 502 from origin"));
        assert!(is_retryable_message("Bad Gateway"));
        assert!(!is_retryable_message("read 5002 bytes then hit bad markup"));
        assert!(!is_retryable_message("feed lists 500 events"));
    }

    #[test]
    fn test_classify_failure() {
        assert_eq!(classify_failure("Connection refused"), FailureKind::Connection);
        assert_eq!(classify_failure("HTTP 429 rate limit"), FailureKind::RateLimit);
        assert_eq!(classify_failure("http 404: https://example.org/gone"), FailureKind::NotFound);
        assert_eq!(classify_failure("skipped 404 duplicate rows"), FailureKind::Other);
        assert_eq!(classify_failure("page not found"), FailureKind::NotFound);
        assert_eq!(classify_failure("selector missing"), FailureKind::Other);
    }

    #[tokio::test]
    async fn test_registry_history_window() {
        let registry = InMemorySourceRegistry::with_sources([SourceDescriptor::new(
            1,
            "City events",
            "https://example.com/events",
        )]);
        let now = Utc::now();

        registry.record_attempt(
            1,
            ScrapeAttempt::success(4, Duration::from_secs(3), now - chrono::Duration::days(40)),
        );
        registry.record_attempt(
            1,
            ScrapeAttempt::failure(
                "timeout",
                Duration::from_secs(30),
                now - chrono::Duration::hours(1),
            ),
        );
        registry.record_attempt(1, ScrapeAttempt::success(6, Duration::from_secs(2), now));

        let recent = registry
            .history(1, now - chrono::Duration::days(30))
            .await
            .unwrap();
        assert_eq!(recent.len(), 2);

        // The 40-day-old attempt fell outside the default retention
        let all = registry.history(1, DateTime::<Utc>::MIN_UTC).await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(!recent[0].is_success());
        assert!(recent[1].is_success());

        let source = registry.get_source(1).await.unwrap().unwrap();
        assert_eq!(source.last_scraped_at, Some(now));
    }
}

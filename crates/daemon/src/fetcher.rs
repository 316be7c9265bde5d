// Built-in source collaborators for the daemon
//
// Decision: sources are read from a JSON file into the in-memory registry.
// Decision: the HTTP fetcher understands iCalendar feeds only; events are
// identified by their UID so repeated scrapes report what is new.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::header::CONTENT_TYPE;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use harvester_ingest::source::{
    FetchError, InMemorySourceRegistry, OptimizationReport, ScrapeAttempt, ScrapeSummary,
    SourceDescriptor, SourceFetcher, SourceRegistry,
};

/// Parse a sources file: a JSON array of source descriptors
pub fn parse_sources(json: &str) -> Result<Vec<SourceDescriptor>, serde_json::Error> {
    serde_json::from_str(json)
}

/// Load sources from `path`; a missing file yields no sources
pub fn load_sources(path: &Path) -> anyhow::Result<Vec<SourceDescriptor>> {
    if !path.exists() {
        warn!(path = %path.display(), "Sources file not found, starting without sources");
        return Ok(Vec::new());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read sources file {}", path.display()))?;
    let sources = parse_sources(&raw)
        .with_context(|| format!("Invalid sources file {}", path.display()))?;
    info!(path = %path.display(), count = sources.len(), "Loaded sources");
    Ok(sources)
}

/// UIDs missing from a feed for this many days are forgotten
const SEEN_RETENTION_DAYS: i64 = 30;

/// A fetched document
#[derive(Debug, Clone)]
struct Page {
    content_type: Option<String>,
    body: String,
}

/// Fetches sources over HTTP and records every attempt in the registry
pub struct HttpSourceFetcher {
    http: reqwest::Client,
    registry: Arc<InMemorySourceRegistry>,
    /// Event UIDs per source, with the last scrape that listed them
    seen: DashMap<i64, HashMap<String, DateTime<Utc>>>,
}

impl HttpSourceFetcher {
    pub fn new(registry: Arc<InMemorySourceRegistry>, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("harvesterd/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            registry,
            seen: DashMap::new(),
        })
    }

    async fn fetch(&self, url: &str) -> Result<Page, FetchError> {
        let response = self.http.get(url).send().await.map_err(map_reqwest_error)?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status.as_u16(), url));
        }

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_ascii_lowercase());
        let body = response.text().await.map_err(map_reqwest_error)?;
        Ok(Page { content_type, body })
    }

    async fn load_source(&self, source_id: i64) -> Result<SourceDescriptor, FetchError> {
        self.registry
            .get_source(source_id)
            .await?
            .ok_or_else(|| FetchError::NotFound(format!("source {source_id}")))
    }

    /// Number of UIDs in `uids` not seen before for this source
    fn record_uids(&self, source_id: i64, uids: Vec<String>, now: DateTime<Utc>) -> u32 {
        let mut seen = self.seen.entry(source_id).or_default();
        let added = uids
            .into_iter()
            .filter(|uid| seen.insert(uid.clone(), now).is_none())
            .count() as u32;
        let cutoff = now - chrono::Duration::days(SEEN_RETENTION_DAYS);
        seen.retain(|_, last_seen| *last_seen >= cutoff);
        added
    }

    /// Compare the configured scrape type with what the document looks like
    fn optimize_with(
        &self,
        source: &SourceDescriptor,
        page: &Page,
        dry_run: bool,
    ) -> OptimizationReport {
        let detected = detect_scrape_type(page.content_type.as_deref(), &page.body);
        let changed = !source.scrape_type.eq_ignore_ascii_case(detected);

        if changed && !dry_run {
            info!(
                source_id = source.id,
                from = %source.scrape_type,
                to = detected,
                "Updating source scrape type"
            );
            self.registry
                .upsert(source.clone().with_scrape_type(detected));
        }

        OptimizationReport(json!({
            "source_id": source.id,
            "dry_run": dry_run,
            "current_scrape_type": source.scrape_type,
            "detected_scrape_type": detected,
            "events_found": count_events(&page.body),
            "changed": changed,
            "applied": changed && !dry_run,
        }))
    }
}

#[async_trait]
impl SourceFetcher for HttpSourceFetcher {
    #[instrument(skip(self, source), fields(source_id = source.id, url = %source.url))]
    async fn scrape(&self, source: &SourceDescriptor) -> Result<ScrapeSummary, FetchError> {
        let started = Instant::now();
        let page = match self.fetch(&source.url).await {
            Ok(page) => page,
            Err(e) => {
                self.registry.record_attempt(
                    source.id,
                    ScrapeAttempt::failure(e.to_string(), started.elapsed(), Utc::now()),
                );
                return Err(e);
            }
        };

        let events_found = count_events(&page.body);
        let events_added = self.record_uids(source.id, event_uids(&page.body), Utc::now());
        self.registry.record_attempt(
            source.id,
            ScrapeAttempt::success(events_found, started.elapsed(), Utc::now()),
        );
        debug!(events_found, events_added, "Scraped source");

        Ok(ScrapeSummary {
            events_found,
            events_added,
        })
    }

    #[instrument(skip(self))]
    async fn optimize(
        &self,
        source_id: i64,
        dry_run: bool,
    ) -> Result<OptimizationReport, FetchError> {
        let source = self.load_source(source_id).await?;
        let page = self.fetch(&source.url).await?;
        Ok(self.optimize_with(&source, &page, dry_run))
    }

    #[instrument(skip(self))]
    async fn test_and_optimize(
        &self,
        source_id: i64,
        dry_run: bool,
    ) -> Result<OptimizationReport, FetchError> {
        let source = self.load_source(source_id).await?;
        let page = match self.fetch(&source.url).await {
            Ok(page) => page,
            Err(e) => {
                warn!(source_id, error = %e, "Source test failed");
                return Ok(OptimizationReport(json!({
                    "source_id": source_id,
                    "healthy": false,
                    "error": e.to_string(),
                })));
            }
        };

        let events_found = count_events(&page.body);
        if events_found > 0 {
            return Ok(OptimizationReport(json!({
                "source_id": source_id,
                "healthy": true,
                "events_found": events_found,
            })));
        }

        let optimization = self.optimize_with(&source, &page, dry_run);
        Ok(OptimizationReport(json!({
            "source_id": source_id,
            "healthy": false,
            "error": "no events found",
            "optimization": optimization.0,
        })))
    }
}

fn map_reqwest_error(e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::Timeout(e.to_string())
    } else if e.is_connect() {
        FetchError::Connection(e.to_string())
    } else if e.is_decode() || e.is_body() {
        FetchError::Parse(e.to_string())
    } else {
        FetchError::Other(e.to_string())
    }
}

fn status_error(status: u16, url: &str) -> FetchError {
    match status {
        404 | 410 => FetchError::NotFound(url.to_string()),
        429 => FetchError::RateLimited(format!("{url} returned status 429")),
        _ => FetchError::Http {
            status,
            message: format!("{url} returned {status}"),
        },
    }
}

/// Number of `VEVENT` components in an iCalendar document
pub fn count_events(body: &str) -> u32 {
    body.lines()
        .filter(|line| line.trim().eq_ignore_ascii_case("BEGIN:VEVENT"))
        .count() as u32
}

/// `UID` values of the events in an iCalendar document
pub fn event_uids(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| {
            let line = line.trim();
            let (name, value) = line.split_once(':')?;
            let name = name.split(';').next()?;
            name.eq_ignore_ascii_case("UID")
                .then(|| value.trim().to_string())
                .filter(|uid| !uid.is_empty())
        })
        .collect()
}

/// Best-guess scrape type of a document
pub fn detect_scrape_type(content_type: Option<&str>, body: &str) -> &'static str {
    let content_type = content_type.unwrap_or_default();
    let head: String = body.chars().take(512).collect::<String>().to_ascii_lowercase();

    if content_type.contains("text/calendar") || head.contains("begin:vcalendar") {
        "ical"
    } else if content_type.contains("rss")
        || content_type.contains("atom")
        || head.contains("<rss")
        || head.contains("<feed")
    {
        "rss"
    } else if content_type.contains("json") || head.trim_start().starts_with('{') {
        "json"
    } else {
        "html"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{http::header, routing::get, Router};

    const CALENDAR: &str = "BEGIN:VCALENDAR\r\nVERSION:2.0\r\n\
        BEGIN:VEVENT\r\nUID:story-time@library\r\nSUMMARY:Story time\r\nEND:VEVENT\r\n\
        BEGIN:VEVENT\r\nUID;X-FOO=bar:book-club@library\r\nSUMMARY:Book club\r\nEND:VEVENT\r\n\
        END:VCALENDAR\r\n";

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn fetcher(registry: Arc<InMemorySourceRegistry>) -> HttpSourceFetcher {
        HttpSourceFetcher::new(registry, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_parse_sources() {
        let sources = parse_sources(
            r#"[
                {"id": 1, "name": "Library", "url": "https://library.example.org/events.ics", "scrape_type": "ical"},
                {"id": 2, "name": "Museum", "url": "https://museum.example.org/whatson"}
            ]"#,
        )
        .unwrap();

        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].scrape_type, "ical");
        assert_eq!(sources[1].scrape_type, "");
        assert!(sources[1].last_scraped_at.is_none());
    }

    #[test]
    fn test_load_missing_sources_file() {
        let sources = load_sources(Path::new("/nonexistent/harvester/sources.json")).unwrap();
        assert!(sources.is_empty());
    }

    #[test]
    fn test_count_events_and_uids() {
        assert_eq!(count_events(CALENDAR), 2);
        assert_eq!(
            event_uids(CALENDAR),
            vec!["story-time@library".to_string(), "book-club@library".to_string()]
        );
        assert_eq!(count_events("<html></html>"), 0);
    }

    #[test]
    fn test_seen_uids_age_out() {
        let fetcher = fetcher(Arc::new(InMemorySourceRegistry::new()));
        let start = Utc::now();
        let uids = |ids: &[&str]| ids.iter().map(|s| s.to_string()).collect::<Vec<_>>();

        assert_eq!(fetcher.record_uids(1, uids(&["a", "b"]), start), 2);
        assert_eq!(fetcher.record_uids(1, uids(&["b", "c"]), start), 1);

        // "a" has not been listed for longer than the retention period
        let later = start + chrono::Duration::days(SEEN_RETENTION_DAYS + 1);
        assert_eq!(fetcher.record_uids(1, uids(&["a"]), later), 1);
        let seen = fetcher.seen.get(&1).unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen.contains_key("a"));
    }

    #[test]
    fn test_status_error_classification() {
        assert!(matches!(status_error(404, "u"), FetchError::NotFound(_)));
        assert!(!status_error(404, "u").is_retryable());
        assert!(status_error(429, "u").is_retryable());
        assert!(status_error(503, "u").is_retryable());
        assert!(!status_error(400, "u").is_retryable());
    }

    #[test]
    fn test_detect_scrape_type() {
        assert_eq!(detect_scrape_type(Some("text/calendar; charset=utf-8"), ""), "ical");
        assert_eq!(detect_scrape_type(None, CALENDAR), "ical");
        assert_eq!(detect_scrape_type(None, "<?xml version=\"1.0\"?><rss>"), "rss");
        assert_eq!(detect_scrape_type(Some("application/json"), "[]"), "json");
        assert_eq!(detect_scrape_type(Some("text/html"), "<html>"), "html");
    }

    #[tokio::test]
    async fn test_scrape_counts_new_events() {
        let base = serve(Router::new().route(
            "/events.ics",
            get(|| async { ([(header::CONTENT_TYPE, "text/calendar")], CALENDAR) }),
        ))
        .await;
        let source = SourceDescriptor::new(1, "Library", format!("{base}/events.ics"));
        let registry = Arc::new(InMemorySourceRegistry::with_sources([source.clone()]));
        let fetcher = fetcher(registry.clone());

        let first = fetcher.scrape(&source).await.unwrap();
        assert_eq!(first.events_found, 2);
        assert_eq!(first.events_added, 2);

        let second = fetcher.scrape(&source).await.unwrap();
        assert_eq!(second.events_found, 2);
        assert_eq!(second.events_added, 0);

        let history = registry
            .history(1, Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|a| a.is_success()));
        assert!(registry.get_source(1).await.unwrap().unwrap().last_scraped_at.is_some());
    }

    #[tokio::test]
    async fn test_scrape_failure_is_recorded() {
        let base = serve(Router::new()).await;
        let source = SourceDescriptor::new(7, "Gone", format!("{base}/missing.ics"));
        let registry = Arc::new(InMemorySourceRegistry::with_sources([source.clone()]));
        let fetcher = fetcher(registry.clone());

        let err = fetcher.scrape(&source).await.unwrap_err();
        assert!(matches!(err, FetchError::NotFound(_)));

        let history = registry
            .history(7, Utc::now() - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert!(!history[0].is_success());
    }

    #[tokio::test]
    async fn test_optimize_updates_scrape_type() {
        let base = serve(Router::new().route("/feed", get(|| async { CALENDAR }))).await;
        let source = SourceDescriptor::new(3, "Parks", format!("{base}/feed")).with_scrape_type("html");
        let registry = Arc::new(InMemorySourceRegistry::with_sources([source]));
        let fetcher = fetcher(registry.clone());

        let report = fetcher.optimize(3, true).await.unwrap();
        assert_eq!(report.0["detected_scrape_type"], "ical");
        assert_eq!(report.0["applied"], false);
        assert_eq!(registry.get_source(3).await.unwrap().unwrap().scrape_type, "html");

        let report = fetcher.optimize(3, false).await.unwrap();
        assert_eq!(report.0["applied"], true);
        assert_eq!(registry.get_source(3).await.unwrap().unwrap().scrape_type, "ical");

        let healthy = fetcher.test_and_optimize(3, false).await.unwrap();
        assert_eq!(healthy.0["healthy"], true);

        assert!(matches!(
            fetcher.optimize(99, true).await.unwrap_err(),
            FetchError::NotFound(_)
        ));
    }
}

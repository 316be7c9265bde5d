// Operational HTTP routes

use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::queue::{CleanupReport, JobStore, QueueStats};
use crate::ratelimit::{RateLimiter, RateLimiterStats};
use crate::scheduler::{Scheduler, SchedulerRunReport};
use crate::worker::{PoolStatus, WorkerPoolManager};

/// App state
#[derive(Clone)]
pub struct AdminState {
    pub store: Arc<dyn JobStore>,
    pub limiter: Arc<RateLimiter>,
    pub scheduler: Arc<Scheduler>,
    /// Absent when the process runs no workers (e.g. scheduler-only)
    pub pool: Option<Arc<WorkerPoolManager>>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub queue: QueueStats,
    pub rate_limiter: RateLimiterStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<PoolStatus>,
}

/// Request to run sources immediately; omit `source_ids` to run all active sources
#[derive(Debug, Default, Deserialize)]
pub struct RunSourcesRequest {
    #[serde(default)]
    pub source_ids: Option<Vec<i64>>,
}

#[derive(Debug, Serialize)]
pub struct RunSourcesResponse {
    pub queued: usize,
    pub job_ids: Vec<Uuid>,
}

/// Create admin routes
pub fn routes(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .route("/scheduler/run", post(run_scheduler))
        .route("/sources/run", post(run_sources))
        .route("/queue/cleanup", post(cleanup))
        .with_state(state)
}

/// GET /health
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// GET /stats - queue, rate limiter and pool statistics
async fn stats(State(state): State<AdminState>) -> Result<Json<StatsResponse>, StatusCode> {
    let queue = state.store.stats().await.map_err(|e| {
        tracing::error!("Failed to load queue stats: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    let rate_limiter = state.limiter.stats().await;

    Ok(Json(StatsResponse {
        queue,
        rate_limiter,
        pool: state.pool.as_ref().map(|pool| pool.status()),
    }))
}

/// POST /scheduler/run - one scheduling pass
async fn run_scheduler(
    State(state): State<AdminState>,
) -> Result<Json<SchedulerRunReport>, StatusCode> {
    let report = state.scheduler.run_once().await.map_err(|e| {
        tracing::error!("Scheduling pass failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    Ok(Json(report))
}

/// POST /sources/run - enqueue scrapes now, bypassing the scheduler
async fn run_sources(
    State(state): State<AdminState>,
    body: Option<Json<RunSourcesRequest>>,
) -> Result<Json<RunSourcesResponse>, StatusCode> {
    let request = body.map(|Json(req)| req).unwrap_or_default();
    let job_ids = state
        .scheduler
        .run_sources_now(request.source_ids.as_deref())
        .await
        .map_err(|e| {
            tracing::error!("Failed to queue sources: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        })?;

    Ok(Json(RunSourcesResponse {
        queued: job_ids.len(),
        job_ids,
    }))
}

/// POST /queue/cleanup - reclaim stale jobs, mark dead workers, purge old jobs
async fn cleanup(State(state): State<AdminState>) -> Result<Json<CleanupReport>, StatusCode> {
    let report = state.store.cleanup().await.map_err(|e| {
        tracing::error!("Queue cleanup failed: {}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;
    state.limiter.cleanup().await;
    Ok(Json(report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{InMemoryJobStore, JobStatus, NewJob};
    use crate::scheduler::SchedulerConfig;
    use crate::source::{InMemorySourceRegistry, SourceDescriptor};
    use axum::{body::Body, http::Request};
    use http_body_util::BodyExt;
    use std::time::Duration;
    use tower::ServiceExt;

    fn state() -> (AdminState, Arc<InMemoryJobStore>) {
        let store = Arc::new(InMemoryJobStore::new());
        let limiter = Arc::new(RateLimiter::in_memory());
        let registry = Arc::new(InMemorySourceRegistry::with_sources([
            SourceDescriptor::new(1, "Library", "https://library.example.org/events.ics"),
            SourceDescriptor::new(2, "Museum", "https://museum.example.org/whatson"),
        ]));
        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            limiter.clone(),
            registry,
            SchedulerConfig::default().with_jitter_max(Duration::ZERO),
        ));
        let state = AdminState {
            store: store.clone(),
            limiter,
            scheduler,
            pool: None,
        };
        (state, store)
    }

    async fn json_body(response: axum::response::Response) -> serde_json::Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    fn post(uri: &str, body: Body) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(body)
            .unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (state, _) = state();
        let response = routes(state)
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(json_body(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn test_stats() {
        let (state, store) = state();
        store.enqueue(NewJob::scrape(1)).await.unwrap();

        let response = routes(state)
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        let body = json_body(response).await;
        assert_eq!(body["queue"]["pending"], 1);
        assert_eq!(body["rate_limiter"]["backend"], "memory");
        assert!(body.get("pool").is_none());
    }

    #[tokio::test]
    async fn test_run_scheduler() {
        let (state, store) = state();
        let response = routes(state)
            .oneshot(post("/scheduler/run", Body::empty()))
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(json_body(response).await["scheduled"], 2);
        assert_eq!(store.count_by_status(JobStatus::Pending), 2);
    }

    #[tokio::test]
    async fn test_run_selected_sources() {
        let (state, _) = state();
        let app = routes(state);

        let response = app
            .clone()
            .oneshot(post("/sources/run", Body::from(r#"{"source_ids":[2]}"#)))
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(json_body(response).await["queued"], 1);

        // No body runs every active source
        let response = app
            .oneshot(post("/sources/run", Body::empty()))
            .await
            .unwrap();
        assert_eq!(json_body(response).await["queued"], 2);
    }

    #[tokio::test]
    async fn test_cleanup() {
        let (state, _) = state();
        let response = routes(state)
            .oneshot(post("/queue/cleanup", Body::empty()))
            .await
            .unwrap();

        assert_eq!(response.status(), 200);
        assert_eq!(json_body(response).await["reclaimed"], 0);
    }
}

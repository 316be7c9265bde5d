//! # Harvester Ingestion Core
//!
//! Reliable scheduling, queuing, rate limiting and execution of scrape jobs
//! against unreliable, rate-limited remote sources.
//!
//! ## Features
//!
//! - **Durable job queue**: Atomic claiming, priority ordering, exponential backoff and
//!   heartbeat-based reclamation of jobs held by crashed workers
//! - **Rate limiting**: Sliding-window budgets per source, domain, worker or globally,
//!   over an in-memory or PostgreSQL counter store (fails open on backend errors)
//! - **Workers**: Sequential execution loops that claim, rate-check, fetch and report
//! - **Pool management**: Backlog-proportional worker scaling with supervision and
//!   graceful/forced shutdown
//! - **Scheduling**: Weighted multi-factor decisions on when and how urgently to scrape
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Scheduler                             │
//! │  (factors: time, reliability, rate limit, performance, ...)  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ enqueue
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         JobStore                             │
//! │  (PostgreSQL: ingest_jobs, ingest_workers)                   │
//! └─────────────────────────────────────────────────────────────┘
//!                              │ dequeue
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    WorkerPoolManager                         │
//! │  [Worker 1] [Worker 2] ... [Worker N]  ──► RateLimiter      │
//! │        │                                                     │
//! │        └──────────────► SourceFetcher (external)             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```ignore
//! use harvester_ingest::prelude::*;
//!
//! let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
//! let limiter = Arc::new(RateLimiter::in_memory());
//!
//! store.enqueue(NewJob::scrape(42).with_priority(Priority::High)).await?;
//!
//! let ctx = WorkerContext::new(store, limiter, fetcher, registry);
//! let pool = WorkerPoolManager::new(ctx, WorkerConfig::default(), PoolConfig::default());
//! pool.run().await?;
//! ```

pub mod admin;
pub mod config;
pub mod queue;
pub mod ratelimit;
pub mod scheduler;
pub mod source;
pub mod worker;

/// Prelude for common imports
pub mod prelude {
    pub use crate::config::IngestConfig;
    pub use crate::queue::{
        FailureOutcome, InMemoryJobStore, Job, JobStatus, JobStore, JobType, NewJob,
        PostgresJobStore, Priority, QueueConfig, StoreError,
    };
    pub use crate::ratelimit::{RateLimitScope, RateLimitTier, RateLimiter, RateLimiterConfig};
    pub use crate::scheduler::{Scheduler, SchedulerConfig, SchedulingDecision};
    pub use crate::source::{
        FetchError, ScrapeSummary, SourceDescriptor, SourceFetcher, SourceRegistry,
    };
    pub use crate::worker::{
        ExecutionMode, PoolConfig, Worker, WorkerConfig, WorkerContext, WorkerPoolManager,
    };
}

pub use queue::{InMemoryJobStore, JobStore, PostgresJobStore, StoreError};
pub use ratelimit::RateLimiter;
pub use scheduler::Scheduler;
pub use worker::{Worker, WorkerPoolManager};

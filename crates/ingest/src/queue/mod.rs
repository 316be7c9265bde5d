//! Job queue persistence
//!
//! This module provides:
//! - [`JobStore`] trait for job and worker bookkeeping
//! - [`InMemoryJobStore`] for tests and single-process deployments
//! - [`PostgresJobStore`] for production (SKIP LOCKED claiming)
//! - [`RetryPolicy`] for exponential backoff of retryable failures

mod memory;
mod postgres;
mod retry;
mod store;

pub use memory::InMemoryJobStore;
pub use postgres::PostgresJobStore;
pub use retry::RetryPolicy;
pub use store::{
    CleanupReport, FailureOutcome, Job, JobStatus, JobStore, JobType, NewJob, Priority,
    QueueConfig, QueueStats, RecentActivity, StoreError, WorkerRecord, WorkerStatus,
};

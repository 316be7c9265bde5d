//! Job execution
//!
//! - [`Worker`]: sequential claim/rate-check/fetch/report loop
//! - [`ExecutionUnit`]: where a worker runs (tokio task, OS thread, inline)
//! - [`WorkerPoolManager`]: backlog-driven scaling and supervision of workers

mod execution;
mod pool;
mod runner;

pub use execution::{
    ExecutionMode, ExecutionUnit, InlineExecutionUnit, StopOutcome, StopSignal,
    TaskExecutionUnit, ThreadExecutionUnit, UnitHandle, WorkerFactory, WorkerFuture,
};
pub use pool::{
    default_max_workers, target_worker_count, PoolAdjustment, PoolConfig, PoolError, PoolState,
    PoolStatus, PoolWorkerStatus, WorkerPoolManager,
};
pub use runner::{
    JobOutcome, Worker, WorkerActivity, WorkerConfig, WorkerContext, WorkerRunSummary,
    PROGRESS_FETCHING, PROGRESS_LIMITS_CHECKED, PROGRESS_RECORDING, PROGRESS_SOURCE_LOADED,
};

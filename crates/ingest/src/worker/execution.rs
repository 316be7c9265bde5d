//! Execution units: where a worker actually runs
//!
//! The pool only sees [`ExecutionUnit::spawn`] and [`UnitHandle`]; whether the
//! worker is a tokio task, an OS thread or an inline future is chosen by
//! [`ExecutionMode`].

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::pool::PoolError;
use super::runner::WorkerRunSummary;

/// A worker run, ready to be polled
pub type WorkerFuture = Pin<Box<dyn Future<Output = WorkerRunSummary> + Send>>;

/// Builds a worker run from its shutdown receiver
pub type WorkerFactory = Box<dyn FnOnce(watch::Receiver<bool>) -> WorkerFuture + Send>;

/// How long a force-stopped thread gets to drop its worker future
const THREAD_KILL_WAIT: Duration = Duration::from_secs(1);

/// Something that can run a worker independently of the caller
pub trait ExecutionUnit: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// False when workers cannot run alongside the supervisor
    fn supports_concurrency(&self) -> bool;

    fn spawn(&self, worker_id: &str, factory: WorkerFactory) -> Result<UnitHandle, PoolError>;
}

/// How a stop request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Worker exited within the grace period
    Graceful,
    /// Worker was terminated after the grace period
    Forced,
    /// Worker had already exited
    AlreadyFinished,
}

enum HandleKind {
    Task(JoinHandle<WorkerRunSummary>),
    Thread {
        done_rx: oneshot::Receiver<Option<WorkerRunSummary>>,
        kill_tx: Option<oneshot::Sender<()>>,
        finished: Arc<AtomicBool>,
    },
    Inline(Option<WorkerFuture>),
}

/// Asks one worker to stop after its current job
#[derive(Debug, Clone)]
pub struct StopSignal(Arc<watch::Sender<bool>>);

impl StopSignal {
    fn channel() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self(Arc::new(tx)), rx)
    }

    pub fn stop(&self) {
        let _ = self.0.send(true);
    }
}

/// Handle to one spawned worker
pub struct UnitHandle {
    worker_id: String,
    started_at: Instant,
    stop_signal: StopSignal,
    kind: HandleKind,
}

impl fmt::Debug for UnitHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnitHandle")
            .field("worker_id", &self.worker_id)
            .field("age", &self.age())
            .field("finished", &self.is_finished())
            .finish()
    }
}

impl UnitHandle {
    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn age(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn is_finished(&self) -> bool {
        match &self.kind {
            HandleKind::Task(handle) => handle.is_finished(),
            HandleKind::Thread { finished, .. } => finished.load(Ordering::Acquire),
            HandleKind::Inline(future) => future.is_none(),
        }
    }

    /// Ask the worker to stop after its current job
    pub fn signal_stop(&self) {
        self.stop_signal.stop();
    }

    /// Detached stop signal, usable after the handle has been moved
    pub fn stop_signal(&self) -> StopSignal {
        self.stop_signal.clone()
    }

    /// Wait for the worker to exit on its own
    pub async fn join(mut self) -> Option<WorkerRunSummary> {
        match &mut self.kind {
            HandleKind::Task(handle) => handle.await.ok(),
            HandleKind::Thread { done_rx, .. } => done_rx.await.ok().flatten(),
            HandleKind::Inline(future) => match future.take() {
                Some(future) => Some(future.await),
                None => None,
            },
        }
    }

    /// Signal a graceful stop, wait up to `grace`, then force termination
    pub async fn stop(mut self, grace: Duration) -> StopOutcome {
        if self.is_finished() {
            return StopOutcome::AlreadyFinished;
        }
        self.signal_stop();

        let worker_id = self.worker_id.clone();
        match &mut self.kind {
            HandleKind::Task(handle) => match tokio::time::timeout(grace, &mut *handle).await {
                Ok(_) => StopOutcome::Graceful,
                Err(_) => {
                    warn!(worker_id = %worker_id, "Worker did not stop in time, aborting task");
                    handle.abort();
                    StopOutcome::Forced
                }
            },
            HandleKind::Thread {
                done_rx, kill_tx, ..
            } => match tokio::time::timeout(grace, &mut *done_rx).await {
                Ok(_) => StopOutcome::Graceful,
                Err(_) => {
                    warn!(worker_id = %worker_id, "Worker did not stop in time, killing thread");
                    if let Some(kill) = kill_tx.take() {
                        let _ = kill.send(());
                    }
                    if tokio::time::timeout(THREAD_KILL_WAIT, &mut *done_rx)
                        .await
                        .is_err()
                    {
                        error!(worker_id = %worker_id, "Worker thread unresponsive, detaching");
                    }
                    StopOutcome::Forced
                }
            },
            HandleKind::Inline(future) => {
                // Never polled: dropping it is the whole stop
                future.take();
                StopOutcome::Forced
            }
        }
    }
}

/// Runs each worker as a tokio task
#[derive(Debug, Default, Clone, Copy)]
pub struct TaskExecutionUnit;

impl ExecutionUnit for TaskExecutionUnit {
    fn name(&self) -> &'static str {
        "task"
    }

    fn supports_concurrency(&self) -> bool {
        true
    }

    fn spawn(&self, worker_id: &str, factory: WorkerFactory) -> Result<UnitHandle, PoolError> {
        let (stop_signal, shutdown_rx) = StopSignal::channel();
        let handle = tokio::spawn(factory(shutdown_rx));
        debug!(worker_id, "Spawned worker task");

        Ok(UnitHandle {
            worker_id: worker_id.to_string(),
            started_at: Instant::now(),
            stop_signal,
            kind: HandleKind::Task(handle),
        })
    }
}

/// Runs each worker on a dedicated OS thread with its own current-thread runtime
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadExecutionUnit;

impl ExecutionUnit for ThreadExecutionUnit {
    fn name(&self) -> &'static str {
        "thread"
    }

    fn supports_concurrency(&self) -> bool {
        true
    }

    fn spawn(&self, worker_id: &str, factory: WorkerFactory) -> Result<UnitHandle, PoolError> {
        let (stop_signal, shutdown_rx) = StopSignal::channel();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = oneshot::channel();
        let finished = Arc::new(AtomicBool::new(false));

        let future = factory(shutdown_rx);
        let thread_finished = Arc::clone(&finished);
        let thread_worker_id = worker_id.to_string();

        std::thread::Builder::new()
            .name(format!("ingest-{worker_id}"))
            .spawn(move || {
                let summary = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime.block_on(async move {
                        tokio::select! {
                            summary = future => Some(summary),
                            Ok(()) = kill_rx => None,
                        }
                    }),
                    Err(e) => {
                        error!(worker_id = %thread_worker_id, error = %e, "Failed to build worker runtime");
                        None
                    }
                };
                thread_finished.store(true, Ordering::Release);
                let _ = done_tx.send(summary);
            })
            .map_err(|e| PoolError::Spawn(e.to_string()))?;

        debug!(worker_id, "Spawned worker thread");
        Ok(UnitHandle {
            worker_id: worker_id.to_string(),
            started_at: Instant::now(),
            stop_signal,
            kind: HandleKind::Thread {
                done_rx,
                kill_tx: Some(kill_tx),
                finished,
            },
        })
    }
}

/// Degraded mode: the worker future runs on the supervisor itself when joined
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineExecutionUnit;

impl ExecutionUnit for InlineExecutionUnit {
    fn name(&self) -> &'static str {
        "inline"
    }

    fn supports_concurrency(&self) -> bool {
        false
    }

    fn spawn(&self, worker_id: &str, factory: WorkerFactory) -> Result<UnitHandle, PoolError> {
        let (stop_signal, shutdown_rx) = StopSignal::channel();
        Ok(UnitHandle {
            worker_id: worker_id.to_string(),
            started_at: Instant::now(),
            stop_signal,
            kind: HandleKind::Inline(Some(factory(shutdown_rx))),
        })
    }
}

/// Which execution unit the pool uses
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Task,
    Thread,
    Inline,
}

impl ExecutionMode {
    pub fn unit(&self) -> Arc<dyn ExecutionUnit> {
        match self {
            Self::Task => Arc::new(TaskExecutionUnit),
            Self::Thread => Arc::new(ThreadExecutionUnit),
            Self::Inline => Arc::new(InlineExecutionUnit),
        }
    }
}

impl FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "task" => Ok(Self::Task),
            "thread" => Ok(Self::Thread),
            "inline" => Ok(Self::Inline),
            other => Err(format!("unknown execution mode: {other}")),
        }
    }
}

// Harvester daemon
//
// Decision: PostgreSQL backends when DATABASE_URL is set, in-memory otherwise.
// Decision: one process can host workers, the scheduler loop, or both.
// Decision: the admin server doubles as the shutdown signal listener.

mod fetcher;
mod telemetry;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use harvester_ingest::admin::{self, AdminState, RunSourcesResponse, StatsResponse};
use harvester_ingest::config::IngestConfig;
use harvester_ingest::queue::{InMemoryJobStore, JobStore, PostgresJobStore};
use harvester_ingest::ratelimit::{
    CounterBackend, CounterStore, InMemoryCounterStore, PostgresCounterStore, RateLimiter,
};
use harvester_ingest::scheduler::Scheduler;
use harvester_ingest::source::InMemorySourceRegistry;
use harvester_ingest::worker::{ExecutionMode, WorkerContext, WorkerPoolManager};

use crate::fetcher::HttpSourceFetcher;
use crate::telemetry::{init_telemetry, TelemetryConfig};

#[derive(Parser)]
#[command(name = "harvesterd")]
#[command(about = "Harvester ingestion daemon - schedule, queue and scrape event sources")]
#[command(version)]
struct Cli {
    /// PostgreSQL connection string (in-memory backends when omitted)
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// JSON file listing the sources to schedule
    #[arg(long, env = "SOURCES_FILE", default_value = "sources.json")]
    sources_file: PathBuf,

    /// Per-request timeout of the HTTP fetcher, in seconds
    #[arg(long, env = "FETCH_TIMEOUT_SECS", default_value = "30")]
    fetch_timeout_secs: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the worker pool, scheduler loop, queue cleanup and admin server
    Run {
        /// Admin server bind address
        #[arg(long, env = "ADMIN_ADDR")]
        admin_addr: Option<SocketAddr>,

        /// Upper bound on concurrent workers
        #[arg(long)]
        max_workers: Option<usize>,

        /// How workers execute: task, thread or inline
        #[arg(long)]
        execution_mode: Option<ExecutionMode>,

        /// Seconds between queue cleanup passes
        #[arg(long, env = "CLEANUP_INTERVAL_SECS", default_value = "60")]
        cleanup_interval_secs: u64,

        /// Do not run the scheduler loop in this process
        #[arg(long)]
        no_scheduler: bool,

        /// Do not run workers in this process
        #[arg(long, conflicts_with = "no_scheduler")]
        no_workers: bool,
    },

    /// Run one scheduling pass and print the report
    ScheduleOnce,

    /// Enqueue scrapes immediately, bypassing the scheduler
    RunSources {
        /// Source ids (all active sources when omitted)
        source_ids: Vec<i64>,
    },

    /// Print queue and rate limiter statistics
    Stats,

    /// Reclaim stale jobs, mark dead workers and purge old jobs
    Cleanup,

    /// Apply database migrations
    Migrate,
}

/// Storage chosen for this process
struct Backends {
    store: Arc<dyn JobStore>,
    limiter: Arc<RateLimiter>,
    postgres: Option<Arc<PostgresJobStore>>,
}

impl Backends {
    async fn connect(config: &IngestConfig) -> Result<Self> {
        let Some(url) = &config.database_url else {
            tracing::info!("DATABASE_URL not set, using in-memory backends");
            if config.rate_limiter.backend == CounterBackend::Postgres {
                tracing::warn!("Postgres rate limit backend requires DATABASE_URL, using memory");
            }
            return Ok(Self {
                store: Arc::new(InMemoryJobStore::with_config(config.queue.clone())),
                limiter: Arc::new(RateLimiter::new(
                    Arc::new(InMemoryCounterStore::new()),
                    config.rate_limiter.clone(),
                )),
                postgres: None,
            });
        };

        let max_connections = (config.pool.max_workers as u32 + 5).max(10);
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(10))
            .connect(url)
            .await
            .context("Failed to connect to database")?;
        tracing::info!(max_connections, "Connected to database");

        let counters: Arc<dyn CounterStore> = match config.rate_limiter.backend {
            CounterBackend::Postgres => Arc::new(PostgresCounterStore::new(pool.clone())),
            CounterBackend::Memory => Arc::new(InMemoryCounterStore::new()),
        };
        let postgres = Arc::new(PostgresJobStore::with_config(pool, config.queue.clone()));

        Ok(Self {
            store: postgres.clone(),
            limiter: Arc::new(RateLimiter::new(counters, config.rate_limiter.clone())),
            postgres: Some(postgres),
        })
    }

    async fn migrate(&self) -> Result<()> {
        match &self.postgres {
            Some(store) => {
                store.migrate().await.context("Failed to run migrations")?;
                tracing::info!("Migrations applied");
            }
            None => tracing::debug!("In-memory backends, no migrations to apply"),
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env must be loaded before clap reads env-backed arguments
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    // Keep the guard alive for the lifetime of the application
    let _telemetry_guard = init_telemetry(TelemetryConfig::from_env());

    let mut config = IngestConfig::from_env().context("Invalid configuration")?;
    if let Some(url) = cli.database_url.clone().filter(|s| !s.is_empty()) {
        config.database_url = Some(url);
    }
    if let Commands::Run {
        admin_addr,
        max_workers,
        execution_mode,
        ..
    } = &cli.command
    {
        if let Some(addr) = admin_addr {
            config.admin_addr = *addr;
        }
        if let Some(max) = max_workers {
            config.pool.max_workers = *max;
            config.pool.min_workers = config.pool.min_workers.min(*max);
        }
        if let Some(mode) = execution_mode {
            config.pool.execution_mode = *mode;
        }
    }
    config.validate().context("Invalid configuration")?;

    let backends = Backends::connect(&config).await?;
    if backends.postgres.is_none() && !matches!(cli.command, Commands::Run { .. }) {
        tracing::warn!("In-memory backends are discarded when this command exits");
    }

    let registry = Arc::new(
        InMemorySourceRegistry::with_sources(fetcher::load_sources(&cli.sources_file)?)
            .with_history_retention(config.scheduler.history_window()),
    );
    let scheduler = Arc::new(Scheduler::new(
        backends.store.clone(),
        backends.limiter.clone(),
        registry.clone(),
        config.scheduler.clone(),
    ));

    match cli.command {
        Commands::Run {
            cleanup_interval_secs,
            no_scheduler,
            no_workers,
            ..
        } => {
            backends.migrate().await?;
            let fetcher = Arc::new(HttpSourceFetcher::new(
                registry.clone(),
                Duration::from_secs(cli.fetch_timeout_secs),
            )?);
            let ctx = WorkerContext::new(
                backends.store.clone(),
                backends.limiter.clone(),
                fetcher,
                registry,
            );
            let pool = (!no_workers).then(|| {
                Arc::new(WorkerPoolManager::new(
                    ctx,
                    config.worker.clone(),
                    config.pool.clone(),
                ))
            });

            run(
                &config,
                &backends,
                scheduler,
                pool,
                !no_scheduler,
                Duration::from_secs(cleanup_interval_secs.max(1)),
            )
            .await
        }
        Commands::ScheduleOnce => {
            let report = scheduler.run_once().await.context("Scheduling pass failed")?;
            print_json(&report)
        }
        Commands::RunSources { source_ids } => {
            let requested = (!source_ids.is_empty()).then_some(source_ids.as_slice());
            let job_ids = scheduler
                .run_sources_now(requested)
                .await
                .context("Failed to queue sources")?;
            print_json(&RunSourcesResponse {
                queued: job_ids.len(),
                job_ids,
            })
        }
        Commands::Stats => {
            let queue = backends
                .store
                .stats()
                .await
                .context("Failed to load queue stats")?;
            print_json(&StatsResponse {
                queue,
                rate_limiter: backends.limiter.stats().await,
                pool: None,
            })
        }
        Commands::Cleanup => {
            let report = backends
                .store
                .cleanup()
                .await
                .context("Queue cleanup failed")?;
            backends.limiter.cleanup().await;
            print_json(&report)
        }
        Commands::Migrate => {
            if backends.postgres.is_none() {
                bail!("migrate requires DATABASE_URL");
            }
            backends.migrate().await
        }
    }
}

/// Serve until a shutdown signal, then drain every background loop
async fn run(
    config: &IngestConfig,
    backends: &Backends,
    scheduler: Arc<Scheduler>,
    pool: Option<Arc<WorkerPoolManager>>,
    with_scheduler: bool,
    cleanup_interval: Duration,
) -> Result<()> {
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    if let Some(pool) = &pool {
        let pool = Arc::clone(pool);
        tasks.push(tokio::spawn(async move {
            if let Err(e) = pool.run().await {
                tracing::error!(error = %e, "Worker pool stopped with error");
            }
        }));
    }

    if with_scheduler {
        let scheduler = Arc::clone(&scheduler);
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { scheduler.run(rx).await }));
    }

    tasks.push(tokio::spawn(cleanup_loop(
        backends.store.clone(),
        cleanup_interval,
        shutdown_rx.clone(),
    )));

    let state = AdminState {
        store: backends.store.clone(),
        limiter: backends.limiter.clone(),
        scheduler,
        pool: pool.clone(),
    };
    let app = admin::routes(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.admin_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.admin_addr))?;
    tracing::info!(
        addr = %config.admin_addr,
        workers = pool.is_some(),
        scheduler = with_scheduler,
        "harvesterd started"
    );

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    shutdown_tx.send_replace(true);
    if let Some(pool) = &pool {
        if let Err(e) = pool.shutdown().await {
            tracing::error!(error = %e, "Worker pool shutdown failed");
        }
    }
    for task in tasks {
        if let Err(e) = task.await {
            tracing::error!(error = %e, "Background task panicked");
        }
    }

    served.context("Admin server error")?;
    tracing::info!("harvesterd shutdown complete");
    Ok(())
}

/// Periodic queue cleanup until shutdown
async fn cleanup_loop(
    store: Arc<dyn JobStore>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match store.cleanup().await {
                    Ok(report) => tracing::debug!(
                        promoted = report.promoted,
                        reclaimed = report.reclaimed,
                        dead_workers = report.dead_workers,
                        purged = report.purged,
                        "Queue cleanup pass"
                    ),
                    Err(e) => tracing::warn!(error = %e, "Queue cleanup failed"),
                }
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
    tracing::debug!("Cleanup loop stopped");
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("Received shutdown signal");
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_flags() {
        let cli = Cli::try_parse_from([
            "harvesterd",
            "run",
            "--max-workers",
            "3",
            "--execution-mode",
            "thread",
            "--no-scheduler",
        ])
        .unwrap();

        match cli.command {
            Commands::Run {
                max_workers,
                execution_mode,
                no_scheduler,
                no_workers,
                ..
            } => {
                assert_eq!(max_workers, Some(3));
                assert_eq!(execution_mode, Some(ExecutionMode::Thread));
                assert!(no_scheduler);
                assert!(!no_workers);
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_parse_run_sources() {
        let cli = Cli::try_parse_from(["harvesterd", "run-sources", "4", "8"]).unwrap();
        match cli.command {
            Commands::RunSources { source_ids } => assert_eq!(source_ids, vec![4, 8]),
            _ => panic!("expected run-sources"),
        }
    }

    #[test]
    fn test_run_rejects_disabling_everything() {
        assert!(Cli::try_parse_from(["harvesterd", "run", "--no-scheduler", "--no-workers"]).is_err());
    }

    #[tokio::test]
    async fn test_cleanup_loop_stops_on_shutdown() {
        let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(cleanup_loop(store, Duration::from_millis(10), rx));

        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_in_memory_backends_without_database() {
        let backends = Backends::connect(&IngestConfig::default()).await.unwrap();
        assert!(backends.postgres.is_none());
        assert_eq!(backends.limiter.stats().await.backend, "memory");
        backends.migrate().await.unwrap();
    }
}

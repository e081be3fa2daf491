//! Wiring of configured components into runnable services
//!
//! The CLI commands and the integration tests both assemble the scheduler
//! and the worker through these helpers, so a process built by hand looks
//! exactly like one started from the command line.

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::{Config, ConfigError, ValidationError};
use crate::discovery::{Discoverer, DiscoveryError};
use crate::download::{
    DownloadExecutor, DownloadManager, LogProgress, RetryPolicy, TokioDelay, TransferError,
};
use crate::observability::Metrics;
use crate::queue::{QueueChannel, QueueError};
use crate::scheduler::{
    Cadence, ConfigFileSource, JobPublisher, Scheduler, SchedulerError, SchedulerHandle,
};
use crate::server::{self, AppState};
use crate::status::FileStatusStore;
use crate::worker::{Worker, WorkerError, WorkerSettings, WorkerSummary};

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Worker(#[from] WorkerError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),

    #[error("Background task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Publisher that re-reads `config_path` and expands its globs on every pass
pub fn publisher(
    config: &Config,
    config_path: Option<PathBuf>,
    channel: Arc<dyn QueueChannel>,
    metrics: Arc<Metrics>,
) -> Result<JobPublisher> {
    let discoverer = Arc::new(Discoverer::new(&config.download)?);
    let source = ConfigFileSource::new(config_path).with_discovery(discoverer);

    Ok(JobPublisher::new(Arc::new(source), channel)
        .with_retry(config.queue.connect_retries, config.queue.reconnect_delay())
        .with_metrics(metrics))
}

pub fn scheduler(config: &Config, publisher: JobPublisher) -> Result<(Scheduler, SchedulerHandle)> {
    let cadence = Cadence::from_config(&config.schedule)?;
    Ok(Scheduler::new(cadence, Arc::new(publisher)))
}

/// Download manager over the real HTTP/rsync executor
pub fn manager(
    config: &Config,
    shutdown: CancellationToken,
    metrics: Arc<Metrics>,
) -> Result<Arc<DownloadManager>> {
    let executor =
        DownloadExecutor::from_config(&config.download)?.with_progress(Arc::new(LogProgress::new()));

    let manager = DownloadManager::new(Arc::new(executor), &config.download)
        .with_policy(RetryPolicy::from_config(&config.download))
        .with_delay(Arc::new(TokioDelay))
        .with_shutdown(shutdown)
        .with_metrics(metrics);
    Ok(Arc::new(manager))
}

pub fn worker(
    config: &Config,
    channel: Arc<dyn QueueChannel>,
    manager: Arc<DownloadManager>,
    metrics: Arc<Metrics>,
) -> Worker {
    let status = Arc::new(FileStatusStore::new(config.status_dir()));
    Worker::new(channel, manager, status, WorkerSettings::from_config(config)).with_metrics(metrics)
}

/// Spawn the status server when `worker.http_addr` is configured
pub fn spawn_status_server(
    config: &Config,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
) -> Option<tokio::task::JoinHandle<()>> {
    let address = config.worker.http_addr?;
    let state = AppState {
        status: Arc::new(FileStatusStore::new(config.status_dir())),
        metrics,
    };

    Some(tokio::spawn(async move {
        if let Err(e) = server::serve(address, state, shutdown).await {
            error!(%address, error = %e, "Status server failed");
        }
    }))
}

/// Run a worker until `shutdown` fires, with the status server alongside
pub async fn run_worker(
    config: &Config,
    channel: Arc<dyn QueueChannel>,
    shutdown: CancellationToken,
    metrics: Arc<Metrics>,
) -> Result<WorkerSummary> {
    let manager = manager(config, shutdown.clone(), metrics.clone())?;
    let worker = worker(config, channel, manager, metrics.clone());
    let server = spawn_status_server(config, metrics, shutdown.clone());

    let summary = worker.run(shutdown.clone()).await;

    // The worker may have stopped on its own; take the server down with it
    shutdown.cancel();
    if let Some(server) = server {
        server.await.map_err(|e| AppError::Task(e.to_string()))?;
    }
    Ok(summary?)
}

/// Scheduler and worker in one process over one channel
pub async fn run_combined(
    config: &Config,
    config_path: Option<PathBuf>,
    channel: Arc<dyn QueueChannel>,
    shutdown: CancellationToken,
    trigger_now: bool,
) -> Result<WorkerSummary> {
    let metrics = Arc::new(Metrics::new());
    let publisher = publisher(config, config_path, channel.clone(), metrics.clone())?;
    let (scheduler, handle) = scheduler(config, publisher)?;

    let scheduler_task = tokio::spawn(scheduler.run(shutdown.clone()));

    if trigger_now {
        match handle.trigger().await {
            Ok(report) => info!(
                published = report.published,
                disabled = report.disabled,
                "Startup trigger published"
            ),
            // The worker still drains whatever is already queued
            Err(e) => warn!(error = %e, "Startup trigger failed"),
        }
    }

    let summary = run_worker(config, channel, shutdown.clone(), metrics).await;

    shutdown.cancel();
    scheduler_task
        .await
        .map_err(|e| AppError::Task(e.to_string()))?;
    summary
}

/// Token cancelled on Ctrl+C or SIGTERM
pub fn shutdown_on_signal() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        server::shutdown_signal().await;
        trigger.cancel();
    });
    token
}

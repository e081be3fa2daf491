//! Download worker service
//!
//! Consumes jobs from a [`QueueChannel`], gathers them into small batches,
//! runs each batch through the [`DownloadManager`] and settles every message
//! individually: ack for terminal outcomes, requeue when shutdown interrupted
//! the work. A message is never acked before its result is recorded.

pub mod runner;

pub use runner::{Settlement, settlement};

use futures_util::StreamExt;
use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::download::DownloadManager;
use crate::observability::Metrics;
use crate::queue::{QueueChannel, QueueError};
use crate::status::StatusSink;
use runner::{BatchContext, Counters};

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Worker configuration
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub batch_size: usize,
    pub linger: Duration,
    pub shutdown_grace: Duration,
    pub reconnect_delay: Duration,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            batch_size: 4,
            linger: Duration::from_millis(250),
            shutdown_grace: Duration::from_secs(3600),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

impl WorkerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            batch_size: config.worker.batch_size.max(1),
            linger: Duration::from_millis(config.worker.linger_ms),
            // A transfer already has its own deadline; wait that long by default
            shutdown_grace: config
                .worker
                .shutdown_grace_secs
                .map_or_else(|| config.download.timeout(), Duration::from_secs),
            reconnect_delay: config.queue.reconnect_delay(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    pub processed: u64,
    pub acked: u64,
    pub requeued: u64,
}

enum Intake {
    Shutdown,
    Resubscribe,
}

pub struct Worker {
    ctx: Arc<BatchContext>,
    settings: WorkerSettings,
    /// Bounds messages held unacked to the manager's slot count
    intake: Arc<Semaphore>,
}

impl Worker {
    pub fn new(
        channel: Arc<dyn QueueChannel>,
        manager: Arc<DownloadManager>,
        status: Arc<dyn StatusSink>,
        settings: WorkerSettings,
    ) -> Self {
        let intake = Arc::new(Semaphore::new(manager.max_parallel()));
        Self {
            ctx: Arc::new(BatchContext {
                channel,
                manager,
                status,
                metrics: Arc::new(Metrics::new()),
                counters: Counters::default(),
            }),
            settings,
            intake,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        if let Some(ctx) = Arc::get_mut(&mut self.ctx) {
            ctx.metrics = metrics;
        }
        self
    }

    /// Consume until `shutdown` fires, then give in-flight transfers the
    /// grace period before abandoning them to redelivery
    pub async fn run(&self, shutdown: CancellationToken) -> Result<WorkerSummary, WorkerError> {
        info!(
            max_parallel = self.ctx.manager.max_parallel(),
            batch_size = self.settings.batch_size,
            "Worker started"
        );
        let mut tasks = JoinSet::new();

        loop {
            let deliveries = tokio::select! {
                _ = shutdown.cancelled() => break,
                subscribed = self.ctx.channel.consume() => subscribed,
            };

            let mut deliveries = match deliveries {
                Ok(deliveries) => deliveries,
                Err(e) if e.is_unavailable() => {
                    warn!(error = %e, delay = ?self.settings.reconnect_delay, "Queue unavailable, retrying");
                    if self.pause(&shutdown).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    self.drain(&mut tasks).await;
                    return Err(e.into());
                }
            };

            match self.intake(&mut deliveries, &mut tasks, &shutdown).await {
                Intake::Shutdown => break,
                Intake::Resubscribe => {
                    if self.pause(&shutdown).await {
                        break;
                    }
                }
            }
        }

        info!("Worker stopping, waiting for in-flight downloads");
        self.drain(&mut tasks).await;

        if let Err(e) = self.ctx.channel.close().await {
            warn!(error = %e, "Failed to close queue channel");
        }

        let summary = self.summary();
        info!(
            processed = summary.processed,
            acked = summary.acked,
            requeued = summary.requeued,
            "Worker stopped"
        );
        Ok(summary)
    }

    pub fn summary(&self) -> WorkerSummary {
        let counters = &self.ctx.counters;
        WorkerSummary {
            processed: counters.processed.load(Ordering::Relaxed),
            acked: counters.acked.load(Ordering::Relaxed),
            requeued: counters.requeued.load(Ordering::Relaxed),
        }
    }

    /// Sleep before resubscribing; true when shutdown fired meanwhile
    async fn pause(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => true,
            _ = tokio::time::sleep(self.settings.reconnect_delay) => false,
        }
    }

    /// Pull batches off one subscription until it ends or shutdown fires
    async fn intake(
        &self,
        deliveries: &mut crate::queue::Deliveries,
        tasks: &mut JoinSet<()>,
        shutdown: &CancellationToken,
    ) -> Intake {
        loop {
            while tasks.try_join_next().is_some() {}

            // Wait for room before taking a message off the queue
            let permit = tokio::select! {
                _ = shutdown.cancelled() => return Intake::Shutdown,
                permit = self.intake.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return Intake::Shutdown,
                },
            };

            let first = tokio::select! {
                _ = shutdown.cancelled() => return Intake::Shutdown,
                next = deliveries.next() => next,
            };

            let first = match first {
                Some(Ok(message)) => message,
                Some(Err(e)) => {
                    warn!(error = %e, "Delivery failed, resubscribing");
                    return Intake::Resubscribe;
                }
                None => {
                    warn!("Delivery stream ended, resubscribing");
                    return Intake::Resubscribe;
                }
            };

            let mut batch = vec![(first, permit)];
            let mut ended = false;
            let deadline = Instant::now() + self.settings.linger;

            while batch.len() < self.settings.batch_size {
                let Ok(permit) = self.intake.clone().try_acquire_owned() else {
                    break;
                };

                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => break,
                    _ = shutdown.cancelled() => break,
                    next = deliveries.next() => match next {
                        Some(Ok(message)) => batch.push((message, permit)),
                        Some(Err(e)) => {
                            warn!(error = %e, "Delivery failed, resubscribing");
                            ended = true;
                            break;
                        }
                        None => {
                            ended = true;
                            break;
                        }
                    },
                }
            }

            debug!(size = batch.len(), "Dispatching batch");
            tasks.spawn(runner::process_batch(self.ctx.clone(), batch));

            if ended {
                return Intake::Resubscribe;
            }
        }
    }

    async fn drain(&self, tasks: &mut JoinSet<()>) {
        let drained = tokio::time::timeout(self.settings.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = tasks.len(),
                grace = ?self.settings.shutdown_grace,
                "Grace period over, abandoning transfers to redelivery"
            );
            tasks.abort_all();
            while tasks.join_next().await.is_some() {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DownloadConfig;
    use crate::download::{Executor, NoDelay};
    use crate::model::{DownloadResult, DownloadStatus, DownloadTarget, ErrorKind, JobMessage, Protocol};
    use crate::queue::FjallChannel;
    use crate::status::FileStatusStore;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use uuid::Uuid;

    /// Succeeds instantly unless the target name starts with "bad", "brief"
    /// or "slow"
    struct NamedExecutor;

    #[async_trait]
    impl Executor for NamedExecutor {
        async fn execute(&self, job_id: Uuid, target: &DownloadTarget, _timeout: Duration) -> DownloadResult {
            if target.name.starts_with("slow") {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            if target.name.starts_with("brief") {
                tokio::time::sleep(Duration::from_millis(300)).await;
            }
            if target.name.starts_with("bad") {
                return DownloadResult::failed(job_id, &target.name, ErrorKind::ConfigError, "bad target", Duration::ZERO);
            }
            DownloadResult::success(job_id, &target.name, 42, Duration::ZERO)
        }
    }

    fn job(name: &str) -> JobMessage {
        JobMessage::new(DownloadTarget {
            name: name.to_string(),
            url: format!("https://mirror.example/{name}.iso"),
            protocol: Protocol::Http,
            destination_path: PathBuf::from(format!("/srv/isos/{name}.iso")),
            enabled: true,
            checksum: None,
        })
    }

    struct Harness {
        _dir: TempDir,
        channel: Arc<FjallChannel>,
        status: Arc<FileStatusStore>,
        worker: Arc<Worker>,
        shutdown: CancellationToken,
    }

    fn harness(max_parallel: usize, grace: Duration) -> Harness {
        let dir = TempDir::new().unwrap();
        let channel = Arc::new(FjallChannel::open(dir.path().join("queue"), 5, false).unwrap());
        let status = Arc::new(FileStatusStore::new(dir.path().join("status")));
        let shutdown = CancellationToken::new();

        let config = DownloadConfig {
            max_parallel_downloads: max_parallel,
            ..DownloadConfig::default()
        };
        let manager = DownloadManager::new(Arc::new(NamedExecutor), &config)
            .with_delay(Arc::new(NoDelay))
            .with_shutdown(shutdown.clone());

        let settings = WorkerSettings {
            batch_size: 2,
            linger: Duration::from_millis(20),
            shutdown_grace: grace,
            reconnect_delay: Duration::from_millis(50),
        };
        let worker = Worker::new(channel.clone(), Arc::new(manager), status.clone(), settings);

        Harness {
            _dir: dir,
            channel,
            status,
            worker: Arc::new(worker),
            shutdown,
        }
    }

    async fn wait_for_records(status: &FileStatusStore, count: usize) {
        for _ in 0..200 {
            if status.list().await.unwrap().len() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("expected {count} status records");
    }

    #[tokio::test]
    async fn test_terminal_results_are_acked_and_recorded() {
        let h = harness(2, Duration::from_secs(5));
        let jobs = vec![job("ubuntu"), job("bad-fedora"), job("debian")];
        h.channel.publish_all(&jobs).await.unwrap();

        let worker = h.worker.clone();
        let shutdown = h.shutdown.clone();
        let run = tokio::spawn(async move { worker.run(shutdown).await });

        wait_for_records(&h.status, 3).await;
        h.shutdown.cancel();
        let summary = run.await.unwrap().unwrap();

        assert_eq!(summary.processed, 3);
        assert_eq!(summary.acked, 3);

        let stats = h.channel.stats().await.unwrap();
        assert_eq!(stats.ready, 0);
        assert_eq!(stats.unacked, Some(0));

        let failed = h.status.get("bad-fedora").await.unwrap().unwrap();
        assert_eq!(failed.status, DownloadStatus::Failed);
        assert_eq!(failed.error_kind, Some(ErrorKind::ConfigError));
        let ok = h.status.get("ubuntu").await.unwrap().unwrap();
        assert_eq!(ok.bytes_transferred, 42);
    }

    #[tokio::test]
    async fn test_shutdown_leaves_unfinished_jobs_unacked() {
        let h = harness(1, Duration::from_millis(100));
        h.channel
            .publish_all(&[job("slow-arch"), job("ubuntu")])
            .await
            .unwrap();

        let worker = h.worker.clone();
        let shutdown = h.shutdown.clone();
        let run = tokio::spawn(async move { worker.run(shutdown).await });

        // Let the first job start
        for _ in 0..100 {
            if h.channel.stats().await.unwrap().unacked == Some(1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        h.shutdown.cancel();
        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.acked, 0);

        let stats = h.channel.stats().await.unwrap();
        assert_eq!(stats.ready + stats.unacked.unwrap(), 2);
        assert!(h.status.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_lets_running_transfer_finish() {
        let h = harness(1, Duration::from_secs(10));
        h.channel.publish(&job("brief-debian")).await.unwrap();

        let worker = h.worker.clone();
        let shutdown = h.shutdown.clone();
        let run = tokio::spawn(async move { worker.run(shutdown).await });

        for _ in 0..100 {
            if h.channel.stats().await.unwrap().unacked == Some(1) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Signal arrives mid-transfer; the download still completes
        h.shutdown.cancel();
        let summary = run.await.unwrap().unwrap();
        assert_eq!(summary.acked, 1);
        assert_eq!(summary.requeued, 0);

        let record = h.status.get("brief-debian").await.unwrap().unwrap();
        assert_eq!(record.status, DownloadStatus::Success);
        let stats = h.channel.stats().await.unwrap();
        assert_eq!(stats.ready + stats.unacked.unwrap(), 0);
    }

    #[test]
    fn test_grace_defaults_to_transfer_deadline() {
        let config: Config = toml::from_str("[download]\ntimeout_seconds = 7200\n").unwrap();
        assert_eq!(
            WorkerSettings::from_config(&config).shutdown_grace,
            Duration::from_secs(7200)
        );

        let config: Config = toml::from_str("[worker]\nshutdown_grace_secs = 45\n").unwrap();
        assert_eq!(
            WorkerSettings::from_config(&config).shutdown_grace,
            Duration::from_secs(45)
        );
    }
}

use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::SchedulerError;
use crate::config::Config;
use crate::discovery::{self, Discoverer};
use crate::model::{DownloadTarget, JobMessage};
use crate::observability::Metrics;
use crate::queue::QueueChannel;

/// Supplies the current target list at publish time
#[async_trait]
pub trait TargetSource: Send + Sync {
    async fn targets(&self) -> Result<Vec<DownloadTarget>, SchedulerError>;
}

/// Re-reads the configuration file on every tick, so `toggle-iso` and
/// `toggle-glob` from another process take effect at the next publish
#[derive(Clone)]
pub struct ConfigFileSource {
    path: Option<PathBuf>,
    discoverer: Option<Arc<Discoverer>>,
}

impl ConfigFileSource {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            path,
            discoverer: None,
        }
    }

    /// Expand `[[iso_globs]]` on every pass; without it only `[[isos]]`
    /// are published
    pub fn with_discovery(mut self, discoverer: Arc<Discoverer>) -> Self {
        self.discoverer = Some(discoverer);
        self
    }
}

#[async_trait]
impl TargetSource for ConfigFileSource {
    async fn targets(&self) -> Result<Vec<DownloadTarget>, SchedulerError> {
        let path = self.path.clone();
        let config = tokio::task::spawn_blocking(move || Config::load(path))
            .await
            .map_err(|e| SchedulerError::Source(e.to_string()))??;

        match &self.discoverer {
            Some(discoverer) => Ok(discovery::resolve_targets(&config, discoverer).await),
            None => Ok(config.targets()),
        }
    }
}

/// Fixed list, used by `run` when the config was already loaded
#[derive(Debug, Clone)]
pub struct StaticSource(pub Vec<DownloadTarget>);

#[async_trait]
impl TargetSource for StaticSource {
    async fn targets(&self) -> Result<Vec<DownloadTarget>, SchedulerError> {
        Ok(self.0.clone())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub published: usize,
    pub disabled: usize,
}

/// Turns enabled targets into queued jobs, one publish at a time
pub struct JobPublisher {
    source: Arc<dyn TargetSource>,
    channel: Arc<dyn QueueChannel>,
    /// Held for a whole publish pass so passes never interleave
    in_progress: Mutex<()>,
    attempts: u32,
    retry_delay: Duration,
    metrics: Arc<Metrics>,
}

impl JobPublisher {
    pub fn new(source: Arc<dyn TargetSource>, channel: Arc<dyn QueueChannel>) -> Self {
        Self {
            source,
            channel,
            in_progress: Mutex::new(()),
            attempts: 5,
            retry_delay: Duration::from_secs(5),
            metrics: Arc::new(Metrics::new()),
        }
    }

    /// Retry budget for broker outages during a publish pass
    pub fn with_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.retry_delay = delay;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Publish one job per enabled target. A pass started while another is
    /// running waits for it to finish.
    pub async fn publish_enabled(&self) -> Result<PublishReport, SchedulerError> {
        let _pass = self.in_progress.lock().await;

        let targets = self.source.targets().await?;
        let total = targets.len();
        let jobs: Vec<JobMessage> = targets
            .into_iter()
            .filter(|t| t.enabled)
            .map(JobMessage::new)
            .collect();
        let report = PublishReport {
            published: jobs.len(),
            disabled: total - jobs.len(),
        };

        for job in &jobs {
            self.publish_with_retry(job).await?;
            self.metrics.job_published();
        }

        info!(
            published = report.published,
            disabled = report.disabled,
            "Published download jobs"
        );
        Ok(report)
    }

    async fn publish_with_retry(&self, job: &JobMessage) -> Result<(), SchedulerError> {
        let mut attempt = 1;
        loop {
            match self.channel.publish(job).await {
                Ok(()) => {
                    debug!(job_id = %job.job_id, target_name = %job.target.name, "Job published");
                    return Ok(());
                }
                Err(e) if e.is_unavailable() && attempt < self.attempts => {
                    warn!(
                        target_name = %job.target.name,
                        attempt,
                        error = %e,
                        delay = ?self.retry_delay,
                        "Publish failed, retrying"
                    );
                    tokio::time::sleep(self.retry_delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

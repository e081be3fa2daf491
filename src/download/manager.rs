//! Bounded-parallel execution with per-target retries
//!
//! Every transfer holds a [`WorkerSlot`] from one shared pool while it runs.
//! Slots are handed out first come, first served, and released during retry
//! backoff so a failing target never starves the rest of the batch.

use futures_util::stream::{FuturesUnordered, Stream, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::executor::Executor;
use super::retry::{Delay, RetryDecision, RetryPolicy, TokioDelay};
use crate::config::DownloadConfig;
use crate::model::{DownloadResult, DownloadTarget, ErrorKind};
use crate::observability::Metrics;

/// Permission to run one transfer; released on drop
#[derive(Debug)]
pub struct WorkerSlot {
    _permit: OwnedSemaphorePermit,
}

pub struct DownloadManager {
    executor: Arc<dyn Executor>,
    slots: Arc<Semaphore>,
    max_parallel: usize,
    policy: RetryPolicy,
    delay: Arc<dyn Delay>,
    timeout: Duration,
    shutdown: CancellationToken,
    metrics: Arc<Metrics>,
}

impl DownloadManager {
    pub fn new(executor: Arc<dyn Executor>, config: &DownloadConfig) -> Self {
        let max_parallel = config.max_parallel_downloads.max(1);
        Self {
            executor,
            slots: Arc::new(Semaphore::new(max_parallel)),
            max_parallel,
            policy: RetryPolicy::from_config(config),
            delay: Arc::new(TokioDelay),
            timeout: config.timeout(),
            shutdown: CancellationToken::new(),
            metrics: Arc::new(Metrics::new()),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_delay(mut self, delay: Arc<dyn Delay>) -> Self {
        self.delay = delay;
        self
    }

    /// Stop starting new attempts once `token` fires. Transfers already
    /// running are left to finish or hit their deadline.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = metrics;
        self
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Wait for a free slot. `None` when shutdown fired first.
    pub async fn acquire_slot(&self) -> Option<WorkerSlot> {
        tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            permit = self.slots.clone().acquire_owned() => {
                // The semaphore is never closed
                permit.ok().map(|p| WorkerSlot { _permit: p })
            }
        }
    }

    /// Run one target to a terminal result, retrying up to the policy limit
    pub async fn run_one(&self, job_id: Uuid, target: &DownloadTarget) -> DownloadResult {
        if !target.enabled {
            info!(target_name = %target.name, "Target disabled, skipping");
            return DownloadResult::skipped(job_id, &target.name, "target disabled");
        }

        let started = Instant::now();
        let mut attempt: u32 = 1;
        let mut prior_error: Option<String> = None;

        loop {
            let result = {
                let Some(_slot) = self.acquire_slot().await else {
                    return DownloadResult::cancelled(job_id, &target.name, attempt - 1);
                };

                info!(
                    target_name = %target.name,
                    %job_id,
                    attempt,
                    max_attempts = self.policy.max_attempts,
                    prior_error = prior_error.as_deref().unwrap_or(""),
                    "Starting download attempt"
                );

                self.metrics.download_started();
                let result = self.executor.execute(job_id, target, self.timeout).await;
                self.metrics.download_finished();
                result
            };

            if result.is_success() {
                if attempt > 1 {
                    info!(target_name = %target.name, attempt, "Download succeeded after retry");
                }
                return finish(result, attempt, started);
            }

            let kind = result.error_kind.unwrap_or(ErrorKind::IoError);
            match self.policy.decide(attempt, kind) {
                RetryDecision::NoRetry => {
                    warn!(
                        target_name = %target.name,
                        attempt,
                        error_kind = %kind,
                        error = result.error.as_deref().unwrap_or(""),
                        "Download failed"
                    );
                    return finish(result, attempt, started);
                }
                RetryDecision::RetryAfter(backoff) => {
                    warn!(
                        target_name = %target.name,
                        attempt,
                        error_kind = %kind,
                        error = result.error.as_deref().unwrap_or(""),
                        ?backoff,
                        "Download attempt failed, retrying"
                    );
                    self.metrics.retry();

                    tokio::select! {
                        biased;
                        _ = self.shutdown.cancelled() => {
                            debug!(target_name = %target.name, "Shutdown during backoff");
                            return DownloadResult::cancelled(job_id, &target.name, attempt);
                        }
                        _ = self.delay.wait(backoff) => {}
                    }

                    prior_error = result.error;
                    attempt += 1;
                }
            }
        }
    }

    /// Results in completion order, as soon as each target is terminal
    pub fn run_stream(
        &self,
        jobs: Vec<(Uuid, DownloadTarget)>,
    ) -> impl Stream<Item = DownloadResult> + Send + '_ {
        self.indexed(jobs).map(|(_, result)| result)
    }

    /// Run every target and return results in input order
    pub async fn run_batch(&self, targets: Vec<DownloadTarget>) -> Vec<DownloadResult> {
        let jobs = targets.into_iter().map(|t| (Uuid::now_v7(), t)).collect();
        self.run_batch_with(jobs, |_| {}).await
    }

    /// Like [`run_batch`](Self::run_batch) but calls `on_result` as each
    /// target finishes
    pub async fn run_batch_with<F>(
        &self,
        jobs: Vec<(Uuid, DownloadTarget)>,
        mut on_result: F,
    ) -> Vec<DownloadResult>
    where
        F: FnMut(&DownloadResult) + Send,
    {
        let mut results: Vec<(usize, DownloadResult)> = Vec::with_capacity(jobs.len());
        let mut stream = std::pin::pin!(self.indexed(jobs));

        while let Some((index, result)) = stream.next().await {
            on_result(&result);
            results.push((index, result));
        }

        results.sort_by_key(|(index, _)| *index);
        results.into_iter().map(|(_, result)| result).collect()
    }

    fn indexed(
        &self,
        jobs: Vec<(Uuid, DownloadTarget)>,
    ) -> impl Stream<Item = (usize, DownloadResult)> + Send + '_ {
        // FuturesUnordered polls in push order, which keeps slot acquisition FIFO
        jobs.into_iter()
            .enumerate()
            .map(|(index, (job_id, target))| async move {
                (index, self.run_one(job_id, &target).await)
            })
            .collect::<FuturesUnordered<_>>()
    }
}

fn finish(mut result: DownloadResult, attempts: u32, started: Instant) -> DownloadResult {
    result.attempts = attempts;
    result.duration = started.elapsed();
    result
}

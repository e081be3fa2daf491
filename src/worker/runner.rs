//! Batch runner - executes one batch of deliveries and settles each message

use futures_util::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::OwnedSemaphorePermit;
use tracing::{info, warn};
use uuid::Uuid;

use crate::download::DownloadManager;
use crate::model::{DownloadResult, DownloadStatus, JobMessage};
use crate::observability::Metrics;
use crate::queue::QueueChannel;
use crate::status::StatusSink;

/// What happens to a message once its result is known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    /// Terminal outcome (success, exhausted failure, disabled); never redeliver
    Ack,
    /// Work was interrupted by shutdown; deliver again later
    Requeue,
}

pub fn settlement(result: &DownloadResult) -> Settlement {
    if result.is_cancelled() {
        Settlement::Requeue
    } else {
        Settlement::Ack
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub processed: AtomicU64,
    pub acked: AtomicU64,
    pub requeued: AtomicU64,
}

pub(crate) struct BatchContext {
    pub channel: Arc<dyn QueueChannel>,
    pub manager: Arc<DownloadManager>,
    pub status: Arc<dyn StatusSink>,
    pub metrics: Arc<Metrics>,
    pub counters: Counters,
}

/// Run a batch through the manager, settling each message as soon as its
/// own result arrives. `permits` are the intake slots the messages hold.
pub(crate) async fn process_batch(
    ctx: Arc<BatchContext>,
    batch: Vec<(JobMessage, OwnedSemaphorePermit)>,
) {
    let mut held: HashMap<Uuid, OwnedSemaphorePermit> = HashMap::with_capacity(batch.len());
    let mut jobs = Vec::with_capacity(batch.len());
    for (message, permit) in batch {
        info!(
            job_id = %message.job_id,
            target_name = %message.target.name,
            attempt = message.attempt,
            "Job received"
        );
        held.insert(message.job_id, permit);
        jobs.push((message.job_id, message.target));
    }

    let mut results = std::pin::pin!(ctx.manager.run_stream(jobs));
    while let Some(result) = results.next().await {
        settle(&ctx, &result).await;
        held.remove(&result.job_id);
    }
}

async fn settle(ctx: &BatchContext, result: &DownloadResult) {
    ctx.counters.processed.fetch_add(1, Ordering::Relaxed);

    if let Err(e) = ctx.status.record(result).await {
        warn!(target_name = %result.target_name, error = %e, "Failed to record status");
    }

    match result.status {
        DownloadStatus::Success => ctx.metrics.job_succeeded(result.bytes_transferred),
        DownloadStatus::Failed => ctx.metrics.job_failed(),
        DownloadStatus::Skipped if !result.is_cancelled() => ctx.metrics.job_skipped(),
        DownloadStatus::Skipped => {}
    }

    match settlement(result) {
        Settlement::Ack => match ctx.channel.ack(result.job_id).await {
            Ok(()) => {
                ctx.counters.acked.fetch_add(1, Ordering::Relaxed);
                info!(
                    job_id = %result.job_id,
                    target_name = %result.target_name,
                    status = %result.status,
                    bytes = result.bytes_transferred,
                    attempts = result.attempts,
                    "Job finished"
                );
            }
            // The broker still holds the message and will redeliver it
            Err(e) => warn!(job_id = %result.job_id, error = %e, "Ack failed"),
        },
        Settlement::Requeue => match ctx.channel.nack(result.job_id, true).await {
            Ok(()) => {
                ctx.counters.requeued.fetch_add(1, Ordering::Relaxed);
                ctx.metrics.job_requeued();
                info!(job_id = %result.job_id, target_name = %result.target_name, "Job requeued for later");
            }
            Err(e) => warn!(job_id = %result.job_id, error = %e, "Requeue failed"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ErrorKind;
    use std::time::Duration;

    #[test]
    fn test_terminal_results_are_acked() {
        let id = Uuid::now_v7();
        assert_eq!(
            settlement(&DownloadResult::success(id, "a", 1, Duration::ZERO)),
            Settlement::Ack
        );
        assert_eq!(
            settlement(&DownloadResult::failed(id, "a", ErrorKind::Timeout, "slow", Duration::ZERO)),
            Settlement::Ack
        );
        assert_eq!(
            settlement(&DownloadResult::skipped(id, "a", "target disabled")),
            Settlement::Ack
        );
    }

    #[test]
    fn test_cancelled_results_are_requeued() {
        let result = DownloadResult::cancelled(Uuid::now_v7(), "a", 1);
        assert_eq!(settlement(&result), Settlement::Requeue);
    }
}

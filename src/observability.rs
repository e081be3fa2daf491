//! Metrics counters and tracing setup

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::EnvFilter;

/// Install the global fmt subscriber. `RUST_LOG` wins when set; otherwise
/// `debug` raises this crate to debug level.
pub fn init_tracing(debug: bool) {
    let default = if debug {
        "isofetch=debug,info"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// Metrics handle for recording counters/gauges
#[derive(Debug, Default)]
pub struct Metrics {
    jobs_published: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_skipped: AtomicU64,
    jobs_requeued: AtomicU64,
    retries: AtomicU64,
    bytes_downloaded: AtomicU64,
    active_downloads: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn job_published(&self) {
        self.jobs_published.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "jobs_published", "Metric incremented");
    }

    pub fn job_succeeded(&self, bytes: u64) {
        self.jobs_succeeded.fetch_add(1, Ordering::Relaxed);
        self.bytes_downloaded.fetch_add(bytes, Ordering::Relaxed);
        tracing::debug!(counter = "jobs_succeeded", "Metric incremented");
    }

    pub fn job_failed(&self) {
        self.jobs_failed.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "jobs_failed", "Metric incremented");
    }

    pub fn job_skipped(&self) {
        self.jobs_skipped.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "jobs_skipped", "Metric incremented");
    }

    pub fn job_requeued(&self) {
        self.jobs_requeued.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(counter = "jobs_requeued", "Metric incremented");
    }

    pub fn retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn download_started(&self) {
        self.active_downloads.fetch_add(1, Ordering::Relaxed);
    }

    pub fn download_finished(&self) {
        self.active_downloads.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_published: self.jobs_published.load(Ordering::Relaxed),
            jobs_succeeded: self.jobs_succeeded.load(Ordering::Relaxed),
            jobs_failed: self.jobs_failed.load(Ordering::Relaxed),
            jobs_skipped: self.jobs_skipped.load(Ordering::Relaxed),
            jobs_requeued: self.jobs_requeued.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            bytes_downloaded: self.bytes_downloaded.load(Ordering::Relaxed),
            active_downloads: self.active_downloads.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub jobs_published: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub jobs_skipped: u64,
    pub jobs_requeued: u64,
    pub retries: u64,
    pub bytes_downloaded: u64,
    pub active_downloads: u64,
}

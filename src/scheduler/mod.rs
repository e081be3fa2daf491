//! Periodic publishing of download jobs
//!
//! The [`Scheduler`] sleeps until the next [`Cadence`] fire time, then asks
//! its [`JobPublisher`] to enqueue one job per enabled target. A
//! [`SchedulerHandle`] triggers an extra pass on demand without moving the
//! next scheduled fire time.
//!
//! A scheduled pass that fails keeps its fire time and is retried with a
//! doubling backoff until it publishes; only then does the cadence advance.

mod cadence;
mod publisher;

pub use cadence::Cadence;
pub use publisher::{ConfigFileSource, JobPublisher, PublishReport, StaticSource, TargetSource};

use chrono::{DateTime, Local};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ConfigError;
use crate::queue::QueueError;

/// Upper bound on one sleep, so clock changes are noticed
const MAX_SLEEP: Duration = Duration::from_secs(60);

const RETRY_BASE: Duration = Duration::from_secs(5);
const RETRY_MAX: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Failed to load targets: {0}")]
    Source(String),

    #[error("Scheduler is not running")]
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Waiting { next_fire: DateTime<Local> },
    Firing,
}

enum SchedulerCommand {
    Trigger {
        response: oneshot::Sender<Result<PublishReport, SchedulerError>>,
    },
}

/// Cheap handle for triggering and observing a running scheduler
#[derive(Clone)]
pub struct SchedulerHandle {
    commands: mpsc::Sender<SchedulerCommand>,
    state: watch::Receiver<SchedulerState>,
}

impl SchedulerHandle {
    /// Publish now, outside the cadence
    pub async fn trigger(&self) -> Result<PublishReport, SchedulerError> {
        let (response, rx) = oneshot::channel();
        self.commands
            .send(SchedulerCommand::Trigger { response })
            .await
            .map_err(|_| SchedulerError::Stopped)?;
        rx.await.map_err(|_| SchedulerError::Stopped)?
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    pub fn next_fire(&self) -> Option<DateTime<Local>> {
        match self.state() {
            SchedulerState::Waiting { next_fire } => Some(next_fire),
            _ => None,
        }
    }
}

pub struct Scheduler {
    cadence: Cadence,
    publisher: Arc<JobPublisher>,
    commands: mpsc::Receiver<SchedulerCommand>,
    state: watch::Sender<SchedulerState>,
    retry_base: Duration,
    retry_max: Duration,
}

/// A scheduled pass that has not published yet
#[derive(Debug, Clone, Copy)]
struct PendingRetry {
    at: Instant,
    backoff: Duration,
}

impl Scheduler {
    pub fn new(cadence: Cadence, publisher: Arc<JobPublisher>) -> (Self, SchedulerHandle) {
        let (command_tx, command_rx) = mpsc::channel(8);
        let (state_tx, state_rx) = watch::channel(SchedulerState::Idle);

        let scheduler = Self {
            cadence,
            publisher,
            commands: command_rx,
            state: state_tx,
            retry_base: RETRY_BASE,
            retry_max: RETRY_MAX,
        };
        let handle = SchedulerHandle {
            commands: command_tx,
            state: state_rx,
        };
        (scheduler, handle)
    }

    /// Backoff between retries of a failed scheduled pass
    pub fn with_retry_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_base = base;
        self.retry_max = max.max(base);
        self
    }

    /// Main scheduler loop; returns once `shutdown` fires
    pub async fn run(mut self, shutdown: CancellationToken) {
        let mut next_fire = self.cadence.next_after(&Local::now());
        let mut retry: Option<PendingRetry> = None;
        info!(frequency = ?self.cadence.frequency, %next_fire, "Scheduler started");

        loop {
            self.state.send_replace(SchedulerState::Waiting { next_fire });

            let until = match retry {
                Some(pending) => pending.at.saturating_duration_since(Instant::now()),
                None => (next_fire - Local::now()).to_std().unwrap_or(Duration::ZERO),
            }
            .min(MAX_SLEEP);
            debug!(?until, %next_fire, retrying = retry.is_some(), "Scheduler sleeping");

            tokio::select! {
                _ = tokio::time::sleep(until) => {
                    let due = match retry {
                        Some(pending) => Instant::now() >= pending.at,
                        None => Local::now() >= next_fire,
                    };
                    if !due {
                        continue;
                    }

                    match self.fire("schedule").await {
                        Ok(_) => {
                            retry = None;
                            next_fire = self.cadence.next_after(&Local::now().max(next_fire));
                            info!(%next_fire, "Next publish scheduled");
                        }
                        Err(_) => {
                            let backoff = match retry {
                                Some(pending) => (pending.backoff * 2).min(self.retry_max),
                                None => self.retry_base,
                            };
                            warn!(?backoff, %next_fire, "Scheduled publish will be retried");
                            retry = Some(PendingRetry {
                                at: Instant::now() + backoff,
                                backoff,
                            });
                        }
                    }
                }
                Some(cmd) = self.commands.recv() => {
                    match cmd {
                        SchedulerCommand::Trigger { response } => {
                            let result = self.fire("manual").await;
                            let _ = response.send(result);
                        }
                    }
                }
                _ = shutdown.cancelled() => {
                    info!("Scheduler received shutdown signal");
                    break;
                }
            }
        }

        self.state.send_replace(SchedulerState::Idle);
        info!("Scheduler stopped");
    }

    async fn fire(&self, reason: &'static str) -> Result<PublishReport, SchedulerError> {
        self.state.send_replace(SchedulerState::Firing);
        info!(reason, "Publishing download jobs");

        let result = self.publisher.publish_enabled().await;
        if let Err(e) = &result {
            error!(reason, error = %e, "Publish pass failed");
        }
        result
    }
}

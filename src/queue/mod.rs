//! Durable job delivery between the scheduler and workers
//!
//! [`QueueChannel`] is the seam: the scheduler publishes [`JobMessage`]s, the
//! worker consumes them and acknowledges each one once its outcome is known.
//! Two backends implement it:
//!
//! - [`AmqpChannel`] - RabbitMQ via lapin, shared by separate processes
//! - [`FjallChannel`] - embedded Fjall keyspace owned by a single process
//!
//! Delivery is at-least-once. A message that is consumed but never
//! acknowledged comes back with `attempt` incremented; past the delivery
//! limit it lands in the dead-letter queue instead.

pub mod amqp;
pub mod embedded;
pub mod message;

pub use amqp::{AmqpChannel, AmqpSettings};
pub use embedded::FjallChannel;
pub use message::{DeadLetter, WireError};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{Config, QueueBackend};
use crate::model::JobMessage;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    #[error("Fjall error: {0}")]
    Fjall(#[from] fjall::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("No unacknowledged delivery for job {0}")]
    UnknownDelivery(Uuid),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl QueueError {
    /// Connectivity failures worth a reconnect and retry
    pub fn is_unavailable(&self) -> bool {
        matches!(self, QueueError::Unavailable(_))
    }
}

impl From<lapin::Error> for QueueError {
    fn from(e: lapin::Error) -> Self {
        QueueError::Unavailable(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Lazy stream of deliveries; ends when the connection goes away
pub type Deliveries = BoxStream<'static, Result<JobMessage>>;

/// Queue depth as far as the backend can tell
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub ready: u64,
    pub unacked: Option<u64>,
    pub dead_lettered: Option<u64>,
    pub consumers: Option<u32>,
}

#[async_trait]
pub trait QueueChannel: Send + Sync {
    /// Durably enqueue one message
    async fn publish(&self, message: &JobMessage) -> Result<()>;

    /// Enqueue several messages; returns how many were published before any error
    async fn publish_all(&self, messages: &[JobMessage]) -> Result<usize> {
        for message in messages {
            self.publish(message).await?;
        }
        Ok(messages.len())
    }

    /// Start consuming. Each call opens a fresh subscription, so a worker
    /// can resubscribe after the previous stream ended.
    async fn consume(&self) -> Result<Deliveries>;

    /// The job is finished; it will never be delivered again
    async fn ack(&self, job_id: Uuid) -> Result<()>;

    /// Give the job back. `requeue = false` dead-letters it.
    async fn nack(&self, job_id: Uuid, requeue: bool) -> Result<()>;

    async fn stats(&self) -> Result<QueueStats>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Open the configured backend, retrying broker connections
/// `queue.connect_retries` times before giving up
pub async fn open_channel(config: &Config) -> Result<Arc<dyn QueueChannel>> {
    match config.queue.backend {
        QueueBackend::Embedded => {
            let channel = FjallChannel::open(
                &config.queue.path,
                config.queue.max_deliveries,
                config.queue.persistent,
            )?;
            Ok(Arc::new(channel))
        }
        QueueBackend::Amqp => {
            let channel = AmqpChannel::new(AmqpSettings::from_config(config));
            connect_with_retry(&channel, config.queue.connect_retries, config.queue.reconnect_delay())
                .await?;
            Ok(Arc::new(channel))
        }
    }
}

async fn connect_with_retry(channel: &AmqpChannel, retries: u32, delay: Duration) -> Result<()> {
    let attempts = retries.max(1);
    let mut attempt = 1;

    loop {
        match channel.connect().await {
            Ok(()) => {
                info!(attempt, "Connected to broker");
                return Ok(());
            }
            Err(e) if attempt < attempts => {
                warn!(attempt, max_attempts = attempts, error = %e, ?delay, "Broker connection failed, retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                warn!(attempt, error = %e, "Broker connection failed, giving up");
                return Err(e);
            }
        }
    }
}

//! Records shared by the scheduler, queue channel, and download subsystems
//!
//! - [`DownloadTarget`] - one configured image to mirror
//! - [`JobMessage`] - the queue payload carrying a target snapshot
//! - [`DownloadResult`] - terminal outcome of one job
//! - [`ErrorKind`] - closed error taxonomy shared by every layer

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Transfer mechanism for a target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    Rsync,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Http => f.write_str("http"),
            Protocol::Rsync => f.write_str("rsync"),
        }
    }
}

/// A resolved download target. `destination_path` is already joined with the
/// download directory by the time a target leaves the config layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadTarget {
    pub name: String,
    pub url: String,
    pub protocol: Protocol,
    pub destination_path: PathBuf,
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

/// Queue payload. `attempt` is 1 for a fresh publish and grows with every
/// redelivery or requeue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobMessage {
    pub job_id: Uuid,
    pub target: DownloadTarget,
    pub enqueued_at: DateTime<Utc>,
    pub attempt: u32,
}

impl JobMessage {
    pub fn new(target: DownloadTarget) -> Self {
        Self {
            job_id: Uuid::now_v7(),
            target,
            enqueued_at: Utc::now(),
            attempt: 1,
        }
    }

    /// Copy of this message as it looks on its next delivery
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..self.clone()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Success,
    Failed,
    Skipped,
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownloadStatus::Success => f.write_str("success"),
            DownloadStatus::Failed => f.write_str("failed"),
            DownloadStatus::Skipped => f.write_str("skipped"),
        }
    }
}

/// Error taxonomy shared by executors, the manager, and the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Connection, DNS, or HTTP status failure
    NetworkError,
    /// Transfer deadline exceeded
    Timeout,
    /// Downloaded content does not match the expected digest
    ChecksumMismatch,
    /// rsync exited nonzero or could not be spawned
    ProcessError,
    /// Invalid target; never retried
    ConfigError,
    /// Broker connection lost
    QueueUnavailable,
    /// Local filesystem failure
    IoError,
    /// Shutdown interrupted the work
    Cancelled,
}

impl ErrorKind {
    /// Whether the Download Manager should try the transfer again
    pub fn is_retryable(self) -> bool {
        match self {
            ErrorKind::NetworkError
            | ErrorKind::Timeout
            | ErrorKind::ChecksumMismatch
            | ErrorKind::ProcessError
            | ErrorKind::IoError => true,
            ErrorKind::ConfigError | ErrorKind::QueueUnavailable | ErrorKind::Cancelled => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::NetworkError => "network_error",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ChecksumMismatch => "checksum_mismatch",
            ErrorKind::ProcessError => "process_error",
            ErrorKind::ConfigError => "config_error",
            ErrorKind::QueueUnavailable => "queue_unavailable",
            ErrorKind::IoError => "io_error",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one job, produced once per executed (or skipped) message
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadResult {
    pub job_id: Uuid,
    pub target_name: String,
    pub status: DownloadStatus,
    pub bytes_transferred: u64,
    pub duration: Duration,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    /// Executor invocations spent on this result
    pub attempts: u32,
}

impl DownloadResult {
    pub fn success(job_id: Uuid, target_name: &str, bytes: u64, duration: Duration) -> Self {
        Self {
            job_id,
            target_name: target_name.to_string(),
            status: DownloadStatus::Success,
            bytes_transferred: bytes,
            duration,
            error: None,
            error_kind: None,
            attempts: 1,
        }
    }

    pub fn failed(
        job_id: Uuid,
        target_name: &str,
        kind: ErrorKind,
        error: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            job_id,
            target_name: target_name.to_string(),
            status: DownloadStatus::Failed,
            bytes_transferred: 0,
            duration,
            error: Some(error.into()),
            error_kind: Some(kind),
            attempts: 1,
        }
    }

    pub fn skipped(job_id: Uuid, target_name: &str, reason: impl Into<String>) -> Self {
        Self {
            job_id,
            target_name: target_name.to_string(),
            status: DownloadStatus::Skipped,
            bytes_transferred: 0,
            duration: Duration::ZERO,
            error: Some(reason.into()),
            error_kind: None,
            attempts: 0,
        }
    }

    /// Work abandoned because of shutdown; the message goes back to the queue
    pub fn cancelled(job_id: Uuid, target_name: &str, attempts: u32) -> Self {
        Self {
            job_id,
            target_name: target_name.to_string(),
            status: DownloadStatus::Skipped,
            bytes_transferred: 0,
            duration: Duration::ZERO,
            error: Some("shutdown in progress".to_string()),
            error_kind: Some(ErrorKind::Cancelled),
            attempts,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.error_kind == Some(ErrorKind::Cancelled)
    }

    pub fn is_success(&self) -> bool {
        self.status == DownloadStatus::Success
    }

    /// True when the failure is worth another executor invocation
    pub fn is_retryable_failure(&self) -> bool {
        self.status == DownloadStatus::Failed
            && self.error_kind.is_some_and(ErrorKind::is_retryable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target() -> DownloadTarget {
        DownloadTarget {
            name: "Debian 12".to_string(),
            url: "https://cdimage.example/debian-12.iso".to_string(),
            protocol: Protocol::Http,
            destination_path: PathBuf::from("/srv/isos/debian-12.iso"),
            enabled: true,
            checksum: None,
        }
    }

    #[test]
    fn test_new_message_starts_at_first_attempt() {
        let msg = JobMessage::new(target());
        assert_eq!(msg.attempt, 1);

        let next = msg.next_attempt();
        assert_eq!(next.attempt, 2);
        assert_eq!(next.job_id, msg.job_id);
        assert_eq!(next.target, msg.target);
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(ErrorKind::NetworkError.is_retryable());
        assert!(ErrorKind::ChecksumMismatch.is_retryable());
        assert!(!ErrorKind::ConfigError.is_retryable());
        assert!(!ErrorKind::Cancelled.is_retryable());
    }

    #[test]
    fn test_error_kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::ChecksumMismatch).unwrap();
        assert_eq!(json, "\"checksum_mismatch\"");
        assert_eq!(ErrorKind::QueueUnavailable.to_string(), "queue_unavailable");
    }

    #[test]
    fn test_result_retryability() {
        let id = Uuid::now_v7();
        let timeout = DownloadResult::failed(id, "a", ErrorKind::Timeout, "slow", Duration::ZERO);
        assert!(timeout.is_retryable_failure());

        let config = DownloadResult::failed(id, "a", ErrorKind::ConfigError, "bad", Duration::ZERO);
        assert!(!config.is_retryable_failure());

        let ok = DownloadResult::success(id, "a", 10, Duration::ZERO);
        assert!(!ok.is_retryable_failure());
        assert!(ok.is_success());
    }
}

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;
use uuid::Uuid;

use super::error::TransferError;
use super::http::{HttpSettings, HttpTransfer};
use super::progress::{LogProgress, ProgressSink};
use super::rsync::RsyncTransfer;
use crate::config::{DownloadConfig, check_target_url};
use crate::model::{DownloadResult, DownloadTarget, ErrorKind, Protocol};

/// Performs a single transfer attempt. Retries live in the manager.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, job_id: Uuid, target: &DownloadTarget, timeout: Duration) -> DownloadResult;
}

/// Dispatches on the target protocol under a hard deadline
pub struct DownloadExecutor {
    http: HttpTransfer,
    rsync: RsyncTransfer,
    progress: Arc<dyn ProgressSink>,
}

impl DownloadExecutor {
    pub fn new(http: HttpTransfer, rsync: RsyncTransfer) -> Self {
        Self {
            http,
            rsync,
            progress: Arc::new(LogProgress::new()),
        }
    }

    pub fn from_config(config: &DownloadConfig) -> Result<Self, TransferError> {
        let http = HttpTransfer::new(&HttpSettings::from_config(config))?;
        Ok(Self::new(http, RsyncTransfer::new()))
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    async fn transfer(&self, target: &DownloadTarget, timeout: Duration) -> Result<u64, TransferError> {
        check_target_url(target.protocol, &target.url).map_err(TransferError::InvalidTarget)?;

        match target.protocol {
            Protocol::Http => self.http.fetch(target, self.progress.as_ref()).await,
            Protocol::Rsync => self.rsync.fetch(target, timeout).await,
        }
    }
}

#[async_trait]
impl Executor for DownloadExecutor {
    async fn execute(&self, job_id: Uuid, target: &DownloadTarget, timeout: Duration) -> DownloadResult {
        let started = Instant::now();

        let outcome = match tokio::time::timeout(timeout, self.transfer(target, timeout)).await {
            Ok(result) => result,
            Err(_) => Err(TransferError::Timeout(timeout)),
        };

        match outcome {
            Ok(bytes) => DownloadResult::success(job_id, &target.name, bytes, started.elapsed()),
            Err(e) => {
                let kind = e.kind();
                if kind == ErrorKind::Timeout {
                    // The staging file is removed when the transfer future drops
                    warn!(target_name = %target.name, ?timeout, "Transfer deadline exceeded");
                }
                DownloadResult::failed(job_id, &target.name, kind, e.to_string(), started.elapsed())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::progress::NoProgress;
    use crate::model::DownloadStatus;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn executor() -> DownloadExecutor {
        DownloadExecutor::from_config(&DownloadConfig::default())
            .unwrap()
            .with_progress(Arc::new(NoProgress))
    }

    fn target(url: String, dest: PathBuf, protocol: Protocol) -> DownloadTarget {
        DownloadTarget {
            name: "target".to_string(),
            url,
            protocol,
            destination_path: dest,
            enabled: true,
            checksum: None,
        }
    }

    #[tokio::test]
    async fn test_slow_server_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(vec![0u8; 16])
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let t = target(
            format!("{}/slow.iso", server.uri()),
            dir.path().join("slow.iso"),
            Protocol::Http,
        );

        let result = executor()
            .execute(Uuid::now_v7(), &t, Duration::from_millis(200))
            .await;
        assert_eq!(result.status, DownloadStatus::Failed);
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
        assert!(!t.destination_path.exists());
    }

    #[tokio::test]
    async fn test_mismatched_protocol_is_config_error() {
        let dir = TempDir::new().unwrap();
        let t = target(
            "https://example.test/a.iso".to_string(),
            dir.path().join("a.iso"),
            Protocol::Rsync,
        );

        let result = executor().execute(Uuid::now_v7(), &t, Duration::from_secs(1)).await;
        assert_eq!(result.error_kind, Some(ErrorKind::ConfigError));
        assert!(!result.is_retryable_failure());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_network_error() {
        let dir = TempDir::new().unwrap();
        // Port 9 (discard) on localhost is closed in test environments
        let t = target(
            "http://127.0.0.1:9/a.iso".to_string(),
            dir.path().join("a.iso"),
            Protocol::Http,
        );

        let result = executor().execute(Uuid::now_v7(), &t, Duration::from_secs(5)).await;
        assert_eq!(result.error_kind, Some(ErrorKind::NetworkError));
    }
}

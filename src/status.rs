//! Last terminal outcome per target
//!
//! Each target gets one JSON file under the status directory, replaced
//! atomically on every success or failure. Readers (the `status` command, the
//! HTTP endpoint) never see a half-written record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::model::{DownloadResult, DownloadStatus, ErrorKind};

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("Status I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Status record encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StatusError>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub target_name: String,
    pub job_id: Uuid,
    pub status: DownloadStatus,
    pub bytes_transferred: u64,
    pub duration_ms: u64,
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

impl From<&DownloadResult> for StatusRecord {
    fn from(result: &DownloadResult) -> Self {
        Self {
            target_name: result.target_name.clone(),
            job_id: result.job_id,
            status: result.status,
            bytes_transferred: result.bytes_transferred,
            duration_ms: u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
            attempts: result.attempts,
            error_kind: result.error_kind,
            error: result.error.clone(),
            finished_at: Utc::now(),
        }
    }
}

impl StatusRecord {
    /// Outcome as shown by the `status` command, e.g.
    /// `failed [network_error] (HTTP 503: Service Unavailable)`
    pub fn outcome(&self) -> String {
        let mut line = self.status.to_string();
        if let Some(kind) = self.error_kind {
            line.push_str(&format!(" [{kind}]"));
        }
        if let Some(error) = &self.error {
            line.push_str(&format!(" ({error})"));
        }
        line
    }
}

/// Where the worker reports results
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn record(&self, result: &DownloadResult) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileStatusStore {
    dir: PathBuf,
}

impl FileStatusStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<sanitized name>-<hash prefix>.json`, unique even when two names
    /// sanitize to the same string
    fn path_for(&self, target_name: &str) -> PathBuf {
        let slug: String = target_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
            .collect();
        let digest = hex::encode(Sha256::digest(target_name.as_bytes()));
        self.dir.join(format!("{slug}-{}.json", &digest[..8]))
    }

    pub async fn put(&self, record: &StatusRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir).await?;

        let path = self.path_for(&record.target_name);
        let tmp = self.dir.join(format!(".{}.tmp", Uuid::new_v4()));
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(record)?).await?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!(target_name = %record.target_name, status = %record.status, "Status recorded");
        Ok(())
    }

    pub async fn get(&self, target_name: &str) -> Result<Option<StatusRecord>> {
        match tokio::fs::read(self.path_for(target_name)).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Every record, sorted by target name
    pub async fn list(&self) -> Result<Vec<StatusRecord>> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let bytes = tokio::fs::read(&path).await?;
            match serde_json::from_slice::<StatusRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "Ignoring unreadable status record"),
            }
        }

        records.sort_by(|a, b| a.target_name.cmp(&b.target_name));
        Ok(records)
    }
}

#[async_trait]
impl StatusSink for FileStatusStore {
    /// Only terminal outcomes are kept; skips leave the previous record
    async fn record(&self, result: &DownloadResult) -> Result<()> {
        match result.status {
            DownloadStatus::Success | DownloadStatus::Failed => self.put(&result.into()).await,
            DownloadStatus::Skipped => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_latest_outcome_wins() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStatusStore::new(temp_dir.path().join("status"));

        let failed = DownloadResult::failed(
            Uuid::now_v7(),
            "Ubuntu 24.04 LTS",
            ErrorKind::Timeout,
            "deadline exceeded",
            Duration::from_secs(3600),
        );
        store.record(&failed).await.unwrap();

        let ok = DownloadResult::success(Uuid::now_v7(), "Ubuntu 24.04 LTS", 4096, Duration::from_millis(1500));
        store.record(&ok).await.unwrap();

        let record = store.get("Ubuntu 24.04 LTS").await.unwrap().unwrap();
        assert_eq!(record.status, DownloadStatus::Success);
        assert_eq!(record.bytes_transferred, 4096);
        assert_eq!(record.duration_ms, 1500);
        assert_eq!(record.error_kind, None);
    }

    #[tokio::test]
    async fn test_skips_do_not_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStatusStore::new(temp_dir.path());

        let ok = DownloadResult::success(Uuid::now_v7(), "Debian", 1, Duration::ZERO);
        store.record(&ok).await.unwrap();
        store
            .record(&DownloadResult::cancelled(Uuid::now_v7(), "Debian", 0))
            .await
            .unwrap();

        let record = store.get("Debian").await.unwrap().unwrap();
        assert_eq!(record.status, DownloadStatus::Success);
    }

    #[tokio::test]
    async fn test_list_sorted_and_distinct() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStatusStore::new(temp_dir.path());

        for name in ["b/c", "b_c", "a"] {
            let r = DownloadResult::success(Uuid::now_v7(), name, 1, Duration::ZERO);
            store.record(&r).await.unwrap();
        }

        let names: Vec<_> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.target_name)
            .collect();
        assert_eq!(names, vec!["a", "b/c", "b_c"]);
    }

    #[tokio::test]
    async fn test_missing_dir_lists_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStatusStore::new(temp_dir.path().join("nope"));
        assert!(store.list().await.unwrap().is_empty());
        assert!(store.get("x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_outcome_names_the_error_kind() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileStatusStore::new(temp_dir.path());

        store
            .record(&DownloadResult::failed(
                Uuid::now_v7(),
                "Debian 12",
                ErrorKind::NetworkError,
                "HTTP 503: Service Unavailable",
                Duration::from_secs(2),
            ))
            .await
            .unwrap();
        store
            .record(&DownloadResult::success(Uuid::now_v7(), "Ubuntu", 4096, Duration::ZERO))
            .await
            .unwrap();

        let failed = store.get("Debian 12").await.unwrap().unwrap();
        assert_eq!(
            failed.outcome(),
            "failed [network_error] (HTTP 503: Service Unavailable)"
        );
        let ok = store.get("Ubuntu").await.unwrap().unwrap();
        assert_eq!(ok.outcome(), "success");
    }
}

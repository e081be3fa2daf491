//! HTTP(S) transfers streamed to disk in fixed-size chunks

use bytes::BytesMut;
use chrono::Utc;
use futures_util::StreamExt;
use reqwest::Client;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use super::checksum::{self, CompletionRecord};
use super::error::{Result, TransferError};
use super::progress::{Progress, ProgressSink};
use crate::config::{DownloadConfig, parse_sha256};
use crate::humanize::ByteSize;
use crate::model::DownloadTarget;

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct HttpSettings {
    pub connect_timeout: Duration,
    pub chunk_size: usize,
    pub user_agent: String,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self::from_config(&DownloadConfig::default())
    }
}

impl HttpSettings {
    pub fn from_config(config: &DownloadConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            chunk_size: config.chunk_size.as_usize().max(1),
            user_agent: config.user_agent.clone(),
        }
    }
}

/// Removes the staging file unless the transfer completed
struct PartFile {
    path: PathBuf,
    keep: bool,
}

impl PartFile {
    fn new(path: PathBuf) -> Self {
        Self { path, keep: false }
    }

    fn disarm(mut self) {
        self.keep = true;
    }
}

impl Drop for PartFile {
    fn drop(&mut self) {
        if !self.keep {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

pub struct HttpTransfer {
    client: Client,
    chunk_size: usize,
}

impl HttpTransfer {
    pub fn new(settings: &HttpSettings) -> Result<Self> {
        // The job deadline is enforced by the executor, so no overall
        // request timeout here.
        let client = Client::builder()
            .connect_timeout(settings.connect_timeout)
            .user_agent(&settings.user_agent)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| TransferError::RequestFailed(e.to_string()))?;

        Ok(Self {
            client,
            chunk_size: settings.chunk_size.max(1),
        })
    }

    /// Download `target` to its destination. Returns bytes received over the
    /// network, which is 0 when a verified copy already exists.
    pub async fn fetch(&self, target: &DownloadTarget, progress: &dyn ProgressSink) -> Result<u64> {
        let dest = &target.destination_path;

        if checksum::is_complete(target).await? {
            info!(target_name = %target.name, path = %dest.display(), "Destination already complete, skipping transfer");
            return Ok(0);
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let response = self.client.get(&target.url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::HttpStatus {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or("unknown").to_string(),
            });
        }

        let total = response.content_length();
        debug!(target_name = %target.name, total = ?total, "Response headers received");

        let part_path = checksum::part_path(dest);
        let part = PartFile::new(part_path.clone());
        let mut file = File::create(&part_path).await?;
        let mut hasher = Sha256::new();
        let mut buffer = BytesMut::with_capacity(self.chunk_size);
        let mut written: u64 = 0;

        let mut stream = response.bytes_stream();
        while let Some(piece) = stream.next().await {
            let piece = piece?;
            let mut rest = &piece[..];

            while !rest.is_empty() {
                let room = self.chunk_size - buffer.len();
                let take = room.min(rest.len());
                buffer.extend_from_slice(&rest[..take]);
                rest = &rest[take..];

                if buffer.len() == self.chunk_size {
                    written += self.write_chunk(&mut file, &mut hasher, &mut buffer).await?;
                    progress.on_progress(&target.name, Progress { bytes_so_far: written, total });
                }
            }
        }

        if !buffer.is_empty() {
            written += self.write_chunk(&mut file, &mut hasher, &mut buffer).await?;
            progress.on_progress(&target.name, Progress { bytes_so_far: written, total });
        }

        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        if let Some(expected) = total {
            if written != expected {
                return Err(TransferError::ShortBody {
                    expected,
                    received: written,
                });
            }
        }

        let actual = hex::encode(hasher.finalize());
        if let Some(expected) = target.checksum.as_deref().and_then(parse_sha256) {
            if expected != actual {
                // Dropping `part` removes the staging file; dest is untouched
                warn!(target_name = %target.name, %expected, %actual, "Checksum mismatch, discarding download");
                return Err(TransferError::ChecksumMismatch { expected, actual });
            }
        }

        tokio::fs::rename(&part_path, dest).await?;
        part.disarm();

        checksum::write_record(
            dest,
            &CompletionRecord {
                size: written,
                sha256: actual,
                url: target.url.clone(),
                completed_at: Utc::now(),
            },
        )
        .await?;

        info!(
            target_name = %target.name,
            size = %ByteSize(written),
            path = %dest.display(),
            "Download complete"
        );
        Ok(written)
    }

    async fn write_chunk(
        &self,
        file: &mut File,
        hasher: &mut Sha256,
        buffer: &mut BytesMut,
    ) -> Result<u64> {
        let chunk = buffer.split().freeze();
        file.write_all(&chunk).await?;
        hasher.update(&chunk);
        Ok(chunk.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::progress::NoProgress;
    use crate::model::Protocol;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn target(server: &MockServer, dir: &Path) -> DownloadTarget {
        DownloadTarget {
            name: "Ubuntu 24.04 LTS".to_string(),
            url: format!("{}/ubuntu.iso", server.uri()),
            protocol: Protocol::Http,
            destination_path: dir.join("ubuntu.iso"),
            enabled: true,
            checksum: None,
        }
    }

    fn transfer(chunk_size: usize) -> HttpTransfer {
        HttpTransfer::new(&HttpSettings {
            chunk_size,
            ..HttpSettings::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_downloads_in_chunks_and_reports_progress() {
        let server = MockServer::start().await;
        let body = vec![7u8; 10_000];
        Mock::given(method("GET"))
            .and(path("/ubuntu.iso"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let t = target(&server, dir.path());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = {
            let seen = seen.clone();
            move |_: &str, p: Progress| seen.lock().unwrap().push(p.bytes_so_far)
        };

        let bytes = transfer(4096).fetch(&t, &sink).await.unwrap();
        assert_eq!(bytes, 10_000);
        assert_eq!(std::fs::read(&t.destination_path).unwrap(), body);
        assert_eq!(*seen.lock().unwrap(), vec![4096, 8192, 10_000]);
        assert!(!checksum::part_path(&t.destination_path).exists());

        let record = checksum::read_record(&t.destination_path).await.unwrap();
        assert_eq!(record.size, 10_000);
    }

    #[tokio::test]
    async fn test_http_error_status_is_network_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let t = target(&server, dir.path());
        let err = transfer(1024).fetch(&t, &NoProgress).await.unwrap_err();

        assert!(matches!(err, TransferError::HttpStatus { status: 503, .. }));
        assert_eq!(err.kind(), crate::model::ErrorKind::NetworkError);
        assert!(!t.destination_path.exists());
    }

    #[tokio::test]
    async fn test_checksum_mismatch_leaves_no_artifact() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"corrupted".to_vec()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let mut t = target(&server, dir.path());
        t.checksum = Some(format!("sha256:{}", "a".repeat(64)));

        let err = transfer(4).fetch(&t, &NoProgress).await.unwrap_err();
        assert!(matches!(err, TransferError::ChecksumMismatch { .. }));
        assert!(!t.destination_path.exists());
        assert!(!checksum::part_path(&t.destination_path).exists());
    }

    #[tokio::test]
    async fn test_checksum_mismatch_keeps_previous_copy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"corrupted".to_vec()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let mut t = target(&server, dir.path());
        std::fs::write(&t.destination_path, b"hello\n").unwrap();
        let previous = CompletionRecord {
            size: 6,
            sha256: "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03".to_string(),
            url: t.url.clone(),
            completed_at: Utc::now(),
        };
        checksum::write_record(&t.destination_path, &previous).await.unwrap();

        // Published digest changed, the mirror serves something else again
        t.checksum = Some(format!("sha256:{}", "a".repeat(64)));
        let err = transfer(4).fetch(&t, &NoProgress).await.unwrap_err();

        assert!(matches!(err, TransferError::ChecksumMismatch { .. }));
        assert_eq!(std::fs::read(&t.destination_path).unwrap(), b"hello\n");
        let record = checksum::read_record(&t.destination_path).await.unwrap();
        assert_eq!(record.sha256, previous.sha256);
        assert!(!checksum::part_path(&t.destination_path).exists());
    }

    #[tokio::test]
    async fn test_matching_checksum_is_accepted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello\n".to_vec()))
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let mut t = target(&server, dir.path());
        t.checksum = Some(
            "sha256:5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03".to_string(),
        );

        let bytes = transfer(64).fetch(&t, &NoProgress).await.unwrap();
        assert_eq!(bytes, 6);
    }

    #[tokio::test]
    async fn test_verified_destination_is_not_downloaded_again() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello\n".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let t = target(&server, dir.path());
        let http = transfer(64);

        assert_eq!(http.fetch(&t, &NoProgress).await.unwrap(), 6);
        assert_eq!(http.fetch(&t, &NoProgress).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_partial_destination_restarts_from_zero() {
        let server = MockServer::start().await;
        let body = vec![1u8; 2048];
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .expect(1)
            .mount(&server)
            .await;

        let dir = TempDir::new().unwrap();
        let t = target(&server, dir.path());
        // Leftover from an interrupted run, with a record that no longer matches
        std::fs::write(&t.destination_path, vec![1u8; 512]).unwrap();
        checksum::write_record(
            &t.destination_path,
            &CompletionRecord {
                size: 2048,
                sha256: "0".repeat(64),
                url: t.url.clone(),
                completed_at: Utc::now(),
            },
        )
        .await
        .unwrap();

        let bytes = transfer(256).fetch(&t, &NoProgress).await.unwrap();
        assert_eq!(bytes, 2048);
        assert_eq!(std::fs::read(&t.destination_path).unwrap(), body);
    }
}

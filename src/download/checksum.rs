//! SHA-256 digests and completion records
//!
//! A finished transfer leaves `<dest>.done.json` next to the artifact. The
//! record lets a later run prove the file on disk is complete without
//! re-downloading it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::ffi::OsString;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::config::parse_sha256;
use crate::model::DownloadTarget;

const BUF_SIZE: usize = 64 * 1024;

/// Proof that `<dest>` holds a complete transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionRecord {
    pub size: u64,
    pub sha256: String,
    pub url: String,
    pub completed_at: DateTime<Utc>,
}

fn with_suffix(dest: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = dest.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Sidecar path holding the completion record
pub fn record_path(dest: &Path) -> PathBuf {
    with_suffix(dest, ".done.json")
}

/// Staging path written during an HTTP transfer
pub fn part_path(dest: &Path) -> PathBuf {
    with_suffix(dest, ".part")
}

/// Compute SHA-256 of a file as lowercase hex, in bounded memory
pub fn sha256_path(path: &Path) -> io::Result<String> {
    let mut f = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BUF_SIZE];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// [`sha256_path`] on the blocking pool
pub async fn sha256_file(path: &Path) -> io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || sha256_path(&path))
        .await
        .map_err(io::Error::other)?
}

pub async fn read_record(dest: &Path) -> Option<CompletionRecord> {
    let bytes = tokio::fs::read(record_path(dest)).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}

pub async fn write_record(dest: &Path, record: &CompletionRecord) -> io::Result<()> {
    let path = record_path(dest);
    let tmp = with_suffix(&path, ".tmp");
    let json = serde_json::to_vec_pretty(record).map_err(io::Error::other)?;
    tokio::fs::write(&tmp, json).await?;
    tokio::fs::rename(&tmp, &path).await
}

/// Remove a destination that can no longer be trusted, with its record
pub async fn discard(dest: &Path) {
    let _ = tokio::fs::remove_file(dest).await;
    let _ = tokio::fs::remove_file(record_path(dest)).await;
}

/// True when `dest` is a verified complete copy of `target`
///
/// The file must match the recorded size and digest, and the configured
/// checksum when the target carries one. Anything else means the transfer
/// restarts from zero.
pub async fn is_complete(target: &DownloadTarget) -> io::Result<bool> {
    let dest = &target.destination_path;

    let Some(record) = read_record(dest).await else {
        return Ok(false);
    };

    let size = match tokio::fs::metadata(dest).await {
        Ok(meta) => meta.len(),
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    if size != record.size || record.url != target.url {
        debug!(target_name = %target.name, size, recorded = record.size, "Completion record is stale");
        return Ok(false);
    }

    if let Some(expected) = target.checksum.as_deref().and_then(parse_sha256) {
        if expected != record.sha256 {
            return Ok(false);
        }
    }

    let actual = sha256_file(dest).await?;
    Ok(actual == record.sha256)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Protocol;
    use tempfile::TempDir;

    const HELLO_SHA256: &str = "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03";

    fn target(dest: PathBuf) -> DownloadTarget {
        DownloadTarget {
            name: "hello".to_string(),
            url: "https://example.test/hello.iso".to_string(),
            protocol: Protocol::Http,
            destination_path: dest,
            enabled: true,
            checksum: None,
        }
    }

    fn record(size: u64, sha256: &str) -> CompletionRecord {
        CompletionRecord {
            size,
            sha256: sha256.to_string(),
            url: "https://example.test/hello.iso".to_string(),
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn test_sha256_path_known_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hello");
        std::fs::write(&path, b"hello\n").unwrap();
        assert_eq!(sha256_path(&path).unwrap(), HELLO_SHA256);
    }

    #[test]
    fn test_sidecar_paths() {
        let dest = Path::new("/srv/isos/debian.iso");
        assert_eq!(record_path(dest), PathBuf::from("/srv/isos/debian.iso.done.json"));
        assert_eq!(part_path(dest), PathBuf::from("/srv/isos/debian.iso.part"));
    }

    #[tokio::test]
    async fn test_complete_when_record_matches() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("hello.iso");
        std::fs::write(&dest, b"hello\n").unwrap();
        write_record(&dest, &record(6, HELLO_SHA256)).await.unwrap();

        assert!(is_complete(&target(dest)).await.unwrap());
    }

    #[tokio::test]
    async fn test_incomplete_without_record_or_with_wrong_digest() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("hello.iso");
        std::fs::write(&dest, b"hello\n").unwrap();
        assert!(!is_complete(&target(dest.clone())).await.unwrap());

        write_record(&dest, &record(6, &"0".repeat(64))).await.unwrap();
        assert!(!is_complete(&target(dest)).await.unwrap());
    }

    #[tokio::test]
    async fn test_incomplete_when_configured_checksum_differs() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("hello.iso");
        std::fs::write(&dest, b"hello\n").unwrap();
        write_record(&dest, &record(6, HELLO_SHA256)).await.unwrap();

        let mut t = target(dest);
        t.checksum = Some(format!("sha256:{}", "f".repeat(64)));
        assert!(!is_complete(&t).await.unwrap());
    }
}

//! rsync transfers driven through the system `rsync` binary

use chrono::Utc;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::checksum::{self, CompletionRecord};
use super::error::{Result, TransferError};
use crate::config::parse_sha256;
use crate::humanize::ByteSize;
use crate::model::DownloadTarget;

/// Relative to the destination directory
const PARTIAL_DIR: &str = ".rsync-partial";

pub struct RsyncTransfer {
    program: PathBuf,
}

impl Default for RsyncTransfer {
    fn default() -> Self {
        Self::new()
    }
}

impl RsyncTransfer {
    pub fn new() -> Self {
        Self::with_program("rsync")
    }

    /// Use a specific binary instead of `rsync` from `PATH`
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, target: &DownloadTarget, io_timeout: Duration) -> Command {
        let mut cmd = Command::new(&self.program);
        // Interrupted data stays in the partial dir, never over dest
        cmd.arg("--archive")
            .arg(format!("--partial-dir={PARTIAL_DIR}"))
            .arg("--stats")
            .arg(format!("--timeout={}", io_timeout.as_secs().max(1)))
            .arg(&target.url)
            .arg(&target.destination_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Dropping the future (deadline, shutdown) kills the child
            .kill_on_drop(true);
        cmd
    }

    /// Run rsync for `target`. Returns the file bytes rsync reports as
    /// transferred, 0 when the destination was already current.
    pub async fn fetch(&self, target: &DownloadTarget, io_timeout: Duration) -> Result<u64> {
        let dest = &target.destination_path;

        if checksum::is_complete(target).await? {
            info!(target_name = %target.name, path = %dest.display(), "Destination already complete, skipping rsync");
            return Ok(0);
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        debug!(target_name = %target.name, program = %self.program.display(), "Spawning rsync");
        let output = self
            .command(target, io_timeout)
            .output()
            .await
            .map_err(|e| {
                TransferError::Process(format!("failed to spawn {}: {e}", self.program.display()))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = stderr.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
            let code = output
                .status
                .code()
                .map_or_else(|| "signal".to_string(), |c| c.to_string());
            return Err(TransferError::Process(format!("exit {code}: {}", detail.trim())));
        }

        let size = match tokio::fs::metadata(dest).await {
            Ok(meta) => meta.len(),
            Err(_) => {
                return Err(TransferError::Process(format!(
                    "rsync succeeded but {} is missing",
                    dest.display()
                )));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let transferred = parse_transferred_size(&stdout).unwrap_or(size);

        let actual = checksum::sha256_file(dest).await?;
        if let Some(expected) = target.checksum.as_deref().and_then(parse_sha256) {
            if actual != expected {
                // rsync already replaced dest, so the bad copy goes
                warn!(target_name = %target.name, %expected, %actual, "Checksum mismatch, discarding download");
                checksum::discard(dest).await;
                return Err(TransferError::ChecksumMismatch { expected, actual });
            }
        }

        checksum::write_record(
            dest,
            &CompletionRecord {
                size,
                sha256: actual,
                url: target.url.clone(),
                completed_at: Utc::now(),
            },
        )
        .await?;

        info!(
            target_name = %target.name,
            transferred = %ByteSize(transferred),
            size = %ByteSize(size),
            "rsync complete"
        );
        Ok(transferred)
    }
}

/// Pull "Total transferred file size: 1,234 bytes" out of `--stats` output
fn parse_transferred_size(stats: &str) -> Option<u64> {
    let line = stats
        .lines()
        .find(|l| l.trim_start().starts_with("Total transferred file size:"))?;
    let value = line.split_once(':')?.1;
    let digits: String = value
        .split_whitespace()
        .next()?
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ErrorKind, Protocol};
    use std::path::Path;
    use tempfile::TempDir;

    fn target(dir: &Path) -> DownloadTarget {
        DownloadTarget {
            name: "Debian 12".to_string(),
            url: "rsync://mirror.example/debian-cd/debian-12.iso".to_string(),
            protocol: Protocol::Rsync,
            destination_path: dir.join("debian-12.iso"),
            enabled: true,
            checksum: None,
        }
    }

    #[test]
    fn test_parses_stats_output() {
        let stats = "Number of files: 1 (reg: 1)\n\
                     Total file size: 658,505,728 bytes\n\
                     Total transferred file size: 1,048,576 bytes\n";
        assert_eq!(parse_transferred_size(stats), Some(1_048_576));
        assert_eq!(parse_transferred_size("nothing here"), None);
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_process_error() {
        let dir = TempDir::new().unwrap();
        let err = RsyncTransfer::with_program("false")
            .fetch(&target(dir.path()), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Process(_)));
        assert_eq!(err.kind(), ErrorKind::ProcessError);
    }

    #[tokio::test]
    async fn test_missing_binary_is_process_error() {
        let dir = TempDir::new().unwrap();
        let err = RsyncTransfer::with_program(dir.path().join("no-such-rsync"))
            .fetch(&target(dir.path()), Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProcessError);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fake_rsync_writes_destination() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let script = dir.path().join("fake-rsync");
        std::fs::write(
            &script,
            "#!/bin/sh\nfor arg; do dest=$arg; done\n\
             printf '%s\\n' \"$@\" > \"$dest.args\"\n\
             printf 'iso-bytes' > \"$dest\"\n\
             echo 'Total transferred file size: 9 bytes'\n",
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        let t = target(dir.path());
        let rsync = RsyncTransfer::with_program(&script);
        let bytes = rsync.fetch(&t, Duration::from_secs(5)).await.unwrap();

        assert_eq!(bytes, 9);
        assert_eq!(std::fs::read(&t.destination_path).unwrap(), b"iso-bytes");

        let args = std::fs::read_to_string(dir.path().join("debian-12.iso.args")).unwrap();
        let args: Vec<&str> = args.lines().collect();
        assert!(args.contains(&"--partial-dir=.rsync-partial"));
        assert!(!args.contains(&"--partial"));

        // Recorded as complete, so a second run never spawns rsync
        std::fs::remove_file(dir.path().join("debian-12.iso.args")).unwrap();
        assert_eq!(rsync.fetch(&t, Duration::from_secs(5)).await.unwrap(), 0);
        assert!(!dir.path().join("debian-12.iso.args").exists());
    }

    #[tokio::test]
    async fn test_verified_destination_skips_rsync() {
        let dir = TempDir::new().unwrap();
        let t = target(dir.path());
        std::fs::write(&t.destination_path, b"hello\n").unwrap();
        checksum::write_record(
            &t.destination_path,
            &CompletionRecord {
                size: 6,
                sha256: "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03"
                    .to_string(),
                url: t.url.clone(),
                completed_at: Utc::now(),
            },
        )
        .await
        .unwrap();

        // `false` would fail if it were spawned
        let bytes = RsyncTransfer::with_program("false")
            .fetch(&t, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(bytes, 0);
        assert_eq!(std::fs::read(&t.destination_path).unwrap(), b"hello\n");
    }
}

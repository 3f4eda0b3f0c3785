// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Transfer Adapter.
//!
//! We do not reimplement a remote-storage transfer library: we shell out to
//! `rclone`. This keeps the hard, battle-tested parts of uploading to
//! S3/B2/whatever rclone backend supports outside the core, the same way
//! GStreamer pipeline construction stays outside the recording/index logic
//! elsewhere in this codebase.

use std::pin::Pin;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{BackupError, Result};

/// Outcome of a [`Transfer::delete`] call. The purger treats `NotFound` as
/// success — that policy lives in the purger, not here, so this
/// adapter just reports what actually happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    NotFound,
}

/// The contract the core pipeline depends on for moving bytes to and from
/// the remote store.
#[async_trait]
pub trait Transfer: Send + Sync {
    /// Stream `reader` to `remote_path` on the configured remote.
    async fn stream_upload(
        &self,
        remote_path: &str,
        reader: Pin<Box<dyn AsyncRead + Send>>,
    ) -> Result<()>;

    /// Delete the object at `remote_path`.
    async fn delete(&self, remote_path: &str) -> Result<DeleteOutcome>;

    /// List object paths under `prefix` on the remote.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// `Transfer` implemented by invoking the `rclone` CLI as a subprocess.
pub struct RcloneTransfer {
    /// `remote:path` destination, e.g. `b2:my-bucket/protect-backups`.
    destination: String,
    extra_args: Vec<String>,
    purge_args: Vec<String>,
}

impl RcloneTransfer {
    pub fn new(destination: String, extra_args: Vec<String>, purge_args: Vec<String>) -> Self {
        RcloneTransfer { destination, extra_args, purge_args }
    }

    fn full_path(&self, remote_path: &str) -> String {
        format!("{}/{}", self.destination.trim_end_matches('/'), remote_path.trim_start_matches('/'))
    }
}

#[async_trait]
impl Transfer for RcloneTransfer {
    async fn stream_upload(
        &self,
        remote_path: &str,
        mut reader: Pin<Box<dyn AsyncRead + Send>>,
    ) -> Result<()> {
        let target = self.full_path(remote_path);
        debug!(target = %target, "starting rclone rcat");

        let mut child = Command::new("rclone")
            .arg("rcat")
            .args(&self.extra_args)
            .arg(&target)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| BackupError::Transient(format!("spawn rclone rcat: {e}")))?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackupError::Fatal("rclone rcat has no stdin".to_string()))?;

        let copy_result = tokio::io::copy(&mut reader, &mut stdin).await;
        // Close stdin regardless of copy outcome so rclone can flush and exit.
        let _ = stdin.shutdown().await;
        drop(stdin);
        copy_result.map_err(|e| BackupError::Transient(format!("streaming to rclone failed: {e}")))?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| BackupError::Transient(format!("rclone rcat wait failed: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackupError::Transient(format!(
                "rclone rcat exited with {}: {stderr}",
                output.status
            )));
        }
        Ok(())
    }

    async fn delete(&self, remote_path: &str) -> Result<DeleteOutcome> {
        let target = self.full_path(remote_path);
        let output = Command::new("rclone")
            .arg("delete")
            .args(&self.purge_args)
            .arg(&target)
            .output()
            .await
            .map_err(|e| BackupError::Transient(format!("spawn rclone delete: {e}")))?;

        if output.status.success() {
            return Ok(DeleteOutcome::Deleted);
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("not found") || stderr.contains("directory not found") {
            warn!(target = %target, "rclone delete: object already absent");
            return Ok(DeleteOutcome::NotFound);
        }
        Err(BackupError::Transient(format!(
            "rclone delete exited with {}: {stderr}",
            output.status
        )))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let target = self.full_path(prefix);
        let output = Command::new("rclone")
            .arg("lsjson")
            .arg(&target)
            .output()
            .await
            .map_err(|e| BackupError::Transient(format!("spawn rclone lsjson: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(BackupError::Transient(format!(
                "rclone lsjson exited with {}: {stderr}",
                output.status
            )));
        }

        #[derive(serde::Deserialize)]
        struct Entry {
            #[serde(rename = "Path")]
            path: String,
        }
        let entries: Vec<Entry> = serde_json::from_slice(&output.stdout)
            .map_err(|e| BackupError::Transient(format!("rclone lsjson decode: {e}")))?;
        Ok(entries.into_iter().map(|e| e.path).collect())
    }
}

/// An in-memory fake used by pipeline tests, avoiding a real `rclone`
/// subprocess. Kept alongside the production adapter rather than under
/// `#[cfg(test)]` so integration tests in `tests/` can use it too.
pub struct FakeTransfer {
    pub objects: parking_lot::Mutex<std::collections::HashMap<String, Vec<u8>>>,
    pub fail_uploads: std::sync::atomic::AtomicBool,
}

impl Default for FakeTransfer {
    fn default() -> Self {
        FakeTransfer {
            objects: parking_lot::Mutex::new(std::collections::HashMap::new()),
            fail_uploads: std::sync::atomic::AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transfer for FakeTransfer {
    async fn stream_upload(
        &self,
        remote_path: &str,
        mut reader: Pin<Box<dyn AsyncRead + Send>>,
    ) -> Result<()> {
        if self.fail_uploads.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(BackupError::Transient("injected upload failure".to_string()));
        }
        let mut buf = Vec::new();
        reader
            .read_to_end(&mut buf)
            .await
            .map_err(|e| BackupError::Transient(format!("fake upload read failed: {e}")))?;
        self.objects.lock().insert(remote_path.to_string(), buf);
        Ok(())
    }

    async fn delete(&self, remote_path: &str) -> Result<DeleteOutcome> {
        if self.objects.lock().remove(remote_path).is_some() {
            Ok(DeleteOutcome::Deleted)
        } else {
            Ok(DeleteOutcome::NotFound)
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects
            .lock()
            .keys()
            .filter(|p| p.starts_with(prefix))
            .cloned()
            .collect())
    }
}

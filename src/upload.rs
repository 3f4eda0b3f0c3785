// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Upload Stage.
//!
//! Consumes `ClipJob`s FIFO, streams the handoff into the configured
//! `Transfer`, records a ledger row on success, and bumps the retry counter
//! on failure without ever writing a ledger row for a clip that wasn't
//! durably stored remotely. Duration probing via `ffprobe` is best-effort
//! and log-only — a probe mismatch or a missing `ffprobe` binary never
//! fails the upload. Since the real `Transfer` pipes bytes straight into
//! `rclone rcat`'s stdin with no remote file `ffprobe` could ever read, the
//! upload stream is teed to a local scratch file as it passes through, and
//! the probe runs against that local copy once the upload finishes. Every
//! job, success or failure, clears the event out of the shared `InFlight`
//! registry so the reconciler can consider it again if it ever needs to.

use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use futures::{Stream, StreamExt};
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tracing::{info, warn};

use crate::download::ClipJob;
use crate::handoff::HandoffReader;
use crate::inflight::InFlight;
use crate::ledger::{Ledger, LedgerRow};
use crate::notify::{Level, Notifier};
use crate::retry::RetryCounter;
use crate::transfer::Transfer;

/// Run the upload stage until the download stage closes the channel.
pub async fn run(
    transfer: Arc<dyn Transfer>,
    ledger: Arc<Ledger>,
    retry: Arc<RetryCounter>,
    notifier: Arc<Notifier>,
    inflight: Arc<InFlight>,
    mut clips: mpsc::Receiver<ClipJob>,
) {
    while let Some(job) = clips.recv().await {
        let ClipJob { event, camera: _, remote_path, reader } = job;
        let event_id = event.event_id.clone();

        let outcome = upload_one(&transfer, &remote_path, reader).await;
        // Whatever happens next, this event is done being in flight: either
        // it lands in the ledger or the retry counter now owns its fate.
        inflight.clear(&event_id);

        match outcome {
            Ok(temp_file) => {
                probe_duration_mismatch(&event, temp_file.path()).await;
                let row = LedgerRow {
                    event_id: event.event_id.clone(),
                    event_type: event.event_type.as_str().to_string(),
                    camera_id: event.camera_id.clone(),
                    start_ts: event.start_ts,
                    end_ts: event.end_ts.unwrap_or(event.start_ts),
                    remote_path: remote_path.clone(),
                    uploaded_at: Utc::now(),
                };
                if let Err(e) = ledger.put(&row).await {
                    warn!(event_id = %event_id, error = %e, "upload succeeded but ledger write failed");
                } else {
                    info!(event_id = %event_id, remote_path = %remote_path, "uploaded clip");
                }
            }
            Err(reason) => {
                let attempts = retry.increment(&event_id);
                warn!(event_id = %event_id, attempts, reason = %reason, "upload failed");
                if retry.is_banned(&event_id) {
                    notifier
                        .notify(
                            Level::Error,
                            "event permanently failed",
                            &format!("{event_id} exceeded the retry limit while uploading: {reason}"),
                        )
                        .await;
                }
            }
        }
    }
}

/// Stream the handoff into the transfer adapter, teeing the same bytes into
/// a local scratch file along the way so `ffprobe` has something to read
/// once the upload finishes. An error flag raised on the handoff (a
/// download-side stream failure) is treated the same as a transfer-level
/// failure: no ledger write, just a retry-counter bump. The returned
/// `NamedTempFile` deletes itself once the caller drops it.
async fn upload_one(
    transfer: &Arc<dyn Transfer>,
    remote_path: &str,
    reader: HandoffReader,
) -> Result<NamedTempFile, String> {
    let temp = NamedTempFile::new().map_err(|e| format!("create duration-probe scratch file: {e}"))?;
    let probe_file = tokio::fs::File::create(temp.path())
        .await
        .map_err(|e| format!("open duration-probe scratch file: {e}"))?;

    let stream = tee_into_file(reader.into_stream(), probe_file);
    let async_read: Pin<Box<dyn AsyncRead + Send>> = Box::pin(StreamReader::new(stream));
    transfer.stream_upload(remote_path, async_read).await.map_err(|e| e.to_string())?;
    Ok(temp)
}

/// Wrap a chunk stream so every chunk is also written to `file` before being
/// yielded onward. A write failure disables teeing for the rest of the
/// stream (the probe is best-effort) but never interrupts the upload itself.
fn tee_into_file(
    mut inner: impl Stream<Item = std::io::Result<Bytes>> + Unpin,
    mut file: tokio::fs::File,
) -> impl Stream<Item = std::io::Result<Bytes>> {
    async_stream::stream! {
        let mut tee_ok = true;
        while let Some(item) = inner.next().await {
            if tee_ok {
                if let Ok(bytes) = &item {
                    if let Err(e) = file.write_all(bytes).await {
                        warn!(error = %e, "writing duration-probe scratch file failed, probe will be skipped");
                        tee_ok = false;
                    }
                }
            }
            yield item;
        }
    }
}

/// Best-effort `ffprobe` duration check against the local scratch file the
/// upload was teed into. A mismatch, or `ffprobe` not being on `$PATH`, is
/// logged and never propagated.
async fn probe_duration_mismatch(event: &crate::model::Event, local_path: &std::path::Path) {
    let Some(expected) = event.duration() else { return };
    let Ok(output) = Command::new("ffprobe")
        .args(["-v", "error", "-show_entries", "format=duration", "-of", "default=noprint_wrappers=1:nokey=1"])
        .arg(local_path)
        .output()
        .await
    else {
        return; // ffprobe missing or failed to spawn; nothing to report
    };
    if !output.status.success() {
        return;
    }
    let Ok(text) = String::from_utf8(output.stdout) else { return };
    let Ok(actual_secs) = text.trim().parse::<f64>() else { return };
    let expected_secs = expected.as_secs_f64();
    if (actual_secs - expected_secs).abs() > 1.0 {
        warn!(
            event_id = %event.event_id,
            expected_secs,
            actual_secs,
            "uploaded clip duration disagrees with event duration"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handoff;
    use crate::model::{Camera, DetectionType, Event};
    use crate::transfer::FakeTransfer;
    use bytes::Bytes;
    use std::collections::BTreeSet;
    use std::time::Duration as StdDuration;

    fn sample_job(reader: handoff::HandoffReader) -> ClipJob {
        let end = Utc::now();
        ClipJob {
            event: Event {
                event_id: "E1".into(),
                camera_id: "cam1".into(),
                event_type: DetectionType::Motion,
                smart_detect_types: BTreeSet::new(),
                start_ts: end - chrono::Duration::seconds(5),
                end_ts: Some(end),
            },
            camera: Camera { camera_id: "cam1".into(), name: "Front".into(), tz_offset_seconds: 0 },
            remote_path: "Front/E1.mp4".into(),
            reader,
        }
    }

    #[tokio::test]
    async fn successful_upload_writes_ledger_row() {
        let (writer, reader) = handoff::channel(1024);
        writer.write(Bytes::from_static(b"clip bytes")).await.unwrap();
        writer.finish().await;

        let transfer: Arc<dyn Transfer> = Arc::new(FakeTransfer::default());
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        let retry = Arc::new(RetryCounter::new(StdDuration::from_secs(3600)));
        let notifier = Arc::new(Notifier::new(vec![]));
        let inflight = Arc::new(InFlight::new());
        inflight.mark("E1");

        let (tx, rx) = mpsc::channel(1);
        tx.send(sample_job(reader)).await.unwrap();
        drop(tx);

        run(transfer.clone(), ledger.clone(), retry, notifier, inflight.clone(), rx).await;

        assert!(ledger.has("E1").await.unwrap());
        assert!(!inflight.contains("E1"));
    }

    #[tokio::test]
    async fn failed_upload_bumps_retry_and_skips_ledger() {
        let (writer, reader) = handoff::channel(1024);
        writer.write(Bytes::from_static(b"clip bytes")).await.unwrap();
        writer.finish().await;

        let fake = FakeTransfer::default();
        fake.fail_uploads.store(true, std::sync::atomic::Ordering::SeqCst);
        let transfer: Arc<dyn Transfer> = Arc::new(fake);
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        let retry = Arc::new(RetryCounter::new(StdDuration::from_secs(3600)));
        let notifier = Arc::new(Notifier::new(vec![]));
        let inflight = Arc::new(InFlight::new());
        inflight.mark("E1");

        let (tx, rx) = mpsc::channel(1);
        tx.send(sample_job(reader)).await.unwrap();
        drop(tx);

        run(transfer, ledger.clone(), retry.clone(), notifier, inflight.clone(), rx).await;

        assert!(!ledger.has("E1").await.unwrap());
        assert_eq!(retry.attempts("E1"), 1);
        assert!(!inflight.contains("E1"));
    }

    #[tokio::test]
    async fn upload_one_tees_bytes_into_a_readable_local_scratch_file() {
        let (writer, reader) = handoff::channel(1024);
        writer.write(Bytes::from_static(b"clip bytes")).await.unwrap();
        writer.finish().await;

        let transfer: Arc<dyn Transfer> = Arc::new(FakeTransfer::default());
        let temp = upload_one(&transfer, "Front/E1.mp4", reader).await.unwrap();

        let on_disk = std::fs::read(temp.path()).unwrap();
        assert_eq!(on_disk, b"clip bytes");
    }
}

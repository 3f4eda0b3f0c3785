// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Supervisor.
//!
//! Owns the lifecycle of the five pipeline stages (listener, reconciler,
//! download, upload, purger), wires the channels between them, and drives
//! shutdown: on an OS interrupt, stages are stopped in reverse data-flow
//! order — the listener and reconciler stop producing first, the event
//! queue and byte-handoffs drain through download and upload, and the
//! purger stops last — so no in-flight clip is abandoned mid-upload. This
//! generalizes `manager::RecordingManager`, which tracks a
//! `JoinHandle` per camera worker and `abort()`s them on shutdown, from
//! "camera workers" to "pipeline stages."
//!
//! A stage's exclusive channel half (its `mpsc::Receiver`/`EventQueueReceiver`)
//! can't be recreated once consumed, so unlike the camera-worker model
//! (which can simply be re-added), a stage that panics can't be hot-restarted
//! in place — doing so would either resurrect a dropped receiver or silently
//! drop whatever was in flight. A stage panic is therefore treated as fatal:
//! logged, and the whole agent shuts down cooperatively rather than papering
//! over a bug with a restart loop.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use tokio::sync::{mpsc, watch};
use tracing::{error, info};

use crate::config::Config;
use crate::download::ClipJob;
use crate::error::{BackupError, Result};
use crate::inflight::InFlight;
use crate::ledger::Ledger;
use crate::notify::{Level, Notifier};
use crate::nvr::NvrClient;
use crate::queue;
use crate::retry::RetryCounter;
use crate::transfer::Transfer;
use crate::{download, listener, purger, reconciler, upload};

/// Depth of each lane (realtime, reconciler backlog) of the event queue
/// between the listener/reconciler and the download stage. The two lanes
/// are independent `mpsc` channels, so the pipeline's combined event-queue
/// capacity is twice this.
const DEFAULT_QUEUE_DEPTH: usize = 128;

/// Owns every shared dependency the pipeline stages need; constructing one
/// and calling [`Supervisor::run`] is the entire lifetime of the agent.
pub struct Supervisor {
    pub nvr: Arc<dyn NvrClient>,
    pub transfer: Arc<dyn Transfer>,
    pub ledger: Arc<Ledger>,
    pub retry: Arc<RetryCounter>,
    pub notifier: Arc<Notifier>,
    pub config: Arc<Config>,
}

impl Supervisor {
    /// Run every stage until an OS interrupt is received or a stage
    /// panics. Returns `Ok(())` on clean shutdown, `Err` if a stage
    /// panicked and the agent had to escalate.
    pub async fn run(self) -> Result<()> {
        let (event_queue, event_rx) = queue::bounded(DEFAULT_QUEUE_DEPTH);
        let (clip_tx, clip_rx) = mpsc::channel::<ClipJob>(1);
        let (reconcile_trigger_tx, reconcile_trigger_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let inflight = Arc::new(InFlight::new());

        info!(
            address = %self.config.address,
            rclone_destination = %self.config.rclone_destination,
            retention_secs = self.config.retention.as_secs(),
            "starting backup agent"
        );

        let listener_handle = tokio::spawn(listener::run(
            self.nvr.clone(),
            self.ledger.clone(),
            self.retry.clone(),
            self.config.clone(),
            event_queue.clone(),
            reconcile_trigger_tx,
            shutdown_rx.clone(),
        ));

        let reconciler_handle = tokio::spawn(reconciler::run(
            self.nvr.clone(),
            self.ledger.clone(),
            self.retry.clone(),
            inflight.clone(),
            self.config.clone(),
            event_queue,
            reconcile_trigger_rx,
        ));

        let download_handle = tokio::spawn(download::run(
            self.nvr.clone(),
            self.ledger.clone(),
            self.retry.clone(),
            self.notifier.clone(),
            self.config.clone(),
            inflight.clone(),
            event_rx,
            clip_tx,
        ));

        let upload_handle = tokio::spawn(upload::run(
            self.transfer.clone(),
            self.ledger.clone(),
            self.retry.clone(),
            self.notifier.clone(),
            inflight.clone(),
            clip_rx,
        ));

        let mut listener_handle = listener_handle;
        let mut reconciler_handle = reconciler_handle;
        let mut download_handle = download_handle;
        let mut upload_handle = upload_handle;
        let mut purger_handle =
            tokio::spawn(purger::run(self.transfer.clone(), self.ledger.clone(), self.config.clone(), shutdown_rx));

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown signal received, draining pipeline");
                let _ = shutdown_tx.send(true);
            }
            r = &mut listener_handle => return report_unexpected_exit("listener", r),
            r = &mut reconciler_handle => return report_unexpected_exit("reconciler", r),
            r = &mut download_handle => return report_unexpected_exit("download", r),
            r = &mut upload_handle => return report_unexpected_exit("upload", r),
            r = &mut purger_handle => return report_unexpected_exit("purger", r),
        }

        // Cooperative shutdown in reverse data-flow order: the listener and
        // reconciler stop producing first (they observed `shutdown_tx`, and
        // their side of `event_queue` is dropped with them); the queue then
        // closes, letting download drain and exit, which drops `clip_tx` so
        // upload drains and exits, and finally the purger (already told to
        // stop via the same `shutdown` watch).
        let mut fatal = None;
        for (stage, handle) in [
            ("listener", listener_handle),
            ("reconciler", reconciler_handle),
            ("download", download_handle),
            ("upload", upload_handle),
            ("purger", purger_handle),
        ] {
            if let Err(e) = handle.await {
                error!(stage, error = %e, "stage panicked during shutdown");
                fatal.get_or_insert(BackupError::Fatal(format!("stage '{stage}' panicked during shutdown: {e}")));
            }
        }
        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// A stage task exiting on its own, before shutdown was requested, means
/// either a bug or a channel closing unexpectedly — either way it's fatal.
fn report_unexpected_exit(stage: &str, result: std::result::Result<(), tokio::task::JoinError>) -> Result<()> {
    match result {
        Ok(()) => {
            error!(stage, "pipeline stage exited unexpectedly before shutdown was requested");
            Err(BackupError::Fatal(format!("stage '{stage}' exited unexpectedly")))
        }
        Err(e) => {
            error!(stage, error = %e, "pipeline stage panicked");
            Err(BackupError::Fatal(format!("stage '{stage}' panicked: {e}")))
        }
    }
}

/// Fire a best-effort fatal notification before the process exits; never
/// blocks shutdown on a slow or unreachable webhook.
pub async fn notify_fatal(notifier: &Notifier, reason: &str) {
    let _ = tokio::time::timeout(StdDuration::from_secs(5), notifier.notify(Level::Error, "agent shutting down", reason)).await;
}

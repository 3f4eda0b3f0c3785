// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Missing-Event Reconciler.
//!
//! Runs a diff of `nvr_ids \ ledger_ids` over the retention window at three
//! triggers: once at startup, once per realtime reconnect (the listener
//! can't know what it missed while disconnected), and on a fixed timer as a
//! backstop for eventual completeness. Missing eligible
//! events are offered onto the reconciler side of the event queue, which is
//! always drained after the realtime side (`queue::EventQueueReceiver`), so
//! a large backlog scan never starves live events.
//!
//! An event already in flight through download/upload (tracked in the
//! shared `InFlight` registry) is skipped the same as an already-ledgered or
//! banned one — otherwise a backlog scan can re-offer an event a second
//! time while the first attempt hasn't reached the ledger yet.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::Config;
use crate::error::Result;
use crate::inflight::InFlight;
use crate::ledger::Ledger;
use crate::nvr::NvrClient;
use crate::queue::EventQueue;
use crate::retry::RetryCounter;

const RECONCILE_INTERVAL: StdDuration = StdDuration::from_secs(5 * 60);

/// Run the reconciler until `reconcile_now` closes (supervisor shutdown).
pub async fn run(
    nvr: Arc<dyn NvrClient>,
    ledger: Arc<Ledger>,
    retry: Arc<RetryCounter>,
    inflight: Arc<InFlight>,
    config: Arc<Config>,
    queue: EventQueue,
    mut reconcile_now: tokio::sync::mpsc::Receiver<()>,
) {
    if config.skip_missing {
        if let Err(e) = seed_skip_missing(&nvr, &ledger, &config).await {
            warn!(error = %e, "skip-missing seeding pass failed");
        }
    }

    if let Err(e) = reconcile_once(&nvr, &ledger, &retry, &inflight, &config, &queue).await {
        warn!(error = %e, "initial reconciliation pass failed");
    }

    let mut ticker = tokio::time::interval(RECONCILE_INTERVAL);
    ticker.tick().await; // the first tick fires immediately; we already ran once above

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            msg = reconcile_now.recv() => {
                if msg.is_none() {
                    return;
                }
                info!("reconciling after realtime reconnect");
            }
        }
        if let Err(e) = reconcile_once(&nvr, &ledger, &retry, &inflight, &config, &queue).await {
            warn!(error = %e, "reconciliation pass failed");
        }
    }
}

fn scan_window(config: &Config) -> (chrono::DateTime<Utc>, chrono::DateTime<Utc>) {
    let to_ts = Utc::now();
    let span = chrono::Duration::from_std(config.retention).unwrap_or_else(|_| chrono::Duration::zero());
    (to_ts - span, to_ts)
}

async fn reconcile_once(
    nvr: &Arc<dyn NvrClient>,
    ledger: &Arc<Ledger>,
    retry: &Arc<RetryCounter>,
    inflight: &Arc<InFlight>,
    config: &Arc<Config>,
    queue: &EventQueue,
) -> Result<()> {
    let (from_ts, to_ts) = scan_window(config);
    let nvr_events = nvr.list_events(from_ts, to_ts).await?;
    let ledgered = ledger.all_ids_in_window(from_ts, to_ts).await?;

    let mut queued = 0usize;
    for event in nvr_events {
        if ledgered.contains(&event.event_id) {
            continue;
        }
        if retry.is_banned(&event.event_id) {
            continue;
        }
        if inflight.contains(&event.event_id) {
            continue;
        }
        if !event.is_eligible(&config.detection_types, &config.ignored_cameras, config.max_event_length) {
            continue;
        }
        queued += 1;
        if queue.offer_reconciler(event).await.is_err() {
            // Download stage gone; the supervisor is already shutting down.
            return Ok(());
        }
    }
    if queued > 0 {
        info!(queued, "reconciler found missing events");
    }
    Ok(())
}

/// `--skip-missing`: mark every event currently on the NVR as already
/// backed up without downloading it, so only events observed
/// from here on get fetched. Persisted via sentinel ledger rows so this
/// doesn't have to be re-run on every restart.
async fn seed_skip_missing(nvr: &Arc<dyn NvrClient>, ledger: &Arc<Ledger>, config: &Arc<Config>) -> Result<()> {
    let (from_ts, to_ts) = scan_window(config);
    let events = nvr.list_events(from_ts, to_ts).await?;

    let mut seeded = 0usize;
    for event in events {
        if ledger.has(&event.event_id).await? {
            continue;
        }
        let Some(end_ts) = event.end_ts else { continue };
        ledger
            .seed_skip_missing(&event.event_id, &event.event_type, &event.camera_id, event.start_ts, end_ts)
            .await?;
        seeded += 1;
    }
    info!(seeded, "skip-missing seeding complete");
    Ok(())
}

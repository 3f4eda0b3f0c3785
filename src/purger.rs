// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Purger.
//!
//! Timer-driven retention enforcement: every `purge_interval`, fetch ledger
//! rows older than `retention` and delete their remote objects. `NotFound`
//! is treated as success (the object is already gone, which is the desired
//! end state); only after a confirmed remote delete (or confirmed absence)
//! is the ledger row removed, so a crash between delete and ledger-write
//! just repeats a no-op delete next cycle rather than orphaning state.

use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use crate::config::Config;
use crate::ledger::Ledger;
use crate::transfer::{DeleteOutcome, Transfer};

/// Run the purger until `shutdown` fires.
pub async fn run(transfer: Arc<dyn Transfer>, ledger: Arc<Ledger>, config: Arc<Config>, mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(config.purge_interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
        if let Err(e) = purge_once(&transfer, &ledger, config.retention).await {
            warn!(error = %e, "purge pass failed");
        }
    }
}

async fn purge_once(
    transfer: &Arc<dyn Transfer>,
    ledger: &Arc<Ledger>,
    retention: std::time::Duration,
) -> crate::error::Result<()> {
    let cutoff = Utc::now() - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());
    let candidates = ledger.iter_older_than(cutoff).await?;
    let mut purged = 0usize;
    for (event_id, remote_path) in candidates {
        match transfer.delete(&remote_path).await {
            Ok(DeleteOutcome::Deleted) | Ok(DeleteOutcome::NotFound) => {
                if let Err(e) = ledger.delete(&event_id).await {
                    warn!(event_id = %event_id, error = %e, "purge: ledger delete failed after remote delete");
                    continue;
                }
                purged += 1;
            }
            Err(e) => {
                // Transient failure: leave the row in place, retry next cycle.
                warn!(event_id = %event_id, remote_path = %remote_path, error = %e, "purge: remote delete failed");
            }
        }
    }
    if purged > 0 {
        info!(purged, "purge cycle complete");
    }
    Ok(())
}

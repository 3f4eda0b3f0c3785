// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! protect-backup — mirrors UniFi Protect event clips to a remote object
//! store, with retention and missing-event reconciliation.
//!
//! Usage:
//!   protect-backup --address nvr.local --username admin --password secret \
//!       --rclone-destination b2:my-bucket/protect-backups

use std::sync::Arc;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use protect_backup::config::Config;
use protect_backup::error::BackupError;
use protect_backup::ledger::Ledger;
use protect_backup::notify::Notifier;
use protect_backup::nvr::client::{NvrEndpoint, UnifiProtectClient};
use protect_backup::retry::RetryCounter;
use protect_backup::supervisor::{self, Supervisor};
use protect_backup::transfer::RcloneTransfer;

/// Configuration errors exit with this code; anything else fatal exits 1;
/// a clean shutdown exits 0.
const EXIT_CONFIG_ERROR: i32 = 200;

#[tokio::main]
async fn main() {
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            // No tracing subscriber yet at this point — config loading can
            // fail before we know the requested verbosity.
            eprintln!("configuration error: {e}");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    init_tracing(config.verbosity);

    info!(
        address = %config.address,
        port = config.port,
        username = %config.username,
        password = "<redacted>",
        rclone_destination = %config.rclone_destination,
        retention_secs = config.retention.as_secs(),
        detection_types = ?config.detection_types,
        skip_missing = config.skip_missing,
        "resolved configuration"
    );

    let config = Arc::new(config);
    let notifier = Arc::new(Notifier::new(config.notifiers.clone()));

    let ledger = match Ledger::open(&config.sqlite_path) {
        Ok(l) => Arc::new(l),
        Err(e) => {
            error!(error = %e, path = ?config.sqlite_path, "failed to open event ledger");
            std::process::exit(EXIT_CONFIG_ERROR);
        }
    };

    let endpoint = NvrEndpoint {
        address: config.address.clone(),
        port: config.port,
        username: config.username.clone(),
        password: config.password.clone(),
        verify_ssl: config.verify_ssl,
    };
    let nvr = match UnifiProtectClient::connect(endpoint).await {
        Ok(c) => Arc::new(c),
        Err(e) => {
            let code = if matches!(e, BackupError::Config(_)) { EXIT_CONFIG_ERROR } else { 1 };
            error!(error = %e, "failed to connect to the NVR");
            std::process::exit(code);
        }
    };

    let transfer = Arc::new(RcloneTransfer::new(
        config.rclone_destination.clone(),
        config.rclone_args.clone(),
        config.rclone_purge_args.clone(),
    ));

    // Ban TTL must outlive the retention window, or a banned event could
    // re-enter scope (via the reconciler) before its ban naturally expires.
    let retry = Arc::new(RetryCounter::new(config.retention));

    let sup = Supervisor { nvr, transfer, ledger, retry, notifier: notifier.clone(), config };

    match sup.run().await {
        Ok(()) => {
            info!("shut down cleanly");
            std::process::exit(0);
        }
        Err(e) => {
            error!(error = %e, "shutting down due to a fatal error");
            supervisor::notify_fatal(&notifier, &e.to_string()).await;
            std::process::exit(1);
        }
    }
}

fn init_tracing(verbosity: u8) {
    let default_level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .init();
}

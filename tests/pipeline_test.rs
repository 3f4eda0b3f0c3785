// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! End-to-end pipeline tests: wires the listener, download, and upload
//! stages together over a `MockNvrClient` and `FakeTransfer`, exercising the
//! realtime add/update path through to a ledger row, and the purger against
//! a populated ledger.
//!
//! Run with: `cargo test`

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use protect_backup::config::Config;
use protect_backup::download::{self, ClipJob};
use protect_backup::inflight::InFlight;
use protect_backup::ledger::Ledger;
use protect_backup::listener;
use protect_backup::model::DetectionType;
use protect_backup::notify::Notifier;
use protect_backup::nvr::mock::MockNvrClient;
use protect_backup::nvr::RawEvent;
use protect_backup::queue;
use protect_backup::retry::RetryCounter;
use protect_backup::template::PathTemplate;
use protect_backup::transfer::{FakeTransfer, Transfer};
use protect_backup::upload;
use tokio::sync::{mpsc, watch};

fn test_config() -> Config {
    Config {
        address: "nvr.local".into(),
        port: 443,
        username: "admin".into(),
        password: "hunter2".into(),
        verify_ssl: true,
        rclone_destination: "b2:bucket".into(),
        retention: Duration::from_secs(7 * 86_400),
        rclone_args: vec![],
        rclone_purge_args: vec![],
        detection_types: [DetectionType::Motion].into_iter().collect(),
        ignored_cameras: BTreeSet::new(),
        file_structure_format: PathTemplate::parse("{camera_name}/{event.id}.mp4").unwrap(),
        sqlite_path: "./unused.sqlite".into(),
        download_buffer_size: 4096,
        purge_interval: Duration::from_secs(86_400),
        max_event_length: Duration::from_secs(7_200),
        skip_missing: false,
        notifiers: vec![],
        verbosity: 0,
    }
}

/// Realtime event → listener → event queue → download → byte-handoff →
/// upload → ledger row, with no reconciler involvement at all.
#[tokio::test]
async fn realtime_event_flows_end_to_end_into_the_ledger() {
    let nvr = Arc::new(MockNvrClient::default());
    nvr.cameras.lock().insert(
        "cam1".to_string(),
        protect_backup::model::Camera { camera_id: "cam1".into(), name: "Front".into(), tz_offset_seconds: 0 },
    );
    nvr.clips.lock().insert(
        "E1".to_string(),
        vec![Ok(bytes::Bytes::from_static(b"clip payload"))],
    );

    let ledger = Arc::new(Ledger::open_in_memory().unwrap());
    let retry = Arc::new(RetryCounter::new(Duration::from_secs(3600)));
    let notifier = Arc::new(Notifier::new(vec![]));
    let config = Arc::new(test_config());
    let transfer: Arc<dyn Transfer> = Arc::new(FakeTransfer::default());
    let inflight = Arc::new(InFlight::new());

    let (queue, queue_rx) = queue::bounded(8);
    let (clip_tx, clip_rx) = mpsc::channel::<ClipJob>(1);
    let (trigger_tx, _trigger_rx) = mpsc::channel(1);
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let listener_handle = tokio::spawn(listener::run(
        nvr.clone(),
        ledger.clone(),
        retry.clone(),
        config.clone(),
        queue,
        trigger_tx,
        shutdown_rx,
    ));
    let download_handle = tokio::spawn(download::run(
        nvr.clone(),
        ledger.clone(),
        retry.clone(),
        notifier.clone(),
        config,
        inflight.clone(),
        queue_rx,
        clip_tx,
    ));
    let upload_handle =
        tokio::spawn(upload::run(transfer.clone(), ledger.clone(), retry, notifier, inflight, clip_rx));

    let sub_tx = loop {
        if let Some(tx) = nvr.subscribe_tx.lock().clone() {
            break tx;
        }
        tokio::task::yield_now().await;
    };

    let end = chrono::Utc::now() - chrono::Duration::seconds(30);
    let start = end - chrono::Duration::seconds(5);
    sub_tx
        .send(RawEvent::Add { event_id: "E1".into(), camera_id: "cam1".into(), event_type: DetectionType::Motion, start_ts: start })
        .await
        .unwrap();
    sub_tx
        .send(RawEvent::Update { event_id: "E1".into(), end_ts: Some(end), smart_detect_types: BTreeSet::new() })
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if ledger.has("E1").await.unwrap() {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("event E1 never reached the ledger");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    listener_handle.abort();
    download_handle.abort();
    upload_handle.abort();
}

/// A repeatedly-failing upload bans the event after `MAX_ATTEMPTS` and the
/// ledger never gains a row for it.
#[tokio::test]
async fn persistently_failing_upload_bans_the_event_without_a_ledger_row() {
    let ledger = Arc::new(Ledger::open_in_memory().unwrap());
    let retry = Arc::new(RetryCounter::new(Duration::from_secs(3600)));
    let notifier = Arc::new(Notifier::new(vec![]));

    let fake = FakeTransfer::default();
    fake.fail_uploads.store(true, std::sync::atomic::Ordering::SeqCst);
    let transfer: Arc<dyn Transfer> = Arc::new(fake);
    let inflight = Arc::new(InFlight::new());

    for _ in 0..protect_backup::retry::MAX_ATTEMPTS {
        let (writer, reader) = protect_backup::handoff::channel(1024);
        writer.write(bytes::Bytes::from_static(b"x")).await.unwrap();
        writer.finish().await;

        let job = ClipJob {
            event: protect_backup::model::Event {
                event_id: "E1".into(),
                camera_id: "cam1".into(),
                event_type: DetectionType::Motion,
                smart_detect_types: BTreeSet::new(),
                start_ts: chrono::Utc::now(),
                end_ts: Some(chrono::Utc::now()),
            },
            camera: protect_backup::model::Camera { camera_id: "cam1".into(), name: "Front".into(), tz_offset_seconds: 0 },
            remote_path: "Front/E1.mp4".into(),
            reader,
        };
        let (tx, rx) = mpsc::channel(1);
        tx.send(job).await.unwrap();
        drop(tx);
        upload::run(transfer.clone(), ledger.clone(), retry.clone(), notifier.clone(), inflight.clone(), rx).await;
    }

    assert!(retry.is_banned("E1"));
    assert!(!ledger.has("E1").await.unwrap());
}

/// Purger deletes remote objects and ledger rows for events past retention,
/// and leaves fresher rows alone.
#[tokio::test]
async fn purge_cycle_respects_retention_window() {
    let ledger = Arc::new(Ledger::open_in_memory().unwrap());
    let fake = Arc::new(FakeTransfer::default());

    for (id, age_days) in [("ancient", 30), ("recent", 1)] {
        let end_ts = chrono::Utc::now() - chrono::Duration::days(age_days);
        fake.objects.lock().insert(format!("{id}.mp4"), b"bytes".to_vec());
        ledger
            .put(&protect_backup::ledger::LedgerRow {
                event_id: id.to_string(),
                event_type: "motion".to_string(),
                camera_id: "cam1".to_string(),
                start_ts: end_ts - chrono::Duration::seconds(5),
                end_ts,
                remote_path: format!("{id}.mp4"),
                uploaded_at: chrono::Utc::now(),
            })
            .await
            .unwrap();
    }

    let transfer: Arc<dyn Transfer> = fake.clone();
    let config = Arc::new(Config { purge_interval: Duration::from_millis(5), ..test_config() });
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(protect_backup::purger::run(transfer, ledger.clone(), config, shutdown_rx));
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if !ledger.has("ancient").await.unwrap() {
            break;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("ancient row was never purged");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(ledger.has("recent").await.unwrap());
    handle.abort();
}

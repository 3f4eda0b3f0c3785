// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Event Listener.
//!
//! Consumes the realtime `RawEvent` stream from the NVR adapter, buffers
//! events that have started but not yet ended, and flushes a full `Event`
//! onto the event queue once an `end_ts` arrives. Reconnects to the
//! realtime feed on a closed subscription (the adapter's own backoff+jitter
//! loop, `nvr::client::realtime_loop`, handles the wire-level reconnect;
//! this loop only resubscribes if the channel itself closes) and clears its
//! in-flight buffer on `RawEvent::Reconnected`, trusting the reconciler
//! (triggered via `reconcile_trigger`) to pick up anything that finished
//! while disconnected.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::config::Config;
use crate::ledger::Ledger;
use crate::model::{DetectionType, Event};
use crate::nvr::{NvrClient, RawEvent};
use crate::queue::EventQueue;
use crate::retry::RetryCounter;

struct PendingEvent {
    camera_id: String,
    event_type: DetectionType,
    start_ts: DateTime<Utc>,
    smart_detect_types: BTreeSet<String>,
}

/// Run the listener until `shutdown` fires.
pub async fn run(
    nvr: Arc<dyn NvrClient>,
    ledger: Arc<Ledger>,
    retry: Arc<RetryCounter>,
    config: Arc<Config>,
    queue: EventQueue,
    reconcile_trigger: mpsc::Sender<()>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut pending: HashMap<String, PendingEvent> = HashMap::new();

    'resubscribe: loop {
        let mut rx = match nvr.subscribe().await {
            Ok(rx) => rx,
            Err(e) => {
                warn!(error = %e, "failed to subscribe to realtime updates, retrying");
                if *shutdown.borrow() {
                    return;
                }
                tokio::time::sleep(StdDuration::from_secs(1)).await;
                continue 'resubscribe;
            }
        };

        loop {
            tokio::select! {
                raw = rx.recv() => {
                    match raw {
                        Some(event) => {
                            handle_raw(event, &mut pending, &ledger, &retry, &config, &queue, &reconcile_trigger).await;
                        }
                        None => {
                            if *shutdown.borrow() {
                                return;
                            }
                            warn!("realtime subscription closed, resubscribing");
                            continue 'resubscribe;
                        }
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }
}

async fn handle_raw(
    raw: RawEvent,
    pending: &mut HashMap<String, PendingEvent>,
    ledger: &Arc<Ledger>,
    retry: &Arc<RetryCounter>,
    config: &Arc<Config>,
    queue: &EventQueue,
    reconcile_trigger: &mpsc::Sender<()>,
) {
    match raw {
        RawEvent::Add { event_id, camera_id, event_type, start_ts } => {
            pending.insert(
                event_id,
                PendingEvent { camera_id, event_type, start_ts, smart_detect_types: BTreeSet::new() },
            );
        }
        RawEvent::Update { event_id, end_ts, smart_detect_types } => {
            let Some(entry) = pending.get_mut(&event_id) else {
                debug!(event_id = %event_id, "update for an unknown or already-flushed event, ignoring");
                return;
            };
            entry.smart_detect_types.extend(smart_detect_types);
            let Some(end_ts) = end_ts else { return };

            let entry = pending.remove(&event_id).expect("looked up above");
            if retry.is_banned(&event_id) {
                return;
            }
            match ledger.has(&event_id).await {
                Ok(true) => return,
                Ok(false) => {}
                Err(e) => {
                    warn!(event_id = %event_id, error = %e, "ledger lookup failed, dropping realtime event");
                    return;
                }
            }

            let event = Event {
                event_id,
                camera_id: entry.camera_id,
                event_type: entry.event_type,
                smart_detect_types: entry.smart_detect_types,
                start_ts: entry.start_ts,
                end_ts: Some(end_ts),
            };
            if !event.is_eligible(&config.detection_types, &config.ignored_cameras, config.max_event_length) {
                return;
            }
            let _ = queue.offer_realtime(event).await;
        }
        RawEvent::Reconnected => {
            pending.clear();
            let _ = reconcile_trigger.try_send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nvr::mock::MockNvrClient;
    use crate::queue;
    use crate::template::PathTemplate;

    fn test_config() -> Config {
        Config {
            address: "nvr.local".into(),
            port: 443,
            username: "admin".into(),
            password: "hunter2".into(),
            verify_ssl: true,
            rclone_destination: "b2:bucket".into(),
            retention: StdDuration::from_secs(7 * 86_400),
            rclone_args: vec![],
            rclone_purge_args: vec![],
            detection_types: [DetectionType::Motion].into_iter().collect(),
            ignored_cameras: std::collections::BTreeSet::new(),
            file_structure_format: PathTemplate::parse("{event.id}.mp4").unwrap(),
            sqlite_path: "./unused.sqlite".into(),
            download_buffer_size: 1024,
            purge_interval: StdDuration::from_secs(86_400),
            max_event_length: StdDuration::from_secs(7_200),
            skip_missing: false,
            notifiers: vec![],
            verbosity: 0,
        }
    }

    #[tokio::test]
    async fn add_then_update_with_end_ts_flushes_event() {
        let nvr = Arc::new(MockNvrClient::default());
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        let retry = Arc::new(RetryCounter::new(StdDuration::from_secs(3600)));
        let config = Arc::new(test_config());
        let (queue, mut queue_rx) = queue::bounded(8);
        let (trigger_tx, _trigger_rx) = mpsc::channel(1);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run(nvr.clone(), ledger, retry, config, queue, trigger_tx, shutdown_rx));
        let sub_tx = loop {
            if let Some(tx) = nvr.subscribe_tx.lock().clone() {
                break tx;
            }
            tokio::task::yield_now().await;
        };

        let start = Utc::now();
        sub_tx
            .send(RawEvent::Add {
                event_id: "E1".into(),
                camera_id: "cam1".into(),
                event_type: DetectionType::Motion,
                start_ts: start,
            })
            .await
            .unwrap();
        sub_tx
            .send(RawEvent::Update {
                event_id: "E1".into(),
                end_ts: Some(start + chrono::Duration::seconds(5)),
                smart_detect_types: BTreeSet::new(),
            })
            .await
            .unwrap();

        let flushed = queue_rx.recv().await.expect("expected a flushed event");
        assert_eq!(flushed.event_id, "E1");
        assert!(flushed.end_ts.is_some());

        handle.abort();
    }

    #[tokio::test]
    async fn update_without_end_ts_does_not_flush() {
        let nvr = Arc::new(MockNvrClient::default());
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        let retry = Arc::new(RetryCounter::new(StdDuration::from_secs(3600)));
        let config = Arc::new(test_config());
        let (queue, mut queue_rx) = queue::bounded(8);
        let (trigger_tx, _trigger_rx) = mpsc::channel(1);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run(nvr.clone(), ledger, retry, config, queue, trigger_tx, shutdown_rx));
        let sub_tx = loop {
            if let Some(tx) = nvr.subscribe_tx.lock().clone() {
                break tx;
            }
            tokio::task::yield_now().await;
        };

        sub_tx
            .send(RawEvent::Add {
                event_id: "E1".into(),
                camera_id: "cam1".into(),
                event_type: DetectionType::Motion,
                start_ts: Utc::now(),
            })
            .await
            .unwrap();
        sub_tx
            .send(RawEvent::Update { event_id: "E1".into(), end_ts: None, smart_detect_types: ["person".to_string()].into_iter().collect() })
            .await
            .unwrap();

        assert!(tokio::time::timeout(StdDuration::from_millis(100), queue_rx.recv()).await.is_err());
        handle.abort();
    }
}

// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Download Stage.
//!
//! A single worker drains the event queue, double-checks the ledger (an
//! event can arrive from both the listener and the reconciler), waits out a
//! short grace period past `end_ts` so the NVR has had a chance to finalize
//! the clip, computes the remote path, and streams the clip into a
//! byte-handoff that the upload stage drains independently. A clip larger
//! than the handoff's byte budget never deadlocks — see `handoff.rs`.
//!
//! Once an event passes the ledger/ban checks it is marked in the shared
//! `InFlight` registry until the upload stage resolves it, so the
//! reconciler's backlog scan can't re-offer something still moving through
//! the pipeline (see `inflight.rs`).

use std::sync::Arc;
use std::time::Duration as StdDuration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::warn;

use crate::config::Config;
use crate::handoff::{self, HandoffReader, HandoffWriter};
use crate::inflight::InFlight;
use crate::ledger::Ledger;
use crate::model::{Camera, Event};
use crate::notify::{Level, Notifier};
use crate::nvr::{ClipByteStream, ClipFetchError, NvrClient};
use crate::queue::EventQueueReceiver;
use crate::retry::RetryCounter;

/// How long to wait after `end_ts` before fetching, so the NVR has finished
/// writing out the clip.
const POST_END_GRACE: StdDuration = StdDuration::from_secs(5);

/// One clip handed from the download stage to the upload stage: the
/// placement metadata plus the live handoff reader the uploader drains.
pub struct ClipJob {
    pub event: Event,
    pub camera: Camera,
    pub remote_path: String,
    pub reader: HandoffReader,
}

/// Run the download stage until the event queue closes or the upload stage
/// goes away.
pub async fn run(
    nvr: Arc<dyn NvrClient>,
    ledger: Arc<Ledger>,
    retry: Arc<RetryCounter>,
    notifier: Arc<Notifier>,
    config: Arc<Config>,
    inflight: Arc<InFlight>,
    mut events: EventQueueReceiver,
    clip_tx: mpsc::Sender<ClipJob>,
) {
    while let Some(event) = events.recv().await {
        if retry.is_banned(&event.event_id) {
            continue;
        }

        match ledger.has(&event.event_id).await {
            Ok(true) => continue,
            Ok(false) => {}
            Err(e) => {
                warn!(event_id = %event.event_id, error = %e, "ledger lookup failed, skipping this pass");
                continue;
            }
        }

        let Some(end_ts) = event.end_ts else { continue };

        // From here on this event is committed to the pipeline: mark it so
        // the reconciler doesn't offer it again before upload resolves it.
        inflight.mark(&event.event_id);

        let elapsed = chrono::Utc::now().signed_duration_since(end_ts).to_std().unwrap_or(StdDuration::ZERO);
        if elapsed < POST_END_GRACE {
            sleep(POST_END_GRACE - elapsed).await;
        }

        let camera = match nvr.camera(&event.camera_id).await {
            Ok(c) => c,
            Err(e) => {
                warn!(event_id = %event.event_id, error = %e, "camera lookup failed, skipping this pass");
                inflight.clear(&event.event_id);
                continue;
            }
        };
        let remote_path = config.file_structure_format.render(&event, &camera);

        let stream = match nvr.fetch_clip(&event.event_id, event.start_ts, end_ts).await {
            Ok(s) => s,
            Err(e) => {
                handle_fetch_error(&event, e, &retry, &notifier).await;
                inflight.clear(&event.event_id);
                continue;
            }
        };

        let (writer, reader) = handoff::channel(config.download_buffer_size as usize);
        tokio::spawn(pump_clip(event.event_id.clone(), stream, writer));

        let job = ClipJob { event, camera, remote_path, reader };
        if clip_tx.send(job).await.is_err() {
            // Upload stage is gone; the supervisor is shutting things down.
            return;
        }
    }
}

async fn pump_clip(event_id: String, mut stream: ClipByteStream, writer: HandoffWriter) {
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(bytes) => {
                if writer.write(bytes).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                warn!(event_id = %event_id, error = %e, "clip download stream failed");
                writer.abort(format!("clip stream error: {e}")).await;
                return;
            }
        }
    }
    writer.finish().await;
}

async fn handle_fetch_error(event: &Event, err: ClipFetchError, retry: &RetryCounter, notifier: &Notifier) {
    let attempts = retry.increment(&event.event_id);
    warn!(event_id = %event.event_id, attempts, error = %err, "clip fetch failed");
    if retry.is_banned(&event.event_id) {
        notifier
            .notify(
                Level::Error,
                "event permanently failed",
                &format!("{} exceeded the retry limit while fetching its clip: {err}", event.event_id),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DetectionType;
    use crate::nvr::mock::MockNvrClient;
    use crate::queue;
    use crate::template::PathTemplate;
    use bytes::Bytes;
    use std::collections::BTreeSet;

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
            ignored_cameras: BTreeSet::new(),
            file_structure_format: PathTemplate::parse("{camera_name}/{event.id}.mp4").unwrap(),
            sqlite_path: "./unused.sqlite".into(),
            download_buffer_size: 1024,
            purge_interval: StdDuration::from_secs(86_400),
            max_event_length: StdDuration::from_secs(7_200),
            skip_missing: false,
            notifiers: vec![],
            verbosity: 0,
        }
    }

    fn eligible_event(id: &str, camera_id: &str) -> Event {
        let end = chrono::Utc::now() - chrono::Duration::seconds(30);
        Event {
            event_id: id.to_string(),
            camera_id: camera_id.to_string(),
            event_type: DetectionType::Motion,
            smart_detect_types: BTreeSet::new(),
            start_ts: end - chrono::Duration::seconds(5),
            end_ts: Some(end),
        }
    }

    #[tokio::test]
    async fn downloads_eligible_event_and_emits_clip_job() {
        let nvr = Arc::new(MockNvrClient::default());
        nvr.cameras.lock().insert(
            "cam1".to_string(),
            Camera { camera_id: "cam1".into(), name: "Front".into(), tz_offset_seconds: 0 },
        );
        nvr.clips.lock().insert("E1".to_string(), vec![Ok(Bytes::from_static(b"abc"))]);

        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        let retry = Arc::new(RetryCounter::new(StdDuration::from_secs(3600)));
        let notifier = Arc::new(Notifier::new(vec![]));
        let config = Arc::new(test_config());
        let inflight = Arc::new(crate::inflight::InFlight::new());

        let (queue_tx, queue_rx) = queue::bounded(8);
        let (clip_tx, mut clip_rx) = mpsc::channel(1);

        queue_tx.offer_realtime(eligible_event("E1", "cam1")).await.unwrap();
        drop(queue_tx);

        let handle = tokio::spawn(run(
            nvr.clone(),
            ledger,
            retry,
            notifier,
            config,
            inflight.clone(),
            queue_rx,
            clip_tx,
        ));

        let job = clip_rx.recv().await.expect("expected a clip job");
        assert_eq!(job.remote_path, "Front/E1.mp4");
        assert!(inflight.contains("E1"));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn already_ledgered_event_is_skipped() {
        let nvr = Arc::new(MockNvrClient::default());
        let ledger = Arc::new(Ledger::open_in_memory().unwrap());
        let event = eligible_event("E1", "cam1");
        ledger
            .put(&crate::ledger::LedgerRow {
                event_id: "E1".into(),
                event_type: "motion".into(),
                camera_id: "cam1".into(),
                start_ts: event.start_ts,
                end_ts: event.end_ts.unwrap(),
                remote_path: "already/there.mp4".into(),
                uploaded_at: chrono::Utc::now(),
            })
            .await
            .unwrap();

        let retry = Arc::new(RetryCounter::new(StdDuration::from_secs(3600)));
        let notifier = Arc::new(Notifier::new(vec![]));
        let config = Arc::new(test_config());
        let inflight = Arc::new(crate::inflight::InFlight::new());

        let (queue_tx, queue_rx) = queue::bounded(8);
        let (clip_tx, mut clip_rx) = mpsc::channel(1);
        queue_tx.offer_realtime(event).await.unwrap();
        drop(queue_tx);

        let handle =
            tokio::spawn(run(nvr, ledger.clone(), retry, notifier, config, inflight.clone(), queue_rx, clip_tx));
        assert!(clip_rx.recv().await.is_none());
        handle.await.unwrap();
        assert!(!inflight.contains("E1"));
    }
}

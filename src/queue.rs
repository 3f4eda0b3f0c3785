// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! The event queue between the listener/reconciler and the download stage.
//!
//! Backed by two bounded `mpsc` channels rather than one, so the realtime
//! producer can be given priority over the reconciler's backlog scan — a
//! large backlog scan should never delay live events.
//! [`EventQueueReceiver::recv`] is a biased select that always drains the
//! realtime channel first.

use tokio::sync::mpsc;

use crate::model::Event;

/// Producer handle, cloned into the listener and the reconciler.
#[derive(Clone)]
pub struct EventQueue {
    realtime: mpsc::Sender<Event>,
    reconciler: mpsc::Sender<Event>,
}

/// Consumer handle, owned exclusively by the download stage.
pub struct EventQueueReceiver {
    realtime: mpsc::Receiver<Event>,
    reconciler: mpsc::Receiver<Event>,
    realtime_closed: bool,
    reconciler_closed: bool,
}

/// Create a bounded event queue. `depth` is the capacity of each of the two
/// underlying channels — unrelated to `--download-buffer-size`, which bounds
/// the separate byte handoff; this is the event queue's own, smaller bound.
pub fn bounded(depth: usize) -> (EventQueue, EventQueueReceiver) {
    let (rt_tx, rt_rx) = mpsc::channel(depth.max(1));
    let (rc_tx, rc_rx) = mpsc::channel(depth.max(1));
    (
        EventQueue { realtime: rt_tx, reconciler: rc_tx },
        EventQueueReceiver {
            realtime: rt_rx,
            reconciler: rc_rx,
            realtime_closed: false,
            reconciler_closed: false,
        },
    )
}

impl EventQueue {
    /// Offer an event from the realtime listener. Blocks if the queue is
    /// full rather than dropping work.
    pub async fn offer_realtime(&self, event: Event) -> Result<(), Event> {
        self.realtime.send(event).await.map_err(|e| e.0)
    }

    /// Offer an event from the reconciler's backlog scan. Blocks if full.
    pub async fn offer_reconciler(&self, event: Event) -> Result<(), Event> {
        self.reconciler.send(event).await.map_err(|e| e.0)
    }
}

impl EventQueueReceiver {
    /// Receive the next event, always preferring one waiting on the
    /// realtime channel over one waiting on the reconciler channel.
    /// Returns `None` once both producers have shut down.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            if self.realtime_closed && self.reconciler_closed {
                return None;
            }
            tokio::select! {
                biased;
                msg = self.realtime.recv(), if !self.realtime_closed => {
                    match msg {
                        Some(e) => return Some(e),
                        None => { self.realtime_closed = true; continue; }
                    }
                }
                msg = self.reconciler.recv(), if !self.reconciler_closed => {
                    match msg {
                        Some(e) => return Some(e),
                        None => { self.reconciler_closed = true; continue; }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn dummy_event(id: &str) -> Event {
        Event {
            event_id: id.to_string(),
            camera_id: "cam1".to_string(),
            event_type: crate::model::DetectionType::Motion,
            smart_detect_types: BTreeSet::new(),
            start_ts: chrono::Utc::now(),
            end_ts: Some(chrono::Utc::now()),
        }
    }

    #[tokio::test]
    async fn realtime_is_drained_before_reconciler() {
        let (queue, mut rx) = bounded(8);
        queue.offer_reconciler(dummy_event("backlog")).await.unwrap();
        queue.offer_realtime(dummy_event("live")).await.unwrap();

        let first = rx.recv().await.unwrap();
        assert_eq!(first.event_id, "live");
        let second = rx.recv().await.unwrap();
        assert_eq!(second.event_id, "backlog");
    }

    #[tokio::test]
    async fn recv_returns_none_once_both_closed() {
        let (queue, mut rx) = bounded(8);
        drop(queue);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn reconciler_still_flows_when_realtime_idle() {
        let (queue, mut rx) = bounded(8);
        queue.offer_reconciler(dummy_event("e1")).await.unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.event_id, "e1");
    }
}

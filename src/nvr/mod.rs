// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! NVR Adapter.
//!
//! The core pipeline only depends on the [`NvrClient`] trait contract;
//! [`client::UnifiProtectClient`] is one
//! concrete implementation of it, kept intentionally thin (a simplified
//! JSON realtime protocol rather than the real binary UniFi Protect
//! update-socket format — see DESIGN.md). Anything pipeline-shaped is
//! written against the trait so it is trivially testable against a fake.

pub mod client;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use crate::model::{Camera, Event};

/// A message delivered by [`NvrClient::subscribe`].
#[derive(Debug, Clone)]
pub enum RawEvent {
    /// A new event started; `end_ts` is not yet known.
    Add {
        event_id: String,
        camera_id: String,
        event_type: crate::model::DetectionType,
        start_ts: DateTime<Utc>,
    },
    /// An existing event was updated, typically carrying the final `end_ts`.
    Update {
        event_id: String,
        end_ts: Option<DateTime<Utc>>,
        smart_detect_types: std::collections::BTreeSet<String>,
    },
    /// The realtime connection was lost and has been transparently
    /// re-established; the reconciler should run immediately.
    Reconnected,
}

/// Outcome of a [`NvrClient::fetch_clip`] call that didn't produce a stream.
#[derive(Debug, thiserror::Error)]
pub enum ClipFetchError {
    #[error("clip not yet ready")]
    NotReady,
    #[error("clip not found")]
    NotFound,
    #[error("transient fetch error: {0}")]
    Transient(String),
}

impl ClipFetchError {
    /// NotReady and NotFound are retryable up to MAX_ATTEMPTS; a
    /// transient network error is too.
    pub fn is_retryable(&self) -> bool {
        true
    }
}

/// A byte stream of clip payload, as produced by `fetch_clip`. Chunks are
/// fallible so a mid-stream I/O error surfaces to the download stage, which
/// closes the handoff with its error flag rather than writing a partial
/// object.
pub type ClipByteStream = BoxStream<'static, std::io::Result<Bytes>>;

/// The contract the core pipeline depends on. `NotReady`/`NotFound` instead
/// of panicking on a cold clip is the entire reason this is a trait and not
/// a bare HTTP client buried in the download stage: the pipeline retries,
/// doesn't crash.
#[async_trait]
pub trait NvrClient: Send + Sync {
    /// Subscribe to the realtime event stream. The returned receiver never
    /// closes for reasons other than shutdown — reconnection on connection
    /// loss is transparent to the caller, surfaced only as `Reconnected`.
    async fn subscribe(&self) -> crate::error::Result<mpsc::Receiver<RawEvent>>;

    /// Historical events with `end_ts` in `[from_ts, to_ts]`, paginated
    /// internally by the implementation. Only events whose `end_ts` is set
    /// are returned.
    async fn list_events(&self, from_ts: DateTime<Utc>, to_ts: DateTime<Utc>) -> crate::error::Result<Vec<Event>>;

    /// Fetch the clip payload for `event_id` covering `[start_ts, end_ts]`.
    async fn fetch_clip(
        &self,
        event_id: &str,
        start_ts: DateTime<Utc>,
        end_ts: DateTime<Utc>,
    ) -> Result<ClipByteStream, ClipFetchError>;

    /// Look up camera metadata, refreshing the bootstrap cache on a miss
    /// rather than failing — a newly-added camera must never crash the
    /// agent.
    async fn camera(&self, camera_id: &str) -> crate::error::Result<Camera>;
}

/// A fully scriptable fake [`NvrClient`], kept alongside the production
/// adapter rather than `#[cfg(test)]`-gated so integration tests under
/// `tests/` can use it too, the same reasoning as `transfer::FakeTransfer`.
pub mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::sync::Arc;

    /// A fully scriptable fake [`NvrClient`] for pipeline tests.
    #[derive(Default)]
    pub struct MockNvrClient {
        pub events: Mutex<Vec<Event>>,
        pub cameras: Mutex<HashMap<String, Camera>>,
        pub clips: Mutex<HashMap<String, Vec<Result<Bytes, String>>>>,
        pub subscribe_tx: Mutex<Option<mpsc::Sender<RawEvent>>>,
        pub fetch_calls: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl NvrClient for MockNvrClient {
        async fn subscribe(&self) -> crate::error::Result<mpsc::Receiver<RawEvent>> {
            let (tx, rx) = mpsc::channel(64);
            *self.subscribe_tx.lock() = Some(tx);
            Ok(rx)
        }

        async fn list_events(&self, from_ts: DateTime<Utc>, to_ts: DateTime<Utc>) -> crate::error::Result<Vec<Event>> {
            Ok(self
                .events
                .lock()
                .iter()
                .filter(|e| matches!(e.end_ts, Some(end) if end >= from_ts && end <= to_ts))
                .cloned()
                .collect())
        }

        async fn fetch_clip(
            &self,
            event_id: &str,
            _start_ts: DateTime<Utc>,
            _end_ts: DateTime<Utc>,
        ) -> Result<ClipByteStream, ClipFetchError> {
            self.fetch_calls.lock().push(event_id.to_string());
            let chunks = self
                .clips
                .lock()
                .get(event_id)
                .cloned()
                .ok_or(ClipFetchError::NotFound)?;
            use futures::stream;
            let stream = stream::iter(chunks.into_iter().map(|c| {
                c.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
            }));
            Ok(Box::pin(stream))
        }

        async fn camera(&self, camera_id: &str) -> crate::error::Result<Camera> {
            self.cameras
                .lock()
                .get(camera_id)
                .cloned()
                .ok_or_else(|| crate::error::BackupError::Transient(format!("unknown camera {camera_id}")))
        }
    }
}

// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Concrete [`super::NvrClient`] implementation talking to a real UniFi
//! Protect NVR: REST for bootstrap/list/fetch, a WebSocket for the realtime
//! feed. The realtime wire format here is a simplified JSON envelope rather
//! than Protect's real binary update-socket protocol (documented
//! simplification — see DESIGN.md); the pipeline only depends on the
//! [`super::NvrClient`] trait, so swapping this adapter for one that speaks
//! the exact wire protocol never touches the core.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rand::Rng;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::{BackupError, Result};
use crate::model::{Camera, Event};

use super::{ClipByteStream, ClipFetchError, NvrClient, RawEvent};

const EVENTS_PAGE_SIZE: usize = 500;
const LIVENESS_TIMEOUT: Duration = Duration::from_secs(30);
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(60);
const CAMERA_CACHE_TTL: Duration = Duration::from_secs(300);

/// Configuration needed to reach the NVR, distinct from the agent-wide
/// [`crate::config::Config`] so the adapter stays independently testable.
#[derive(Debug, Clone)]
pub struct NvrEndpoint {
    pub address: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub verify_ssl: bool,
}

impl NvrEndpoint {
    fn base_url(&self) -> String {
        format!("https://{}:{}", self.address, self.port)
    }

    fn ws_url(&self) -> String {
        format!("wss://{}:{}/proxy/protect/ws/updates", self.address, self.port)
    }
}

struct CachedCamera {
    camera: Camera,
    fetched_at: std::time::Instant,
}

/// The production [`NvrClient`]: a logged-in `reqwest` client plus a
/// read-mostly camera cache refreshed on TTL expiry or cache miss.
pub struct UnifiProtectClient {
    endpoint: NvrEndpoint,
    http: reqwest::Client,
    camera_cache: Arc<RwLock<std::collections::HashMap<String, CachedCamera>>>,
}

impl UnifiProtectClient {
    pub async fn connect(endpoint: NvrEndpoint) -> Result<Self> {
        let http = reqwest::Client::builder()
            .danger_accept_invalid_certs(!endpoint.verify_ssl)
            .cookie_store(true)
            .build()
            .map_err(|e| BackupError::Fatal(format!("cannot build HTTP client: {e}")))?;

        let login_url = format!("{}/api/auth/login", endpoint.base_url());
        http.post(&login_url)
            .json(&serde_json::json!({
                "username": endpoint.username,
                "password": endpoint.password,
            }))
            .send()
            .await
            .map_err(|e| BackupError::Transient(format!("login request failed: {e}")))?
            .error_for_status()
            .map_err(|e| BackupError::Config(format!("login rejected: {e}")))?;

        info!(address = %endpoint.address, "authenticated with NVR");

        Ok(UnifiProtectClient {
            endpoint,
            http,
            camera_cache: Arc::new(RwLock::new(std::collections::HashMap::new())),
        })
    }

    async fn bootstrap_cameras(&self) -> Result<Vec<Camera>> {
        let url = format!("{}/proxy/protect/api/bootstrap", self.endpoint.base_url());
        let resp: BootstrapResponse = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| BackupError::Transient(format!("bootstrap request failed: {e}")))?
            .json()
            .await
            .map_err(|e| BackupError::Transient(format!("bootstrap decode failed: {e}")))?;

        Ok(resp
            .cameras
            .into_iter()
            .map(|c| Camera {
                camera_id: c.id,
                name: c.name,
                tz_offset_seconds: resp.nvr.time_zone_offset_seconds,
            })
            .collect())
    }
}

#[async_trait]
impl NvrClient for UnifiProtectClient {
    async fn subscribe(&self) -> Result<mpsc::Receiver<RawEvent>> {
        let (tx, rx) = mpsc::channel(256);
        let ws_url = self.endpoint.ws_url();
        tokio::spawn(realtime_loop(ws_url, tx));
        Ok(rx)
    }

    async fn list_events(&self, from_ts: DateTime<Utc>, to_ts: DateTime<Utc>) -> Result<Vec<Event>> {
        let mut out = Vec::new();
        let mut offset = 0usize;
        loop {
            let url = format!(
                "{}/proxy/protect/api/events?start={}&end={}&limit={}&offset={}",
                self.endpoint.base_url(),
                from_ts.timestamp_millis(),
                to_ts.timestamp_millis(),
                EVENTS_PAGE_SIZE,
                offset,
            );
            let page: Vec<WireEvent> = self
                .http
                .get(&url)
                .send()
                .await
                .map_err(|e| BackupError::Transient(format!("list_events request failed: {e}")))?
                .json()
                .await
                .map_err(|e| BackupError::Transient(format!("list_events decode failed: {e}")))?;

            let page_len = page.len();
            out.extend(page.into_iter().filter_map(|e| e.into_event()));

            if page_len < EVENTS_PAGE_SIZE {
                break;
            }
            offset += EVENTS_PAGE_SIZE;
        }
        Ok(out)
    }

    async fn fetch_clip(
        &self,
        event_id: &str,
        start_ts: DateTime<Utc>,
        end_ts: DateTime<Utc>,
    ) -> std::result::Result<ClipByteStream, ClipFetchError> {
        let url = format!(
            "{}/proxy/protect/api/video/export?start={}&end={}",
            self.endpoint.base_url(),
            start_ts.timestamp_millis(),
            end_ts.timestamp_millis(),
        );
        let resp = self
            .http
            .get(&url)
            .query(&[("camera", event_id)])
            .send()
            .await
            .map_err(|e| ClipFetchError::Transient(e.to_string()))?;

        match resp.status() {
            s if s.is_success() => {
                let stream = resp
                    .bytes_stream()
                    .map(|r| r.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)));
                Ok(Box::pin(stream))
            }
            reqwest::StatusCode::NOT_FOUND => Err(ClipFetchError::NotFound),
            reqwest::StatusCode::SERVICE_UNAVAILABLE | reqwest::StatusCode::TOO_MANY_REQUESTS => {
                Err(ClipFetchError::NotReady)
            }
            s => Err(ClipFetchError::Transient(format!("unexpected status {s}"))),
        }
    }

    async fn camera(&self, camera_id: &str) -> Result<Camera> {
        if let Some(cached) = self.camera_cache.read().get(camera_id) {
            if cached.fetched_at.elapsed() < CAMERA_CACHE_TTL {
                return Ok(cached.camera.clone());
            }
        }

        // Cache miss or stale: bootstrap refresh, never a hard failure for
        // an unknown camera — it may simply have been added after startup.
        let cameras = self.bootstrap_cameras().await?;
        let mut cache = self.camera_cache.write();
        for camera in &cameras {
            cache.insert(
                camera.camera_id.clone(),
                CachedCamera { camera: camera.clone(), fetched_at: std::time::Instant::now() },
            );
        }
        cache
            .get(camera_id)
            .map(|c| c.camera.clone())
            .ok_or_else(|| BackupError::Transient(format!("camera '{camera_id}' not found after bootstrap refresh")))
    }
}

/// Drives the realtime WebSocket, reconnecting on liveness timeout or
/// connection loss with exponential backoff + full jitter, and
/// emitting `RawEvent::Reconnected` on every successful reconnect so the
/// reconciler is triggered.
async fn realtime_loop(ws_url: String, tx: mpsc::Sender<RawEvent>) {
    let mut backoff = BACKOFF_INITIAL;
    let mut first_connect = true;

    loop {
        match tokio_tungstenite::connect_async(&ws_url).await {
            Ok((ws, _resp)) => {
                backoff = BACKOFF_INITIAL;
                if !first_connect {
                    if tx.send(RawEvent::Reconnected).await.is_err() {
                        return;
                    }
                }
                first_connect = false;

                if let Err(e) = drive_socket(ws, &tx).await {
                    warn!(error = %e, "realtime socket closed, reconnecting");
                }
            }
            Err(e) => {
                warn!(error = %e, "realtime connect failed, retrying");
            }
        }

        if tx.is_closed() {
            return;
        }
        let jittered = jitter(backoff);
        tokio::time::sleep(jittered).await;
        backoff = (backoff * 2).min(BACKOFF_CAP);
    }
}

fn jitter(d: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let millis = d.as_millis() as u64;
    Duration::from_millis(rng.gen_range(0..=millis.max(1)))
}

async fn drive_socket(
    mut ws: tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    tx: &mpsc::Sender<RawEvent>,
) -> std::result::Result<(), String> {
    loop {
        let next = tokio::time::timeout(LIVENESS_TIMEOUT, ws.next()).await;
        let msg = match next {
            Ok(Some(Ok(m))) => m,
            Ok(Some(Err(e))) => return Err(e.to_string()),
            Ok(None) => return Err("socket closed by peer".to_string()),
            Err(_) => return Err("liveness timeout".to_string()),
        };

        match msg {
            Message::Text(text) => {
                if let Some(raw) = decode_update(&text) {
                    debug!(?raw, "realtime update");
                    if tx.send(raw).await.is_err() {
                        return Ok(());
                    }
                }
            }
            Message::Ping(payload) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Message::Close(_) => return Err("peer sent close frame".to_string()),
            _ => {}
        }
    }
}

fn decode_update(text: &str) -> Option<RawEvent> {
    let wire: WireUpdate = serde_json::from_str(text).ok()?;
    match wire.action.as_str() {
        "add" => Some(RawEvent::Add {
            event_id: wire.id,
            camera_id: wire.camera_id?,
            event_type: wire.event_type.unwrap_or_else(|| "motion".to_string()).parse().unwrap(),
            start_ts: ts_from_millis(wire.start_ts?),
        }),
        "update" => Some(RawEvent::Update {
            event_id: wire.id,
            end_ts: wire.end_ts.map(ts_from_millis),
            smart_detect_types: wire.smart_detect_types.unwrap_or_default().into_iter().collect(),
        }),
        _ => None,
    }
}

fn ts_from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

#[derive(Debug, Deserialize)]
struct WireUpdate {
    action: String,
    id: String,
    camera_id: Option<String>,
    event_type: Option<String>,
    start_ts: Option<i64>,
    end_ts: Option<i64>,
    smart_detect_types: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    id: String,
    camera_id: String,
    #[serde(rename = "type")]
    event_type: String,
    start_ts: i64,
    end_ts: Option<i64>,
    #[serde(default)]
    smart_detect_types: Vec<String>,
}

impl WireEvent {
    fn into_event(self) -> Option<Event> {
        let end_ts = self.end_ts?;
        Some(Event {
            event_id: self.id,
            camera_id: self.camera_id,
            event_type: self.event_type.parse().unwrap(),
            smart_detect_types: self.smart_detect_types.into_iter().collect::<BTreeSet<_>>(),
            start_ts: ts_from_millis(self.start_ts),
            end_ts: Some(ts_from_millis(end_ts)),
        })
    }
}

#[derive(Debug, Deserialize)]
struct BootstrapResponse {
    nvr: BootstrapNvr,
    cameras: Vec<BootstrapCamera>,
}

#[derive(Debug, Deserialize)]
struct BootstrapNvr {
    #[serde(default)]
    time_zone_offset_seconds: i32,
}

#[derive(Debug, Deserialize)]
struct BootstrapCamera {
    id: String,
    name: String,
}

// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Event ledger — the durable, single-file embedded SQL record of every
//! successfully uploaded event.
//!
//! All writes are serialized through a single connection guarded by a
//! `tokio::sync::Mutex`, the same "single writer" shape as the
//! `storage::global_writer` task elsewhere in this codebase, generalized
//! from an mpsc-fed worker to a mutex because ledger writes come from
//! exactly two call sites (upload success, purge) rather than a fan-in of
//! many camera workers. Reads take the same lock; SQLite serializes writers
//! regardless, and the ledger is not on the pipeline's hot path.
//!
//! Invariant enforced here: a row exists **iff** the clip is durably
//! uploaded. `put` is idempotent on `event_id` — a re-insert replaces
//! the row and the newest `remote_path` wins.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::{error, warn};

use crate::error::{BackupError, Result};
use crate::model::DetectionType;

/// A durable record of one successfully-uploaded event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerRow {
    pub event_id: String,
    pub event_type: String,
    pub camera_id: String,
    pub start_ts: DateTime<Utc>,
    pub end_ts: DateTime<Utc>,
    pub remote_path: String,
    pub uploaded_at: DateTime<Utc>,
}

/// Sentinel `remote_path` written for events seeded by `--skip-missing` at
/// first boot: present in the ledger so they're never re-fetched, but not a
/// real uploaded object.
pub const SKIP_MISSING_SENTINEL: &str = "__skip_missing_sentinel__";

const MAX_WRITE_RETRIES: u32 = 5;

/// The durable event ledger, backed by a local SQLite file.
pub struct Ledger {
    conn: Mutex<Connection>,
}

impl Ledger {
    /// Open (or create) the ledger file at `path`. Failure here is fatal —
    /// the caller should treat an `Err` as a reason to exit with a
    /// configuration/storage failure, not retry indefinitely.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)
            .map_err(|e| BackupError::Storage(format!("cannot open ledger at {path:?}: {e}")))?;
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| BackupError::Storage(format!("cannot set busy_timeout: {e}")))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                camera_id TEXT NOT NULL,
                start_ts INTEGER NOT NULL,
                end_ts INTEGER NOT NULL,
                remote_path TEXT NOT NULL,
                uploaded_at INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|e| BackupError::Storage(format!("cannot create events table: {e}")))?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS events_end_ts ON events(end_ts)",
            [],
        )
        .map_err(|e| BackupError::Storage(format!("cannot create end_ts index: {e}")))?;
        Ok(Ledger { conn: Mutex::new(conn) })
    }

    /// In-memory ledger for tests, backed by SQLite's `:memory:` database.
    /// Not `#[cfg(test)]`-gated so integration tests under `tests/` can use
    /// it too, the same reasoning as `transfer::FakeTransfer`.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| BackupError::Storage(format!("cannot open in-memory ledger: {e}")))?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                type TEXT NOT NULL,
                camera_id TEXT NOT NULL,
                start_ts INTEGER NOT NULL,
                end_ts INTEGER NOT NULL,
                remote_path TEXT NOT NULL,
                uploaded_at INTEGER NOT NULL
            )",
            [],
        )
        .map_err(|e| BackupError::Storage(format!("cannot create events table: {e}")))?;
        Ok(Ledger { conn: Mutex::new(conn) })
    }

    pub async fn has(&self, event_id: &str) -> Result<bool> {
        let conn = self.conn.lock().await;
        let exists: Option<i64> = conn
            .query_row("SELECT 1 FROM events WHERE id = ?1", params![event_id], |r| r.get(0))
            .optional()
            .map_err(|e| BackupError::Storage(format!("has({event_id}): {e}")))?;
        Ok(exists.is_some())
    }

    /// Idempotent insert: a re-insert for the same `event_id` replaces the
    /// row, so the newest `remote_path` wins. Transient write failures are
    /// retried with bounded backoff before escalating.
    pub async fn put(&self, row: &LedgerRow) -> Result<()> {
        let mut attempt = 0u32;
        loop {
            let result = self.put_once(row).await;
            match result {
                Ok(()) => return Ok(()),
                Err(e) if attempt < MAX_WRITE_RETRIES => {
                    attempt += 1;
                    warn!(event_id = %row.event_id, attempt, error = %e, "ledger write failed, retrying");
                    sleep(Duration::from_millis(100 * 2u64.pow(attempt))).await;
                }
                Err(e) => {
                    error!(event_id = %row.event_id, error = %e, "ledger write failed permanently");
                    return Err(BackupError::Storage(format!("put({}): {e}", row.event_id)));
                }
            }
        }
    }

    async fn put_once(&self, row: &LedgerRow) -> rusqlite::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO events (id, type, camera_id, start_ts, end_ts, remote_path, uploaded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(id) DO UPDATE SET
                type = excluded.type,
                camera_id = excluded.camera_id,
                start_ts = excluded.start_ts,
                end_ts = excluded.end_ts,
                remote_path = excluded.remote_path,
                uploaded_at = excluded.uploaded_at",
            params![
                row.event_id,
                row.event_type,
                row.camera_id,
                row.start_ts.timestamp(),
                row.end_ts.timestamp(),
                row.remote_path,
                row.uploaded_at.timestamp(),
            ],
        )?;
        Ok(())
    }

    pub async fn delete(&self, event_id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM events WHERE id = ?1", params![event_id])
            .map_err(|e| BackupError::Storage(format!("delete({event_id}): {e}")))?;
        Ok(())
    }

    /// Rows with `end_ts < cutoff_ts`, oldest first — the purger's work list.
    pub async fn iter_older_than(&self, cutoff_ts: DateTime<Utc>) -> Result<Vec<(String, String)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT id, remote_path FROM events WHERE end_ts < ?1 ORDER BY end_ts ASC")
            .map_err(|e| BackupError::Storage(format!("iter_older_than prepare: {e}")))?;
        let rows = stmt
            .query_map(params![cutoff_ts.timestamp()], |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })
            .map_err(|e| BackupError::Storage(format!("iter_older_than query: {e}")))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| BackupError::Storage(format!("iter_older_than row: {e}")))?);
        }
        Ok(out)
    }

    /// All `event_id`s with `end_ts` in `[from_ts, to_ts]`, used by the
    /// reconciler to diff against the NVR's history.
    pub async fn all_ids_in_window(
        &self,
        from_ts: DateTime<Utc>,
        to_ts: DateTime<Utc>,
    ) -> Result<std::collections::HashSet<String>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT id FROM events WHERE end_ts >= ?1 AND end_ts <= ?2")
            .map_err(|e| BackupError::Storage(format!("all_ids_in_window prepare: {e}")))?;
        let rows = stmt
            .query_map(params![from_ts.timestamp(), to_ts.timestamp()], |r| r.get::<_, String>(0))
            .map_err(|e| BackupError::Storage(format!("all_ids_in_window query: {e}")))?;
        let mut out = std::collections::HashSet::new();
        for row in rows {
            out.insert(row.map_err(|e| BackupError::Storage(format!("all_ids_in_window row: {e}")))?);
        }
        Ok(out)
    }

    /// Seed a synthetic "already uploaded" marker for `--skip-missing`.
    /// Persisted like any other row, so it survives restart.
    pub async fn seed_skip_missing(
        &self,
        event_id: &str,
        event_type: &DetectionType,
        camera_id: &str,
        start_ts: DateTime<Utc>,
        end_ts: DateTime<Utc>,
    ) -> Result<()> {
        self.put(&LedgerRow {
            event_id: event_id.to_string(),
            event_type: event_type.as_str().to_string(),
            camera_id: camera_id.to_string(),
            start_ts,
            end_ts,
            remote_path: SKIP_MISSING_SENTINEL.to_string(),
            uploaded_at: Utc::now(),
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(id: &str, end_secs_ago: i64) -> LedgerRow {
        let end_ts = Utc::now() - chrono::Duration::seconds(end_secs_ago);
        LedgerRow {
            event_id: id.to_string(),
            event_type: "motion".to_string(),
            camera_id: "cam1".to_string(),
            start_ts: end_ts - chrono::Duration::seconds(5),
            end_ts,
            remote_path: format!("path/{id}.mp4"),
            uploaded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn put_then_has_is_true() {
        let ledger = Ledger::open_in_memory().unwrap();
        assert!(!ledger.has("E1").await.unwrap());
        ledger.put(&row("E1", 10)).await.unwrap();
        assert!(ledger.has("E1").await.unwrap());
    }

    #[tokio::test]
    async fn put_is_idempotent_and_newest_path_wins() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.put(&row("E1", 10)).await.unwrap();
        let mut r2 = row("E1", 10);
        r2.remote_path = "path/E1-v2.mp4".to_string();
        ledger.put(&r2).await.unwrap();

        let ids = ledger
            .all_ids_in_window(Utc::now() - chrono::Duration::days(1), Utc::now())
            .await
            .unwrap();
        assert_eq!(ids.len(), 1);

        let older = ledger.iter_older_than(Utc::now() + chrono::Duration::days(1)).await.unwrap();
        assert_eq!(older.len(), 1);
        assert_eq!(older[0].1, "path/E1-v2.mp4");
    }

    #[tokio::test]
    async fn delete_removes_row() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.put(&row("E1", 10)).await.unwrap();
        ledger.delete("E1").await.unwrap();
        assert!(!ledger.has("E1").await.unwrap());
    }

    #[tokio::test]
    async fn iter_older_than_respects_cutoff() {
        let ledger = Ledger::open_in_memory().unwrap();
        ledger.put(&row("old", 8 * 86_400)).await.unwrap();
        ledger.put(&row("new", 1 * 86_400)).await.unwrap();

        let cutoff = Utc::now() - chrono::Duration::days(7);
        let older = ledger.iter_older_than(cutoff).await.unwrap();
        assert_eq!(older.len(), 1);
        assert_eq!(older[0].0, "old");
    }

    #[tokio::test]
    async fn skip_missing_seed_marks_event_present() {
        let ledger = Ledger::open_in_memory().unwrap();
        let now = Utc::now();
        ledger
            .seed_skip_missing("E1", &DetectionType::Motion, "cam1", now, now)
            .await
            .unwrap();
        assert!(ledger.has("E1").await.unwrap());
    }
}

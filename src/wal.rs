// =============================================================================
// Write-ahead log — append-only canonical JSON lines, fsync per record
// =============================================================================
//
// Each record is one canonical JSON line (sorted keys, ASCII, fixed field
// set) followed by an fsync. A sync failure is fatal to the process. Replay
// inserts every record into the event log deduplicated on a content hash,
// then adopts orphans: any ORDER_INTENT without a matching ORDER_RESULT or
// ORDER_INTENT_ABORTED becomes a PENDING_UNKNOWN order for the next
// reconciliation to resolve.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::store::{OrderRow, Store};
use crate::types::WalRecordType;

#[derive(Debug, Error)]
pub enum WalError {
    #[error("WAL not opened")]
    NotOpen,
    #[error("WAL sync failed: {0}")]
    Sync(String),
    #[error("WAL corrupted at line {line}: {msg}")]
    Corrupt { line: usize, msg: String },
    #[error("WAL replay failed: {0}")]
    Replay(String),
}

/// One WAL record as written to or read from disk.
#[derive(Debug, Clone)]
pub struct WalRecord {
    pub event_id: String,
    pub record_type: WalRecordType,
    pub ts_utc: String,
    pub payload: serde_json::Value,
}

impl WalRecord {
    /// The canonical on-disk line: sorted keys, compact, ASCII-safe.
    pub fn canonical_line(&self) -> String {
        let value = serde_json::json!({
            "event_id": self.event_id,
            "payload": self.payload,
            "record_type": self.record_type.as_str(),
            "ts_utc": self.ts_utc,
        });
        serde_json::to_string(&value).expect("WAL record serializes")
    }

    /// Content hash used as the event-log dedup key. Excludes the timestamp
    /// so a replayed file keeps deduplicating against itself.
    pub fn content_hash(&self) -> String {
        let value = serde_json::json!({
            "event_id": self.event_id,
            "payload": self.payload,
            "record_type": self.record_type.as_str(),
        });
        let canonical = serde_json::to_string(&value).expect("WAL record serializes");
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Append-only writer. One instance owns the file for the process lifetime.
#[derive(Debug)]
pub struct WalWriter {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl WalWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn open(&self) -> Result<(), WalError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| WalError::Sync(e.to_string()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| WalError::Sync(e.to_string()))?;
        *self.file.lock() = Some(file);
        Ok(())
    }

    pub fn close(&self) {
        *self.file.lock() = None;
    }

    /// Append one record and fsync. Any I/O failure is a [`WalError::Sync`]
    /// and must halt the process.
    pub fn append(
        &self,
        record_type: WalRecordType,
        payload: serde_json::Value,
    ) -> Result<WalRecord, WalError> {
        let record = WalRecord {
            event_id: Uuid::new_v4().to_string(),
            record_type,
            ts_utc: Utc::now().to_rfc3339(),
            payload,
        };
        let line = record.canonical_line();

        let mut guard = self.file.lock();
        let file = guard.as_mut().ok_or(WalError::NotOpen)?;
        write_synced_line(file, &line).map_err(|e| WalError::Sync(e.to_string()))?;

        debug!(record_type = %record.record_type, event_id = %record.event_id, "WAL record written");
        Ok(record)
    }
}

fn write_synced_line(file: &mut File, line: &str) -> std::io::Result<()> {
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    file.sync_all()
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

pub struct WalReader {
    path: PathBuf,
}

impl WalReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Read every record in offset order. A malformed line is a hard
    /// corruption error, not a skip.
    pub fn read_all(&self) -> Result<Vec<WalRecord>, WalError> {
        if !self.path.is_file() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&self.path)
            .map_err(|e| WalError::Sync(e.to_string()))?;

        let mut records = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let value: serde_json::Value =
                serde_json::from_str(line).map_err(|e| WalError::Corrupt {
                    line: idx + 1,
                    msg: e.to_string(),
                })?;

            let record_type = value
                .get("record_type")
                .and_then(|v| v.as_str())
                .and_then(WalRecordType::parse)
                .ok_or_else(|| WalError::Corrupt {
                    line: idx + 1,
                    msg: "invalid or missing record_type".to_string(),
                })?;

            records.push(WalRecord {
                event_id: value
                    .get("event_id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                record_type,
                ts_utc: value
                    .get("ts_utc")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                payload: value.get("payload").cloned().unwrap_or(serde_json::Value::Null),
            });
        }
        Ok(records)
    }
}

// ---------------------------------------------------------------------------
// Replay
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayStats {
    pub inserted: usize,
    pub skipped: usize,
    pub orphans_adopted: usize,
}

/// Replay the WAL into the event log and adopt orphan intents.
pub fn replay(path: &Path, store: &Store) -> Result<ReplayStats, WalError> {
    let records = WalReader::new(path).read_all()?;
    let mut stats = ReplayStats::default();
    if records.is_empty() {
        info!("WAL replay: no records");
        return Ok(stats);
    }

    // Index intents and their resolutions for orphan detection.
    let mut intents: Vec<&WalRecord> = Vec::new();
    let mut resolved: std::collections::HashSet<String> = std::collections::HashSet::new();
    for rec in &records {
        match rec.record_type {
            WalRecordType::OrderIntent => intents.push(rec),
            WalRecordType::OrderResult | WalRecordType::OrderIntentAborted => {
                if let Some(id) = rec.payload.get("decision_id_hex").and_then(|v| v.as_str()) {
                    resolved.insert(id.to_string());
                }
            }
            _ => {}
        }
    }

    for rec in &records {
        let inserted = store
            .insert_event(
                &rec.event_id,
                &rec.ts_utc,
                rec.record_type.as_str(),
                &rec.payload.to_string(),
                &rec.content_hash(),
            )
            .map_err(|e| WalError::Replay(format!("event insert for {}: {e}", rec.event_id)))?;
        if inserted {
            stats.inserted += 1;
        } else {
            stats.skipped += 1;
        }
    }

    for intent in intents {
        let decision_id = intent
            .payload
            .get("decision_id_hex")
            .and_then(|v| v.as_str())
            .unwrap_or(&intent.event_id)
            .to_string();
        if resolved.contains(&decision_id) {
            continue;
        }

        warn!(
            decision_id = %decision_id,
            "WAL orphan intent — adopting as PENDING_UNKNOWN"
        );
        let payload = &intent.payload;
        let order = OrderRow {
            local_order_id: Uuid::new_v4().to_string(),
            client_order_id: payload
                .get("client_order_id")
                .and_then(|v| v.as_str())
                .unwrap_or(&decision_id)
                .to_string(),
            decision_id_hex: decision_id.clone(),
            market_id: payload
                .get("market_id")
                .and_then(|v| v.as_str())
                .unwrap_or("UNKNOWN")
                .to_string(),
            side: payload
                .get("side")
                .and_then(|v| v.as_str())
                .unwrap_or("YES")
                .to_string(),
            status: "PENDING_UNKNOWN".to_string(),
            price: payload.get("price").and_then(|v| v.as_f64()).unwrap_or(0.0),
            size_usd: payload
                .get("size_usd")
                .and_then(|v| v.as_f64())
                .unwrap_or(0.0),
            created_at_utc: Utc::now().to_rfc3339(),
        };
        let adopted = store
            .insert_order_if_absent(&order)
            .map_err(|e| WalError::Replay(format!("orphan adoption for {decision_id}: {e}")))?;
        if adopted {
            stats.orphans_adopted += 1;
        }
    }

    info!(
        inserted = stats.inserted,
        skipped = stats.skipped,
        orphans = stats.orphans_adopted,
        "WAL replay complete"
    );
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writer_in(dir: &tempfile::TempDir) -> WalWriter {
        let w = WalWriter::new(dir.path().join("wal.log"));
        w.open().unwrap();
        w
    }

    #[test]
    fn append_writes_canonical_sorted_lines() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer_in(&dir);
        w.append(
            WalRecordType::OrderIntent,
            serde_json::json!({"market_id": "m1", "decision_id_hex": "abc"}),
        )
        .unwrap();

        let raw = std::fs::read_to_string(dir.path().join("wal.log")).unwrap();
        let line = raw.lines().next().unwrap();
        assert!(line.starts_with("{\"event_id\":"));
        // Keys in sorted order: event_id, payload, record_type, ts_utc.
        let event_pos = line.find("event_id").unwrap();
        let payload_pos = line.find("payload").unwrap();
        let type_pos = line.find("record_type").unwrap();
        let ts_pos = line.find("ts_utc").unwrap();
        assert!(event_pos < payload_pos && payload_pos < type_pos && type_pos < ts_pos);
    }

    #[test]
    fn append_without_open_fails() {
        let w = WalWriter::new("/tmp/never-opened-wal.log");
        let err = w.append(WalRecordType::StateChanged, serde_json::json!({})).unwrap_err();
        assert!(matches!(err, WalError::NotOpen));
    }

    #[test]
    fn reader_round_trips_records() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer_in(&dir);
        w.append(WalRecordType::StateChanged, serde_json::json!({"to": "PAPER_TRADING"}))
            .unwrap();
        w.append(
            WalRecordType::OrderIntent,
            serde_json::json!({"decision_id_hex": "abc123", "market_id": "m1"}),
        )
        .unwrap();

        let records = WalReader::new(dir.path().join("wal.log")).read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].record_type, WalRecordType::StateChanged);
        assert_eq!(records[1].record_type, WalRecordType::OrderIntent);
        assert_eq!(
            records[1].payload.get("decision_id_hex").unwrap().as_str(),
            Some("abc123")
        );
    }

    #[test]
    fn reader_rejects_corrupt_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wal.log");
        std::fs::write(&path, "{\"event_id\":\"a\"}\nnot json\n").unwrap();
        let err = WalReader::new(&path).read_all().unwrap_err();
        match err {
            WalError::Corrupt { line, .. } => assert_eq!(line, 2),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn missing_file_reads_empty() {
        let records = WalReader::new("/tmp/definitely-not-a-wal.log").read_all().unwrap();
        assert!(records.is_empty());
    }

    #[test]
    fn content_hash_ignores_timestamp() {
        let a = WalRecord {
            event_id: "e1".to_string(),
            record_type: WalRecordType::OrderIntent,
            ts_utc: "2026-01-01T00:00:00+00:00".to_string(),
            payload: serde_json::json!({"k": 1}),
        };
        let mut b = a.clone();
        b.ts_utc = "2026-01-02T00:00:00+00:00".to_string();
        assert_eq!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn replay_is_idempotent_and_adopts_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let w = writer_in(&dir);
        w.append(
            WalRecordType::OrderIntent,
            serde_json::json!({
                "decision_id_hex": "abc123",
                "market_id": "m1",
                "side": "YES",
                "price": 0.42,
                "size_usd": 2.0,
                "client_order_id": "abc123",
            }),
        )
        .unwrap();
        w.append(
            WalRecordType::OrderIntent,
            serde_json::json!({
                "decision_id_hex": "resolved-1",
                "market_id": "m2",
                "side": "NO",
                "price": 0.60,
                "size_usd": 1.0,
            }),
        )
        .unwrap();
        w.append(
            WalRecordType::OrderResult,
            serde_json::json!({"decision_id_hex": "resolved-1", "status": "FILLED"}),
        )
        .unwrap();

        let store = Store::open_in_memory().unwrap();
        store.migrate().unwrap();

        let stats = replay(&dir.path().join("wal.log"), &store).unwrap();
        assert_eq!(stats.inserted, 3);
        assert_eq!(stats.skipped, 0);
        // Only the unresolved intent is adopted.
        assert_eq!(stats.orphans_adopted, 1);
        assert_eq!(store.count_orders_with_status("PENDING_UNKNOWN").unwrap(), 1);
        let adopted = store.order_by_decision_id("abc123").unwrap().unwrap();
        assert_eq!(adopted.client_order_id, "abc123");
        assert_eq!(adopted.status, "PENDING_UNKNOWN");

        // Second replay: everything dedupes, event log unchanged.
        let count_before = store.event_count().unwrap();
        let stats2 = replay(&dir.path().join("wal.log"), &store).unwrap();
        assert_eq!(stats2.inserted, 0);
        assert_eq!(stats2.skipped, 3);
        assert_eq!(store.event_count().unwrap(), count_before);
        assert_eq!(store.count_orders_with_status("PENDING_UNKNOWN").unwrap(), 1);
    }
}

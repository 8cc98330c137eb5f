// =============================================================================
// Durable store — SQLite behind a narrow idempotent query surface
// =============================================================================
//
// Every write here is an upsert or an INSERT OR IGNORE; replaying the same
// inputs leaves the store unchanged. The event log deduplicates on a payload
// content hash, which is what makes WAL replay idempotent.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use tracing::info;

use crate::bot_state::BotState;
use crate::candidates::Candidate;
use crate::market_data::Snapshot;
use crate::registry::Market;
use crate::types::{BotStateKind, CandidateStatus, NoTradeReason};

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS markets (
    market_id            TEXT PRIMARY KEY,
    condition_id         TEXT NOT NULL DEFAULT '',
    category             TEXT NOT NULL DEFAULT '',
    title                TEXT NOT NULL DEFAULT '',
    description          TEXT NOT NULL DEFAULT '',
    resolution_source    TEXT NOT NULL DEFAULT '',
    end_date_utc         TEXT,
    yes_token_id         TEXT NOT NULL DEFAULT '',
    no_token_id          TEXT NOT NULL DEFAULT '',
    volume_24h_usd       REAL NOT NULL DEFAULT 0,
    liquidity_usd        REAL NOT NULL DEFAULT 0,
    critical_field_hash  TEXT NOT NULL DEFAULT '',
    is_binary_eligible   INTEGER NOT NULL DEFAULT 0,
    eligibility_reason   TEXT,
    frozen               INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS snapshots (
    snapshot_id              TEXT PRIMARY KEY,
    market_id                TEXT NOT NULL,
    snapshot_at_ms           INTEGER NOT NULL,
    source                   TEXT NOT NULL,
    ws_epoch                 INTEGER NOT NULL,
    ws_last_message_ms       INTEGER NOT NULL,
    market_last_update_ms    INTEGER,
    orderbook_last_change_ms INTEGER,
    best_bid_yes             REAL,
    best_ask_yes             REAL,
    best_bid_no              REAL,
    best_ask_no              REAL,
    depth_yes                TEXT NOT NULL DEFAULT '[]',
    depth_no                 TEXT NOT NULL DEFAULT '[]',
    orderbook_hash           TEXT NOT NULL,
    ask_sum_anomaly          INTEGER NOT NULL,
    invalid_book_anomaly     INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS candidates (
    candidate_id     TEXT PRIMARY KEY,
    market_id        TEXT NOT NULL,
    snapshot_id      TEXT NOT NULL,
    created_at_utc   TEXT NOT NULL,
    trigger_reasons  TEXT NOT NULL DEFAULT '[]',
    status           TEXT NOT NULL,
    filter_reason    TEXT,
    decision_id_hex  TEXT,
    intended_size_usd REAL NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS bot_state (
    id                 INTEGER PRIMARY KEY CHECK (id = 1),
    state              TEXT NOT NULL,
    counter            INTEGER NOT NULL,
    ts_utc             TEXT NOT NULL,
    armed_until_utc    TEXT,
    halt_until_utc     TEXT,
    halt_resume_state  TEXT,
    state_signature    TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS watchlist (
    market_id       TEXT PRIMARY KEY,
    score           REAL NOT NULL,
    added_at_utc    TEXT NOT NULL,
    last_scored_utc TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS probation (
    market_id           TEXT PRIMARY KEY,
    reason              TEXT NOT NULL,
    anomaly_count       INTEGER NOT NULL DEFAULT 1,
    probation_until_utc TEXT NOT NULL,
    added_at_utc        TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS quarantine (
    market_id            TEXT PRIMARY KEY,
    trigger_count_hour   INTEGER NOT NULL DEFAULT 0,
    no_trade_count_hour  INTEGER NOT NULL DEFAULT 0,
    quarantine_until_utc TEXT NOT NULL,
    added_at_utc         TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS orders (
    local_order_id   TEXT PRIMARY KEY,
    client_order_id  TEXT NOT NULL,
    decision_id_hex  TEXT NOT NULL UNIQUE,
    market_id        TEXT NOT NULL,
    side             TEXT NOT NULL,
    status           TEXT NOT NULL,
    price            REAL NOT NULL DEFAULT 0,
    size_usd         REAL NOT NULL DEFAULT 0,
    created_at_utc   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS event_log (
    event_id     TEXT NOT NULL,
    ts_utc       TEXT NOT NULL,
    event_type   TEXT NOT NULL,
    payload      TEXT NOT NULL,
    payload_hash TEXT NOT NULL UNIQUE
);

CREATE INDEX IF NOT EXISTS idx_snapshots_market ON snapshots (market_id, snapshot_at_ms);
CREATE INDEX IF NOT EXISTS idx_candidates_market ON candidates (market_id, created_at_utc);
CREATE INDEX IF NOT EXISTS idx_orders_status ON orders (status);
"#;

/// An order row as persisted. Adopted orphans carry status PENDING_UNKNOWN.
#[derive(Debug, Clone)]
pub struct OrderRow {
    pub local_order_id: String,
    pub client_order_id: String,
    pub decision_id_hex: String,
    pub market_id: String,
    pub side: String,
    pub status: String,
    pub price: f64,
    pub size_usd: f64,
    pub created_at_utc: String,
}

/// SQLite-backed durable store.
#[derive(Debug)]
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating store directory {}", parent.display()))?;
        }
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )
        .with_context(|| format!("opening store at {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("enabling store WAL mode")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("opening in-memory store")?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute_batch(SCHEMA_SQL).context("running store schema")?;
        info!("store schema ready");
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Markets
    // -------------------------------------------------------------------------

    pub fn upsert_market(&self, m: &Market) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO markets (
                market_id, condition_id, category, title, description,
                resolution_source, end_date_utc, yes_token_id, no_token_id,
                volume_24h_usd, liquidity_usd, critical_field_hash,
                is_binary_eligible, eligibility_reason, frozen
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)
            ON CONFLICT (market_id) DO UPDATE SET
                condition_id = excluded.condition_id,
                category = excluded.category,
                title = excluded.title,
                description = excluded.description,
                resolution_source = excluded.resolution_source,
                end_date_utc = excluded.end_date_utc,
                yes_token_id = excluded.yes_token_id,
                no_token_id = excluded.no_token_id,
                volume_24h_usd = excluded.volume_24h_usd,
                liquidity_usd = excluded.liquidity_usd,
                critical_field_hash = excluded.critical_field_hash,
                is_binary_eligible = excluded.is_binary_eligible,
                eligibility_reason = excluded.eligibility_reason,
                frozen = excluded.frozen
            "#,
            params![
                m.market_id,
                m.condition_id,
                m.category,
                m.title,
                m.description,
                m.resolution_source,
                m.end_date_utc.map(|t| t.to_rfc3339()),
                m.yes_token_id,
                m.no_token_id,
                m.volume_24h_usd,
                m.liquidity_usd,
                m.critical_field_hash,
                m.is_binary_eligible as i64,
                m.eligibility_reason,
                m.frozen as i64,
            ],
        )
        .context("upserting market")?;
        Ok(())
    }

    pub fn market_hash(&self, market_id: &str) -> Result<Option<(String, bool)>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT critical_field_hash, frozen FROM markets WHERE market_id = ?1")?;
        let mut rows = stmt.query(params![market_id])?;
        match rows.next()? {
            Some(row) => Ok(Some((row.get(0)?, row.get::<_, i64>(1)? != 0))),
            None => Ok(None),
        }
    }

    /// Freeze a market whose critical fields changed.
    pub fn freeze_market(&self, market_id: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE markets SET frozen = 1 WHERE market_id = ?1",
            params![market_id],
        )
        .context("freezing market")?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Snapshots / candidates
    // -------------------------------------------------------------------------

    pub fn insert_snapshot(&self, s: &Snapshot) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT OR IGNORE INTO snapshots (
                snapshot_id, market_id, snapshot_at_ms, source, ws_epoch,
                ws_last_message_ms, market_last_update_ms,
                orderbook_last_change_ms, best_bid_yes, best_ask_yes,
                best_bid_no, best_ask_no, depth_yes, depth_no,
                orderbook_hash, ask_sum_anomaly, invalid_book_anomaly
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17)
            "#,
            params![
                s.snapshot_id,
                s.market_id,
                s.snapshot_at_ms,
                s.source.as_str(),
                s.ws_epoch as i64,
                s.ws_last_message_ms,
                s.market_last_update_ms,
                s.orderbook_last_change_ms,
                s.best_bid_yes,
                s.best_ask_yes,
                s.best_bid_no,
                s.best_ask_no,
                serde_json::to_string(&s.depth_yes)?,
                serde_json::to_string(&s.depth_no)?,
                s.orderbook_hash,
                s.ask_sum_anomaly as i64,
                s.invalid_book_anomaly as i64,
            ],
        )
        .context("inserting snapshot")?;
        Ok(())
    }

    pub fn upsert_candidate(&self, c: &Candidate) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO candidates (
                candidate_id, market_id, snapshot_id, created_at_utc,
                trigger_reasons, status, filter_reason, decision_id_hex,
                intended_size_usd
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
            ON CONFLICT (candidate_id) DO UPDATE SET
                status = excluded.status,
                filter_reason = excluded.filter_reason,
                decision_id_hex = excluded.decision_id_hex,
                intended_size_usd = excluded.intended_size_usd
            "#,
            params![
                c.candidate_id,
                c.market_id,
                c.snapshot_id,
                c.created_at.to_rfc3339(),
                serde_json::to_string(&c.trigger_reasons)?,
                c.status.as_str(),
                c.filter_reason.map(|r| r.as_str()),
                c.decision_id_hex,
                c.intended_size_usd,
            ],
        )
        .context("upserting candidate")?;
        Ok(())
    }

    pub fn candidate_status(&self, candidate_id: &str) -> Result<Option<CandidateStatus>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT status FROM candidates WHERE candidate_id = ?1")?;
        let mut rows = stmt.query(params![candidate_id])?;
        match rows.next()? {
            Some(row) => {
                let status: String = row.get(0)?;
                Ok(parse_candidate_status(&status))
            }
            None => Ok(None),
        }
    }

    // -------------------------------------------------------------------------
    // Bot state
    // -------------------------------------------------------------------------

    pub fn load_bot_state(&self) -> Result<Option<BotState>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT state, counter, ts_utc, armed_until_utc, halt_until_utc, \
             halt_resume_state, state_signature FROM bot_state WHERE id = 1",
        )?;
        let mut rows = stmt.query([])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };

        let state_str: String = row.get(0)?;
        let state = BotStateKind::parse(&state_str)
            .with_context(|| format!("invalid persisted bot state '{state_str}'"))?;
        let halt_resume: Option<String> = row.get(5)?;
        let signature_hex: String = row.get(6)?;

        Ok(Some(BotState {
            state,
            counter: row.get(1)?,
            ts_utc: row.get::<_, String>(2)?,
            armed_until_utc: row.get(3)?,
            halt_until_utc: row.get(4)?,
            halt_resume_state: halt_resume.as_deref().and_then(BotStateKind::parse),
            signature: hex::decode(&signature_hex).context("decoding state signature")?,
        }))
    }

    pub fn save_bot_state(&self, bs: &BotState) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO bot_state (
                id, state, counter, ts_utc, armed_until_utc, halt_until_utc,
                halt_resume_state, state_signature
            ) VALUES (1,?1,?2,?3,?4,?5,?6,?7)
            ON CONFLICT (id) DO UPDATE SET
                state = excluded.state,
                counter = excluded.counter,
                ts_utc = excluded.ts_utc,
                armed_until_utc = excluded.armed_until_utc,
                halt_until_utc = excluded.halt_until_utc,
                halt_resume_state = excluded.halt_resume_state,
                state_signature = excluded.state_signature
            "#,
            params![
                bs.state.as_str(),
                bs.counter,
                bs.ts_utc,
                bs.armed_until_utc,
                bs.halt_until_utc,
                bs.halt_resume_state.map(|s| s.as_str()),
                hex::encode(&bs.signature),
            ],
        )
        .context("saving bot state")?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Watchlist / probation / quarantine
    // -------------------------------------------------------------------------

    pub fn replace_watchlist(&self, entries: &[(String, f64)], now_utc: &str) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM watchlist", [])?;
        for (market_id, score) in entries {
            tx.execute(
                "INSERT INTO watchlist (market_id, score, added_at_utc, last_scored_utc) \
                 VALUES (?1, ?2, ?3, ?3)",
                params![market_id, score, now_utc],
            )?;
        }
        tx.commit().context("replacing watchlist")?;
        Ok(())
    }

    pub fn watchlist_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT market_id FROM watchlist ORDER BY score DESC")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn upsert_probation(
        &self,
        market_id: &str,
        reason: &str,
        until_utc: &str,
        now_utc: &str,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO probation (market_id, reason, anomaly_count, probation_until_utc, added_at_utc)
            VALUES (?1, ?2, 1, ?3, ?4)
            ON CONFLICT (market_id) DO UPDATE SET
                reason = excluded.reason,
                anomaly_count = probation.anomaly_count + 1,
                probation_until_utc = excluded.probation_until_utc
            "#,
            params![market_id, reason, until_utc, now_utc],
        )
        .context("upserting probation")?;
        Ok(())
    }

    pub fn active_probation_ids(&self, now_utc: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT market_id FROM probation WHERE probation_until_utc > ?1")?;
        let ids = stmt
            .query_map(params![now_utc], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn probation_count(&self, now_utc: &str) -> Result<usize> {
        Ok(self.active_probation_ids(now_utc)?.len())
    }

    pub fn upsert_quarantine(
        &self,
        market_id: &str,
        trigger_count: u32,
        no_trade_count: u32,
        until_utc: &str,
        now_utc: &str,
    ) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            INSERT INTO quarantine (market_id, trigger_count_hour, no_trade_count_hour, quarantine_until_utc, added_at_utc)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT (market_id) DO UPDATE SET
                trigger_count_hour = excluded.trigger_count_hour,
                no_trade_count_hour = excluded.no_trade_count_hour,
                quarantine_until_utc = excluded.quarantine_until_utc
            "#,
            params![market_id, trigger_count, no_trade_count, until_utc, now_utc],
        )
        .context("upserting quarantine")?;
        Ok(())
    }

    pub fn quarantine_counts(&self, market_id: &str) -> Result<Option<(u32, u32, String)>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT trigger_count_hour, no_trade_count_hour, quarantine_until_utc \
             FROM quarantine WHERE market_id = ?1",
        )?;
        let mut rows = stmt.query(params![market_id])?;
        match rows.next()? {
            Some(row) => Ok(Some((row.get(0)?, row.get(1)?, row.get(2)?))),
            None => Ok(None),
        }
    }

    pub fn active_quarantine_ids(&self, now_utc: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT market_id FROM quarantine WHERE quarantine_until_utc > ?1")?;
        let ids = stmt
            .query_map(params![now_utc], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(ids)
    }

    pub fn cleanup_expired(&self, now_utc: &str) -> Result<(usize, usize)> {
        let conn = self.conn.lock();
        let probation = conn.execute(
            "DELETE FROM probation WHERE probation_until_utc <= ?1",
            params![now_utc],
        )?;
        let quarantine = conn.execute(
            "DELETE FROM quarantine WHERE quarantine_until_utc <= ?1",
            params![now_utc],
        )?;
        Ok((probation, quarantine))
    }

    // -------------------------------------------------------------------------
    // Orders
    // -------------------------------------------------------------------------

    /// Insert an order unless one with the same decision id already exists.
    /// Returns `true` when a row was written.
    pub fn insert_order_if_absent(&self, o: &OrderRow) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                r#"
                INSERT OR IGNORE INTO orders (
                    local_order_id, client_order_id, decision_id_hex, market_id,
                    side, status, price, size_usd, created_at_utc
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
                "#,
                params![
                    o.local_order_id,
                    o.client_order_id,
                    o.decision_id_hex,
                    o.market_id,
                    o.side,
                    o.status,
                    o.price,
                    o.size_usd,
                    o.created_at_utc,
                ],
            )
            .context("inserting order")?;
        Ok(changed > 0)
    }

    pub fn update_order_status(&self, local_order_id: &str, status: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE orders SET status = ?2 WHERE local_order_id = ?1",
            params![local_order_id, status],
        )
        .context("updating order status")?;
        Ok(())
    }

    pub fn order_by_decision_id(&self, decision_id_hex: &str) -> Result<Option<OrderRow>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT local_order_id, client_order_id, decision_id_hex, market_id, \
             side, status, price, size_usd, created_at_utc \
             FROM orders WHERE decision_id_hex = ?1",
        )?;
        let mut rows = stmt.query(params![decision_id_hex])?;
        match rows.next()? {
            Some(row) => Ok(Some(OrderRow {
                local_order_id: row.get(0)?,
                client_order_id: row.get(1)?,
                decision_id_hex: row.get(2)?,
                market_id: row.get(3)?,
                side: row.get(4)?,
                status: row.get(5)?,
                price: row.get(6)?,
                size_usd: row.get(7)?,
                created_at_utc: row.get(8)?,
            })),
            None => Ok(None),
        }
    }

    pub fn count_orders_with_status(&self, status: &str) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM orders WHERE status = ?1",
            params![status],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    // -------------------------------------------------------------------------
    // Event log
    // -------------------------------------------------------------------------

    /// Insert one event, deduplicated on payload hash. Returns `true` when a
    /// row was written.
    pub fn insert_event(
        &self,
        event_id: &str,
        ts_utc: &str,
        event_type: &str,
        payload_json: &str,
        payload_hash: &str,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn
            .execute(
                "INSERT OR IGNORE INTO event_log (event_id, ts_utc, event_type, payload, payload_hash) \
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![event_id, ts_utc, event_type, payload_json, payload_hash],
            )
            .context("inserting event")?;
        Ok(changed > 0)
    }

    pub fn event_count(&self) -> Result<i64> {
        let conn = self.conn.lock();
        let count = conn.query_row("SELECT COUNT(*) FROM event_log", [], |row| row.get(0))?;
        Ok(count)
    }
}

fn parse_candidate_status(s: &str) -> Option<CandidateStatus> {
    match s {
        "NEW" => Some(CandidateStatus::New),
        "FILTERED" => Some(CandidateStatus::Filtered),
        "EVIDENCE_DONE" => Some(CandidateStatus::EvidenceDone),
        "AI_DONE" => Some(CandidateStatus::AiDone),
        "DECIDED" => Some(CandidateStatus::Decided),
        "EXECUTED" => Some(CandidateStatus::Executed),
        "DROPPED" => Some(CandidateStatus::Dropped),
        _ => None,
    }
}

/// Record a candidate's terminal reason alongside its status row.
pub fn mark_candidate_filtered(
    store: &Store,
    candidate: &mut Candidate,
    reason: NoTradeReason,
) -> Result<()> {
    candidate.status = CandidateStatus::Filtered;
    candidate.filter_reason = Some(reason);
    store.upsert_candidate(candidate)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TriggerKind;
    use chrono::Utc;

    fn store() -> Store {
        let s = Store::open_in_memory().unwrap();
        s.migrate().unwrap();
        s
    }

    fn market(id: &str) -> Market {
        Market {
            market_id: id.to_string(),
            condition_id: "c".to_string(),
            category: "economics".to_string(),
            title: "t".to_string(),
            description: "d".to_string(),
            resolution_source: "r".to_string(),
            end_date_utc: Some(Utc::now()),
            yes_token_id: "y".to_string(),
            no_token_id: "n".to_string(),
            volume_24h_usd: 1000.0,
            liquidity_usd: 2000.0,
            critical_field_hash: "hash-1".to_string(),
            is_binary_eligible: true,
            eligibility_reason: None,
            frozen: false,
        }
    }

    #[test]
    fn market_upsert_and_freeze() {
        let s = store();
        s.upsert_market(&market("m1")).unwrap();
        let (hash, frozen) = s.market_hash("m1").unwrap().unwrap();
        assert_eq!(hash, "hash-1");
        assert!(!frozen);

        s.freeze_market("m1").unwrap();
        let (_, frozen) = s.market_hash("m1").unwrap().unwrap();
        assert!(frozen);

        assert!(s.market_hash("missing").unwrap().is_none());
    }

    #[test]
    fn candidate_upsert_updates_status() {
        let s = store();
        let mut c = Candidate::new("m1", "snap-1", vec![TriggerKind::MidMove]);
        s.upsert_candidate(&c).unwrap();
        assert_eq!(s.candidate_status(&c.candidate_id).unwrap(), Some(CandidateStatus::New));

        mark_candidate_filtered(&s, &mut c, NoTradeReason::SpreadTooWide).unwrap();
        assert_eq!(
            s.candidate_status(&c.candidate_id).unwrap(),
            Some(CandidateStatus::Filtered)
        );
    }

    #[test]
    fn event_log_dedupes_on_payload_hash() {
        let s = store();
        assert!(s.insert_event("e1", "2026-01-01T00:00:00Z", "ORDER_INTENT", "{}", "h1").unwrap());
        assert!(!s.insert_event("e1", "2026-01-01T00:00:00Z", "ORDER_INTENT", "{}", "h1").unwrap());
        // Different hash inserts.
        assert!(s.insert_event("e2", "2026-01-01T00:00:01Z", "ORDER_RESULT", "{}", "h2").unwrap());
        assert_eq!(s.event_count().unwrap(), 2);
    }

    #[test]
    fn orders_unique_on_decision_id() {
        let s = store();
        let row = OrderRow {
            local_order_id: "l1".to_string(),
            client_order_id: "abc".to_string(),
            decision_id_hex: "abc".to_string(),
            market_id: "m1".to_string(),
            side: "YES".to_string(),
            status: "PENDING_UNKNOWN".to_string(),
            price: 0.42,
            size_usd: 2.0,
            created_at_utc: Utc::now().to_rfc3339(),
        };
        assert!(s.insert_order_if_absent(&row).unwrap());
        let mut dup = row.clone();
        dup.local_order_id = "l2".to_string();
        assert!(!s.insert_order_if_absent(&dup).unwrap());

        s.update_order_status("l1", "FILLED").unwrap();
        assert_eq!(s.count_orders_with_status("FILLED").unwrap(), 1);
        assert_eq!(s.count_orders_with_status("PENDING_UNKNOWN").unwrap(), 0);
    }

    #[test]
    fn watchlist_probation_quarantine_round_trip() {
        let s = store();
        let now = Utc::now();
        let now_str = now.to_rfc3339();
        let later = (now + chrono::Duration::hours(2)).to_rfc3339();
        let earlier = (now - chrono::Duration::hours(1)).to_rfc3339();

        s.replace_watchlist(
            &[("m1".to_string(), 42.0), ("m2".to_string(), 10.0)],
            &now_str,
        )
        .unwrap();
        assert_eq!(s.watchlist_ids().unwrap(), vec!["m1", "m2"]);

        s.upsert_probation("m1", "repeated anomalies", &later, &now_str).unwrap();
        s.upsert_probation("m3", "repeated anomalies", &earlier, &now_str).unwrap();
        assert_eq!(s.active_probation_ids(&now_str).unwrap(), vec!["m1"]);

        s.upsert_quarantine("m2", 11, 11, &later, &now_str).unwrap();
        assert_eq!(s.active_quarantine_ids(&now_str).unwrap(), vec!["m2"]);
        let (t, nt, _) = s.quarantine_counts("m2").unwrap().unwrap();
        assert_eq!((t, nt), (11, 11));

        let (p, q) = s.cleanup_expired(&now_str).unwrap();
        assert_eq!(p, 1); // m3 expired
        assert_eq!(q, 0);
    }
}

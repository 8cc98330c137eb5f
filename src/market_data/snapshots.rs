// =============================================================================
// Immutable orderbook snapshots — canonical JSON + anomaly flags
// =============================================================================
//
// A snapshot is built once per book update and never mutated afterwards. The
// canonical JSON is assembled by hand with fixed-decimal formatting (prices
// %.6f, sizes %.2f) so the SHA-256 is byte-stable across platforms; it never
// depends on float-to-shortest formatting.
// =============================================================================

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::{top_depth_usd, BookLevel, BookUpdate};
use crate::constants::{ASK_SUM_HIGH, ASK_SUM_LOW, BOOK_LEVELS_REQUIRED};
use crate::types::SnapshotSource;

/// Immutable book snapshot, the unit of freshness accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub snapshot_id: String,
    pub market_id: String,
    pub snapshot_at_ms: i64,
    pub source: SnapshotSource,
    pub ws_epoch: u64,
    pub ws_last_message_ms: i64,
    pub market_last_update_ms: Option<i64>,
    pub orderbook_last_change_ms: Option<i64>,
    pub best_bid_yes: Option<f64>,
    pub best_ask_yes: Option<f64>,
    pub best_bid_no: Option<f64>,
    pub best_ask_no: Option<f64>,
    pub depth_yes: Vec<BookLevel>,
    pub depth_no: Vec<BookLevel>,
    /// SHA-256 hex of the canonical orderbook JSON.
    pub orderbook_hash: String,
    pub ask_sum_anomaly: bool,
    pub invalid_book_anomaly: bool,
}

impl Snapshot {
    pub fn mid_yes(&self) -> Option<f64> {
        match (self.best_bid_yes, self.best_ask_yes) {
            (Some(b), Some(a)) => Some((b + a) / 2.0),
            _ => None,
        }
    }

    pub fn spread_yes(&self) -> Option<f64> {
        match (self.best_bid_yes, self.best_ask_yes) {
            (Some(b), Some(a)) => Some(a - b),
            _ => None,
        }
    }

    pub fn spread_no(&self) -> Option<f64> {
        match (self.best_bid_no, self.best_ask_no) {
            (Some(b), Some(a)) => Some(a - b),
            _ => None,
        }
    }

    pub fn top_depth_yes(&self) -> f64 {
        top_depth_usd(&self.depth_yes, BOOK_LEVELS_REQUIRED)
    }

    pub fn top_depth_no(&self) -> f64 {
        top_depth_usd(&self.depth_no, BOOK_LEVELS_REQUIRED)
    }
}

// ---------------------------------------------------------------------------
// Canonical JSON
// ---------------------------------------------------------------------------

fn fmt_price(v: Option<f64>) -> String {
    match v {
        Some(p) => format!("\"{:.6}\"", p),
        None => "null".to_string(),
    }
}

fn fmt_levels(levels: &[BookLevel]) -> String {
    let mut out = String::from("[");
    for (i, (price, size)) in levels.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        out.push_str(&format!("[\"{:.6}\",\"{:.2}\"]", price, size));
    }
    out.push(']');
    out
}

/// Deterministic canonical JSON for orderbook hashing: keys sorted, ASCII,
/// compact separators, explicit fixed-decimal formatting.
pub fn canonical_orderbook_json(
    best_bid_yes: Option<f64>,
    best_ask_yes: Option<f64>,
    best_bid_no: Option<f64>,
    best_ask_no: Option<f64>,
    depth_yes: &[BookLevel],
    depth_no: &[BookLevel],
) -> String {
    format!(
        "{{\"best_ask_no\":{},\"best_ask_yes\":{},\"best_bid_no\":{},\"best_bid_yes\":{},\"depth_no\":{},\"depth_yes\":{}}}",
        fmt_price(best_ask_no),
        fmt_price(best_ask_yes),
        fmt_price(best_bid_no),
        fmt_price(best_bid_yes),
        fmt_levels(depth_no),
        fmt_levels(depth_yes),
    )
}

/// SHA-256 hex of the canonical orderbook JSON.
pub fn compute_orderbook_hash(canonical_json: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(canonical_json.as_bytes());
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Anomaly flags
// ---------------------------------------------------------------------------

/// Binary consistency check: YES_ask + NO_ask must land in
/// [`ASK_SUM_LOW`, `ASK_SUM_HIGH`]. A missing ask is itself anomalous.
pub fn detect_ask_sum_anomaly(best_ask_yes: Option<f64>, best_ask_no: Option<f64>) -> bool {
    match (best_ask_yes, best_ask_no) {
        (Some(ay), Some(an)) => {
            let sum = ay + an;
            sum < ASK_SUM_LOW || sum > ASK_SUM_HIGH
        }
        _ => true,
    }
}

/// Structural book check: any missing best, any price outside (0, 1), or
/// bid above ask on either side.
pub fn detect_invalid_book_anomaly(
    best_bid_yes: Option<f64>,
    best_ask_yes: Option<f64>,
    best_bid_no: Option<f64>,
    best_ask_no: Option<f64>,
) -> bool {
    let (bb_y, ba_y, bb_n, ba_n) =
        match (best_bid_yes, best_ask_yes, best_bid_no, best_ask_no) {
            (Some(a), Some(b), Some(c), Some(d)) => (a, b, c, d),
            _ => return true,
        };

    for p in [bb_y, ba_y, bb_n, ba_n] {
        if p <= 0.0 || p >= 1.0 {
            return true;
        }
    }

    bb_y > ba_y || bb_n > ba_n
}

// ---------------------------------------------------------------------------
// Builder
// ---------------------------------------------------------------------------

/// Build an immutable snapshot from a book update.
///
/// The snapshot is "as of" the message that produced it, so its timestamp
/// never lands after the message timestamp.
pub fn build_snapshot(update: &BookUpdate, source: SnapshotSource) -> Snapshot {
    let canonical = canonical_orderbook_json(
        update.best_bid_yes,
        update.best_ask_yes,
        update.best_bid_no,
        update.best_ask_no,
        &update.depth_yes,
        &update.depth_no,
    );
    let orderbook_hash = compute_orderbook_hash(&canonical);

    let now = Utc::now().timestamp_millis();
    let snapshot_at_ms = if update.ws_last_message_ms > 0 {
        now.min(update.ws_last_message_ms)
    } else {
        now
    };

    Snapshot {
        snapshot_id: Uuid::new_v4().to_string(),
        market_id: update.market_id.clone(),
        snapshot_at_ms,
        source,
        ws_epoch: update.snapshot_ws_epoch,
        ws_last_message_ms: update.ws_last_message_ms,
        market_last_update_ms: update.market_last_update_ms,
        orderbook_last_change_ms: update.orderbook_last_change_ms,
        best_bid_yes: update.best_bid_yes,
        best_ask_yes: update.best_ask_yes,
        best_bid_no: update.best_bid_no,
        best_ask_no: update.best_ask_no,
        depth_yes: update.depth_yes.clone(),
        depth_no: update.depth_no.clone(),
        orderbook_hash,
        ask_sum_anomaly: detect_ask_sum_anomaly(update.best_ask_yes, update.best_ask_no),
        invalid_book_anomaly: detect_invalid_book_anomaly(
            update.best_bid_yes,
            update.best_ask_yes,
            update.best_bid_no,
            update.best_ask_no,
        ),
    }
}

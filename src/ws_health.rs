// =============================================================================
// WS freshness predicates — decision (6s) and execution (3s) budgets
// =============================================================================
//
// Both predicates run the same checks with different age budgets. They return
// the full list of failed checks so every rejection is explainable from one
// log line.
// =============================================================================

use crate::constants::{
    MAX_SNAPSHOT_AGE_DECISION_SEC, MAX_SNAPSHOT_AGE_EXEC_SEC, WS_HEARTBEAT_SEC,
};
use crate::market_data::{Snapshot, WsHealthView};
use crate::types::SnapshotSource;

fn ws_healthy(
    market_id: &str,
    snapshot: &Snapshot,
    ws: &WsHealthView,
    max_age_sec: i64,
    now_ms: i64,
) -> (bool, Vec<String>) {
    let mut reasons = Vec::new();

    if !ws.connected {
        reasons.push("ws_connected is false".to_string());
    }

    let msg_age = now_ms - ws.last_message_ms;
    if msg_age > WS_HEARTBEAT_SEC * 1000 {
        reasons.push(format!(
            "ws_last_message stale: {}ms > {}ms",
            msg_age,
            WS_HEARTBEAT_SEC * 1000
        ));
    }

    if snapshot.source != SnapshotSource::Ws {
        reasons.push(format!(
            "snapshot source is '{}', not 'WS'",
            snapshot.source
        ));
    }

    if snapshot.ws_epoch != ws.epoch {
        reasons.push(format!(
            "epoch mismatch: snapshot={}, current={}",
            snapshot.ws_epoch, ws.epoch
        ));
    }

    if snapshot.market_id != market_id {
        reasons.push(format!(
            "market_id mismatch: snapshot={}, expected={}",
            snapshot.market_id, market_id
        ));
    }

    match snapshot.market_last_update_ms {
        Some(ts) if ts > 0 => {
            let age = now_ms - ts;
            if age > max_age_sec * 1000 {
                reasons.push(format!(
                    "market_last_update stale: {}ms > {}ms",
                    age,
                    max_age_sec * 1000
                ));
            }
        }
        _ => reasons.push("market_last_update_ms is null or <= 0".to_string()),
    }

    match snapshot.orderbook_last_change_ms {
        Some(ts) if ts > 0 => {
            let age = now_ms - ts;
            if age > max_age_sec * 1000 {
                reasons.push(format!(
                    "orderbook_last_change stale: {}ms > {}ms",
                    age,
                    max_age_sec * 1000
                ));
            }
        }
        _ => reasons.push("orderbook_last_change_ms is null or <= 0".to_string()),
    }

    if snapshot.ws_last_message_ms < snapshot.snapshot_at_ms {
        reasons.push(format!(
            "ws_last_message_ms ({}) < snapshot_at_ms ({})",
            snapshot.ws_last_message_ms, snapshot.snapshot_at_ms
        ));
    }

    (reasons.is_empty(), reasons)
}

/// Freshness predicate for decision-making (6-second budget).
pub fn ws_healthy_decision(
    market_id: &str,
    snapshot: &Snapshot,
    ws: &WsHealthView,
    now_ms: i64,
) -> (bool, Vec<String>) {
    ws_healthy(market_id, snapshot, ws, MAX_SNAPSHOT_AGE_DECISION_SEC, now_ms)
}

/// Freshness predicate for execution (3-second budget, stricter timing,
/// identical checks).
pub fn ws_healthy_exec(
    market_id: &str,
    snapshot: &Snapshot,
    ws: &WsHealthView,
    now_ms: i64,
) -> (bool, Vec<String>) {
    ws_healthy(market_id, snapshot, ws, MAX_SNAPSHOT_AGE_EXEC_SEC, now_ms)
}

// =============================================================================
// Reconciliation — REST authority, mismatch levels, RECONCILE_GREEN
// =============================================================================
//
// The exchange REST view is the authority. Drift is classified per market by
// absolute delta relative to the wallet; the engine logs and blocks but never
// auto-fixes positions on the venue. A failing RECONCILE_GREEN predicate
// blocks all new live submissions.
// =============================================================================

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{info, warn};

use crate::constants::{MIN_RECONCILE_THRESHOLD_USD, RECONCILE_HEARTBEAT_SEC};

/// Severity thresholds as a fraction of wallet.
const LEVEL_1_THRESHOLD: f64 = 0.001;
const LEVEL_2_THRESHOLD: f64 = 0.005;

/// Cumulative level-1 mismatches tolerated before green is withheld.
const LEVEL_1_CUMULATIVE_MAX: u32 = 3;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// One per-market discrepancy between local and remote positions.
#[derive(Debug, Clone, Serialize)]
pub struct Mismatch {
    pub market_id: String,
    pub local_usd: f64,
    pub remote_usd: f64,
    pub delta_abs: f64,
    pub level: u8,
    pub at_ms: i64,
}

/// Classify by absolute delta relative to wallet: <0.1% L1, <0.5% L2,
/// else L3.
pub fn classify_mismatch(delta_abs: f64, wallet_usd: f64) -> u8 {
    if wallet_usd <= 0.0 {
        return 3;
    }
    let ratio = delta_abs / wallet_usd;
    if ratio < LEVEL_1_THRESHOLD {
        1
    } else if ratio < LEVEL_2_THRESHOLD {
        2
    } else {
        3
    }
}

struct Inner {
    wallet_usd: f64,
    mismatches: Vec<Mismatch>,
    last_reconcile_at_ms: i64,
    cumulative_level1: u32,
    position_sets_match: bool,
    pending_unknown_orders: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReconcileStats {
    pub total_mismatches: usize,
    pub level3_count: usize,
    pub level2_count: usize,
    pub level1_count: usize,
    pub cumulative_level1: u32,
    pub last_reconcile_age_sec: Option<i64>,
}

/// Mismatch bookkeeping and the green predicate.
pub struct ReconcileEngine {
    inner: Mutex<Inner>,
}

impl ReconcileEngine {
    pub fn new(wallet_usd: f64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                wallet_usd,
                mismatches: Vec::new(),
                last_reconcile_at_ms: 0,
                cumulative_level1: 0,
                position_sets_match: true,
                pending_unknown_orders: 0,
            }),
        }
    }

    pub fn update_wallet(&self, wallet_usd: f64) {
        self.inner.lock().wallet_usd = wallet_usd;
    }

    /// Fed from the order store: orders adopted as PENDING_UNKNOWN block
    /// green until resolved.
    pub fn set_pending_unknown_orders(&self, count: usize) {
        self.inner.lock().pending_unknown_orders = count;
    }

    /// Compare local against remote per-market notionals. Returns the new
    /// mismatches found in this pass.
    pub fn reconcile_positions(
        &self,
        local: &HashMap<String, f64>,
        remote: &HashMap<String, f64>,
    ) -> Vec<Mismatch> {
        let mut inner = self.inner.lock();
        let now = now_ms();
        inner.last_reconcile_at_ms = now;

        let all_markets: HashSet<&String> = local.keys().chain(remote.keys()).collect();
        let mut found = Vec::new();

        for market_id in all_markets {
            let local_usd = local.get(market_id).copied();
            let remote_usd = remote.get(market_id).copied();

            let mismatch = match (local_usd, remote_usd) {
                (Some(l), None) => Some(Mismatch {
                    market_id: market_id.clone(),
                    local_usd: l,
                    remote_usd: 0.0,
                    delta_abs: l,
                    level: 3,
                    at_ms: now,
                }),
                (None, Some(r)) => Some(Mismatch {
                    market_id: market_id.clone(),
                    local_usd: 0.0,
                    remote_usd: r,
                    delta_abs: r,
                    level: 3,
                    at_ms: now,
                }),
                (Some(l), Some(r)) => {
                    let delta = (l - r).abs();
                    if delta > MIN_RECONCILE_THRESHOLD_USD {
                        Some(Mismatch {
                            market_id: market_id.clone(),
                            local_usd: l,
                            remote_usd: r,
                            delta_abs: delta,
                            level: classify_mismatch(delta, inner.wallet_usd),
                            at_ms: now,
                        })
                    } else {
                        None
                    }
                }
                (None, None) => None,
            };

            if let Some(m) = mismatch {
                warn!(
                    market_id = %m.market_id,
                    local = m.local_usd,
                    remote = m.remote_usd,
                    level = m.level,
                    "position mismatch"
                );
                found.push(m);
            }
        }

        inner.position_sets_match = local.keys().collect::<HashSet<_>>()
            == remote.keys().collect::<HashSet<_>>();

        for m in &found {
            if m.level == 1 {
                inner.cumulative_level1 += 1;
            }
        }
        inner.mismatches.extend(found.iter().cloned());

        if found.is_empty() {
            info!(markets = local.len(), "reconciliation clean");
        }
        found
    }

    /// The six-condition RECONCILE_GREEN predicate. Returns the failing
    /// reasons when red.
    pub fn reconcile_green(&self) -> (bool, Vec<String>) {
        let inner = self.inner.lock();
        let now = now_ms();
        let mut reasons = Vec::new();

        // 1. No active level-3 mismatches.
        let level3 = inner.mismatches.iter().filter(|m| m.level == 3).count();
        if level3 > 0 {
            reasons.push(format!("level-3 mismatches active: {level3}"));
        }

        // 2. No level-2 mismatch inside the heartbeat window.
        let cutoff = now - RECONCILE_HEARTBEAT_SEC * 1000;
        let recent_level2 = inner
            .mismatches
            .iter()
            .filter(|m| m.level == 2 && m.at_ms > cutoff)
            .count();
        if recent_level2 > 0 {
            reasons.push(format!("recent level-2 mismatches: {recent_level2}"));
        }

        // 3. A reconciliation ran inside the heartbeat window.
        if inner.last_reconcile_at_ms == 0 {
            reasons.push("no reconciliation has run yet".to_string());
        } else if now - inner.last_reconcile_at_ms > RECONCILE_HEARTBEAT_SEC * 1000 {
            reasons.push(format!(
                "last reconcile too old: {}s ago",
                (now - inner.last_reconcile_at_ms) / 1000
            ));
        }

        // 4. Cumulative level-1 drift within tolerance.
        if inner.cumulative_level1 > LEVEL_1_CUMULATIVE_MAX {
            reasons.push(format!(
                "cumulative level-1 drift: {} > {LEVEL_1_CUMULATIVE_MAX}",
                inner.cumulative_level1
            ));
        }

        // 5. Position sets match.
        if !inner.position_sets_match {
            reasons.push("position sets differ between local and remote".to_string());
        }

        // 6. No pending-unknown orders.
        if inner.pending_unknown_orders > 0 {
            reasons.push(format!(
                "pending-unknown orders: {}",
                inner.pending_unknown_orders
            ));
        }

        (reasons.is_empty(), reasons)
    }

    /// Clear resolved mismatches (operator action after manual resolution).
    pub fn clear_mismatches(&self) {
        let mut inner = self.inner.lock();
        inner.mismatches.clear();
        inner.cumulative_level1 = 0;
    }

    pub fn stats(&self) -> ReconcileStats {
        let inner = self.inner.lock();
        let count_level = |l: u8| inner.mismatches.iter().filter(|m| m.level == l).count();
        ReconcileStats {
            total_mismatches: inner.mismatches.len(),
            level3_count: count_level(3),
            level2_count: count_level(2),
            level1_count: count_level(1),
            cumulative_level1: inner.cumulative_level1,
            last_reconcile_age_sec: if inner.last_reconcile_at_ms == 0 {
                None
            } else {
                Some((now_ms() - inner.last_reconcile_at_ms) / 1000)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn positions(entries: &[(&str, f64)]) -> HashMap<String, f64> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect()
    }

    #[test]
    fn classification_thresholds() {
        assert_eq!(classify_mismatch(0.05, 100.0), 1); // 0.05%
        assert_eq!(classify_mismatch(0.30, 100.0), 2); // 0.3%
        assert_eq!(classify_mismatch(2.00, 100.0), 3); // 2%
        assert_eq!(classify_mismatch(1.0, 0.0), 3);
    }

    #[test]
    fn matched_books_reconcile_clean_and_green() {
        let eng = ReconcileEngine::new(100.0);
        let found = eng.reconcile_positions(
            &positions(&[("m1", 10.0)]),
            &positions(&[("m1", 10.0)]),
        );
        assert!(found.is_empty());
        let (green, reasons) = eng.reconcile_green();
        assert!(green, "{reasons:?}");
    }

    #[test]
    fn small_deltas_below_floor_are_ignored() {
        let eng = ReconcileEngine::new(100.0);
        let found = eng.reconcile_positions(
            &positions(&[("m1", 10.0)]),
            &positions(&[("m1", 10.5)]),
        );
        assert!(found.is_empty());
    }

    #[test]
    fn missing_remote_is_level_three_and_blocks_green() {
        let eng = ReconcileEngine::new(100.0);
        let found = eng.reconcile_positions(&positions(&[("m1", 10.0)]), &positions(&[]));
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].level, 3);

        let (green, reasons) = eng.reconcile_green();
        assert!(!green);
        assert!(reasons.iter().any(|r| r.contains("level-3")));
        assert!(reasons.iter().any(|r| r.contains("position sets")));
    }

    #[test]
    fn green_requires_a_reconciliation_to_have_run() {
        let eng = ReconcileEngine::new(100.0);
        let (green, reasons) = eng.reconcile_green();
        assert!(!green);
        assert!(reasons.iter().any(|r| r.contains("no reconciliation")));
    }

    #[test]
    fn pending_unknown_orders_block_green() {
        let eng = ReconcileEngine::new(100.0);
        eng.reconcile_positions(&positions(&[]), &positions(&[]));
        eng.set_pending_unknown_orders(1);
        let (green, reasons) = eng.reconcile_green();
        assert!(!green);
        assert!(reasons.iter().any(|r| r.contains("pending-unknown")));
    }

    #[test]
    fn cumulative_level_one_drift_blocks_green() {
        let eng = ReconcileEngine::new(10_000.0);
        // Deltas just above $1 but far below 0.1% of wallet: level 1.
        for i in 0..4 {
            let local = positions(&[("m1", 100.0 + i as f64 * 0.01)]);
            let remote = positions(&[("m1", 101.2 + i as f64 * 0.01)]);
            let found = eng.reconcile_positions(&local, &remote);
            assert_eq!(found[0].level, 1);
        }
        let (green, reasons) = eng.reconcile_green();
        assert!(!green);
        assert!(reasons.iter().any(|r| r.contains("cumulative level-1")));
    }

    #[test]
    fn clear_mismatches_restores_green() {
        let eng = ReconcileEngine::new(100.0);
        eng.reconcile_positions(&positions(&[("m1", 50.0)]), &positions(&[]));
        assert!(!eng.reconcile_green().0);

        eng.clear_mismatches();
        eng.reconcile_positions(&positions(&[]), &positions(&[]));
        assert!(eng.reconcile_green().0);
    }

    #[test]
    fn stats_counts_levels() {
        let eng = ReconcileEngine::new(100.0);
        eng.reconcile_positions(&positions(&[("m1", 50.0)]), &positions(&[("m2", 3.0)]));
        let stats = eng.stats();
        assert_eq!(stats.total_mismatches, 2);
        assert_eq!(stats.level3_count, 2);
        assert!(stats.last_reconcile_age_sec.is_some());
    }
}

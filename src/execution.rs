// =============================================================================
// Execution engine — pre-submit gates, WAL hooks, pessimistic paper fills
// =============================================================================
//
// Submission order is fixed: lock validation, reconcile gate (live only),
// risk gate, then WAL ORDER_INTENT, then the order book entry. A failed gate
// is a clean abort that writes ORDER_INTENT_ABORTED. Paper fills are
// pessimistic: the market must trade through the limit by a full tick and
// sustain it for three seconds, and the fill price is the limit, never the
// through price.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::constants::{
    MAX_DECISION_TO_EXEC_DELAY_SEC, PAPER_FEE_MULTIPLIER, PAPER_FILL_SUSTAIN_SEC,
    PAPER_FILL_TICK, PAPER_MIN_FEE_BPS,
};
use crate::decision::Decision;
use crate::locks::LockManager;
use crate::reconcile::ReconcileEngine;
use crate::risk::RiskManager;
use crate::store::{OrderRow, Store};
use crate::types::{NoTradeReason, RecommendedSide, Side, WalRecordType};
use crate::wal::{WalError, WalWriter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    Open,
    Filled,
    Cancelled,
    PendingUnknown,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Filled => "FILLED",
            Self::Cancelled => "CANCELLED",
            Self::PendingUnknown => "PENDING_UNKNOWN",
        }
    }
}

/// A resting paper order.
#[derive(Debug, Clone)]
pub struct PaperOrder {
    pub local_order_id: String,
    pub client_order_id: String,
    pub decision_id_hex: String,
    pub market_id: String,
    pub side: Side,
    pub limit_price: f64,
    pub size_usd: f64,
    pub fee_bps: f64,
    pub status: OrderStatus,
    pub created_at_ms: i64,
    /// Set when the market first traded through the limit; cleared when it
    /// recovers.
    through_since_ms: Option<i64>,
}

/// An emitted paper fill.
#[derive(Debug, Clone, Serialize)]
pub struct Fill {
    pub local_order_id: String,
    pub market_id: String,
    pub side: Side,
    pub price: f64,
    pub size_usd: f64,
    pub fee_usd: f64,
}

/// Outcome of a submission attempt.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    Submitted { local_order_id: String },
    Aborted { reason: NoTradeReason, detail: String },
}

/// Routes decisions through the pre-submit gates and the paper book.
pub struct ExecutionEngine {
    wal: Arc<WalWriter>,
    locks: Arc<LockManager>,
    risk: Arc<RiskManager>,
    reconcile: Arc<ReconcileEngine>,
    store: Arc<Store>,
    orders: Mutex<HashMap<String, PaperOrder>>,
}

impl ExecutionEngine {
    pub fn new(
        wal: Arc<WalWriter>,
        locks: Arc<LockManager>,
        risk: Arc<RiskManager>,
        reconcile: Arc<ReconcileEngine>,
        store: Arc<Store>,
    ) -> Self {
        Self {
            wal,
            locks,
            risk,
            reconcile,
            store,
            orders: Mutex::new(HashMap::new()),
        }
    }

    fn abort(
        &self,
        decision: &Decision,
        reason: NoTradeReason,
        detail: String,
    ) -> Result<ExecutionOutcome, WalError> {
        warn!(
            decision_id = %decision.decision_id_hex,
            market_id = %decision.market_id,
            reason = %reason,
            detail = %detail,
            "submission aborted"
        );
        self.wal.append(
            WalRecordType::OrderIntentAborted,
            serde_json::json!({
                "decision_id_hex": decision.decision_id_hex,
                "market_id": decision.market_id,
                "reason": reason.as_str(),
                "detail": detail,
            }),
        )?;
        Ok(ExecutionOutcome::Aborted { reason, detail })
    }

    /// Submit a trade decision. `live` engages the reconcile gate; paper
    /// submissions only need the lock and risk gates.
    pub fn submit(
        &self,
        decision: &Decision,
        worker_id: &str,
        lock_version: u64,
        live: bool,
        fee_bps: f64,
    ) -> Result<ExecutionOutcome, WalError> {
        let side = match decision.side {
            RecommendedSide::Yes => Side::Yes,
            RecommendedSide::No => Side::No,
            RecommendedSide::NoTrade => {
                return Ok(ExecutionOutcome::Aborted {
                    reason: NoTradeReason::EvTooLow,
                    detail: "no-trade decision reached submission".to_string(),
                })
            }
        };

        // Gate 0: the decision itself must still be fresh.
        let decision_age_ms = Utc::now().timestamp_millis() - decision.decided_at_ms;
        if decision_age_ms > MAX_DECISION_TO_EXEC_DELAY_SEC * 1000 {
            return self.abort(
                decision,
                NoTradeReason::CandidateExpired,
                format!("decision {decision_age_ms}ms old at submission"),
            );
        }

        // Gate 1: lock still valid for this worker at the expected version.
        if let Err(detail) =
            self.locks
                .validate_for_submit(&decision.market_id, worker_id, lock_version)
        {
            return self.abort(decision, NoTradeReason::LockLost, detail);
        }

        // Gate 2: live submissions require a green reconciliation.
        if live {
            let (green, reasons) = self.reconcile.reconcile_green();
            if !green {
                return self.abort(decision, NoTradeReason::ReconcileRed, reasons.join("; "));
            }
        }

        // Gate 3: risk limits.
        if let Err(detail) = self.risk.can_open_position(&decision.market_id) {
            return self.abort(decision, NoTradeReason::RiskLimitHit, detail);
        }

        // Intent first, order entry second: a crash between the two leaves an
        // orphan intent for replay to adopt.
        self.wal.append(
            WalRecordType::OrderIntent,
            serde_json::json!({
                "decision_id_hex": decision.decision_id_hex,
                "client_order_id": decision.client_order_id,
                "market_id": decision.market_id,
                "side": side.as_str(),
                "price": decision.entry_price,
                "size_usd": decision.size_usd,
                "is_paper": decision.is_paper,
            }),
        )?;

        let now = Utc::now().timestamp_millis();
        let order = PaperOrder {
            local_order_id: Uuid::new_v4().to_string(),
            client_order_id: decision.client_order_id.clone(),
            decision_id_hex: decision.decision_id_hex.clone(),
            market_id: decision.market_id.clone(),
            side,
            limit_price: decision.entry_price,
            size_usd: decision.size_usd,
            fee_bps,
            status: OrderStatus::Open,
            created_at_ms: now,
            through_since_ms: None,
        };

        if let Err(e) = self.store.insert_order_if_absent(&OrderRow {
            local_order_id: order.local_order_id.clone(),
            client_order_id: order.client_order_id.clone(),
            decision_id_hex: order.decision_id_hex.clone(),
            market_id: order.market_id.clone(),
            side: side.as_str().to_string(),
            status: OrderStatus::Open.as_str().to_string(),
            price: order.limit_price,
            size_usd: order.size_usd,
            created_at_utc: Utc::now().to_rfc3339(),
        }) {
            warn!(error = %e, "order row persist failed");
        }

        let local_order_id = order.local_order_id.clone();
        info!(
            local_order_id = %local_order_id,
            market_id = %order.market_id,
            side = %side,
            limit = order.limit_price,
            size_usd = order.size_usd,
            "order resting"
        );
        self.orders.lock().insert(local_order_id.clone(), order);

        Ok(ExecutionOutcome::Submitted { local_order_id })
    }

    /// Feed one traded price for `(market, side)`. Returns fills generated
    /// by the pessimistic fill rule; each fill has already been written to
    /// the WAL and applied to the risk book.
    pub fn on_price(
        &self,
        market_id: &str,
        side: Side,
        traded_price: f64,
        now_ms: i64,
    ) -> Result<Vec<Fill>, WalError> {
        let mut fills = Vec::new();
        let mut filled_orders = Vec::new();

        {
            let mut orders = self.orders.lock();
            for order in orders.values_mut() {
                if order.status != OrderStatus::Open
                    || order.market_id != market_id
                    || order.side != side
                {
                    continue;
                }

                let through = traded_price <= order.limit_price - PAPER_FILL_TICK;
                if !through {
                    order.through_since_ms = None;
                    continue;
                }

                match order.through_since_ms {
                    None => order.through_since_ms = Some(now_ms),
                    Some(since) if now_ms - since >= PAPER_FILL_SUSTAIN_SEC * 1000 => {
                        order.status = OrderStatus::Filled;
                        let fee_usd = order.size_usd
                            * order.fee_bps.max(PAPER_MIN_FEE_BPS)
                            * PAPER_FEE_MULTIPLIER
                            / 10_000.0;
                        fills.push(Fill {
                            local_order_id: order.local_order_id.clone(),
                            market_id: order.market_id.clone(),
                            side: order.side,
                            // Fill at the limit, not the through price.
                            price: order.limit_price,
                            size_usd: order.size_usd,
                            fee_usd,
                        });
                        filled_orders.push(order.clone());
                    }
                    Some(_) => {}
                }
            }
        }

        for (fill, order) in fills.iter().zip(filled_orders.iter()) {
            self.wal.append(
                WalRecordType::OrderResult,
                serde_json::json!({
                    "decision_id_hex": order.decision_id_hex,
                    "local_order_id": order.local_order_id,
                    "market_id": order.market_id,
                    "side": order.side.as_str(),
                    "status": "FILLED",
                    "fill_price": fill.price,
                    "size_usd": fill.size_usd,
                    "fee_usd": fill.fee_usd,
                }),
            )?;
            self.risk
                .add_position(&order.market_id, order.side, order.size_usd, fill.price);
            self.risk.record_pnl(-fill.fee_usd);
            if let Err(e) = self
                .store
                .update_order_status(&order.local_order_id, OrderStatus::Filled.as_str())
            {
                warn!(error = %e, "order status persist failed");
            }
            info!(
                local_order_id = %order.local_order_id,
                market_id = %order.market_id,
                price = fill.price,
                fee_usd = fill.fee_usd,
                "paper fill"
            );
        }

        Ok(fills)
    }

    /// Cancel a resting order.
    pub fn cancel(&self, local_order_id: &str) -> Result<bool, WalError> {
        let order = {
            let mut orders = self.orders.lock();
            match orders.get_mut(local_order_id) {
                Some(order) if order.status == OrderStatus::Open => {
                    order.status = OrderStatus::Cancelled;
                    order.clone()
                }
                _ => return Ok(false),
            }
        };

        self.wal.append(
            WalRecordType::CancelIntent,
            serde_json::json!({
                "decision_id_hex": order.decision_id_hex,
                "local_order_id": order.local_order_id,
                "market_id": order.market_id,
            }),
        )?;
        self.wal.append(
            WalRecordType::CancelResult,
            serde_json::json!({
                "decision_id_hex": order.decision_id_hex,
                "local_order_id": order.local_order_id,
                "status": "CANCELLED",
            }),
        )?;
        if let Err(e) = self
            .store
            .update_order_status(local_order_id, OrderStatus::Cancelled.as_str())
        {
            warn!(error = %e, "order status persist failed");
        }
        debug!(local_order_id, "order cancelled");
        Ok(true)
    }

    pub fn open_orders(&self) -> Vec<PaperOrder> {
        self.orders
            .lock()
            .values()
            .filter(|o| o.status == OrderStatus::Open)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decision::{make_decision, DecisionInputs};
    use crate::market_data::snapshots::build_snapshot;
    use crate::market_data::BookUpdate;
    use crate::types::SnapshotSource;

    struct Harness {
        engine: ExecutionEngine,
        locks: Arc<LockManager>,
        reconcile: Arc<ReconcileEngine>,
        _dir: tempfile::TempDir,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let wal = Arc::new(WalWriter::new(dir.path().join("wal.log")));
        wal.open().unwrap();
        let locks = Arc::new(LockManager::new("inst-1"));
        let risk = Arc::new(RiskManager::new(1000.0));
        let reconcile = Arc::new(ReconcileEngine::new(1000.0));
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.migrate().unwrap();
        Harness {
            engine: ExecutionEngine::new(
                wal,
                Arc::clone(&locks),
                risk,
                Arc::clone(&reconcile),
                store,
            ),
            locks,
            reconcile,
            _dir: dir,
        }
    }

    fn trade_decision() -> Decision {
        let update = BookUpdate {
            market_id: "mkt-1".to_string(),
            best_bid_yes: Some(0.40),
            best_ask_yes: Some(0.42),
            best_bid_no: Some(0.58),
            best_ask_no: Some(0.60),
            depth_yes: vec![(0.40, 200.0), (0.39, 200.0), (0.38, 200.0)],
            depth_no: vec![(0.58, 200.0), (0.57, 200.0), (0.56, 200.0)],
            ws_last_message_ms: 0,
            market_last_update_ms: Some(1),
            orderbook_last_change_ms: Some(1),
            snapshot_ws_epoch: 1,
        };
        let snap = build_snapshot(&update, SnapshotSource::Ws);
        let d = make_decision(
            "mkt-1",
            "cand-1",
            &snap,
            &DecisionInputs {
                p_eff: 0.50,
                order_size_usd: 2.0,
                dispute_risk: 0.1,
                evidence_conflict_tier1: false,
                decision_to_exec_sec: 0.0,
                time_to_resolution_days: 7.0,
                fee_rate_bps: 0.0,
                is_paper: true,
            },
        );
        assert!(d.is_trade());
        d
    }

    #[test]
    fn stale_decision_is_aborted() {
        let h = harness();
        let mut d = trade_decision();
        let version = h.locks.acquire("mkt-1", "w1").unwrap();
        d.decided_at_ms -= (MAX_DECISION_TO_EXEC_DELAY_SEC + 1) * 1000;
        match h.engine.submit(&d, "w1", version, false, 0.0).unwrap() {
            ExecutionOutcome::Aborted { reason, .. } => {
                assert_eq!(reason, NoTradeReason::CandidateExpired)
            }
            other => panic!("expected abort, got {other:?}"),
        }
    }

    #[test]
    fn submit_requires_valid_lock() {
        let h = harness();
        let d = trade_decision();
        // No lock held at all.
        match h.engine.submit(&d, "w1", 1, false, 0.0).unwrap() {
            ExecutionOutcome::Aborted { reason, .. } => {
                assert_eq!(reason, NoTradeReason::LockLost)
            }
            other => panic!("expected abort, got {other:?}"),
        }
    }

    #[test]
    fn live_submit_requires_reconcile_green() {
        let h = harness();
        let d = trade_decision();
        let version = h.locks.acquire("mkt-1", "w1").unwrap();
        // No reconciliation has run: red.
        match h.engine.submit(&d, "w1", version, true, 0.0).unwrap() {
            ExecutionOutcome::Aborted { reason, .. } => {
                assert_eq!(reason, NoTradeReason::ReconcileRed)
            }
            other => panic!("expected abort, got {other:?}"),
        }

        // After a clean reconcile the same submission goes through.
        h.reconcile
            .reconcile_positions(&Default::default(), &Default::default());
        match h.engine.submit(&d, "w1", version, true, 0.0).unwrap() {
            ExecutionOutcome::Submitted { .. } => {}
            other => panic!("expected submit, got {other:?}"),
        }
    }

    #[test]
    fn paper_fill_requires_through_plus_sustain() {
        let h = harness();
        let d = trade_decision();
        let version = h.locks.acquire("mkt-1", "w1").unwrap();
        let local_order_id = match h.engine.submit(&d, "w1", version, false, 0.0).unwrap() {
            ExecutionOutcome::Submitted { local_order_id } => local_order_id,
            other => panic!("expected submit, got {other:?}"),
        };

        let t0: i64 = 1_000_000;
        // Touch at the limit: never a fill.
        assert!(h.engine.on_price("mkt-1", Side::Yes, 0.42, t0).unwrap().is_empty());
        assert!(h
            .engine
            .on_price("mkt-1", Side::Yes, 0.42, t0 + 10_000)
            .unwrap()
            .is_empty());

        // Through by a tick, but not sustained yet.
        assert!(h.engine.on_price("mkt-1", Side::Yes, 0.41, t0 + 11_000).unwrap().is_empty());
        // Recovers above the through threshold: timer resets.
        assert!(h.engine.on_price("mkt-1", Side::Yes, 0.42, t0 + 12_000).unwrap().is_empty());
        // Through again and sustained for 3 seconds: fill at the limit.
        assert!(h.engine.on_price("mkt-1", Side::Yes, 0.405, t0 + 13_000).unwrap().is_empty());
        let fills = h
            .engine
            .on_price("mkt-1", Side::Yes, 0.405, t0 + 16_100)
            .unwrap();
        assert_eq!(fills.len(), 1);
        assert_eq!(fills[0].local_order_id, local_order_id);
        assert_eq!(fills[0].price, 0.42);
        // Paper fee: max(0, 10) bps × 2 on $2 notional.
        assert!((fills[0].fee_usd - 0.004).abs() < 1e-12);

        // The order is terminal; further prices produce nothing.
        assert!(h
            .engine
            .on_price("mkt-1", Side::Yes, 0.30, t0 + 30_000)
            .unwrap()
            .is_empty());
        assert!(h.engine.open_orders().is_empty());
    }

    #[test]
    fn no_fill_when_price_stays_at_or_above_limit() {
        let h = harness();
        let d = trade_decision();
        let version = h.locks.acquire("mkt-1", "w1").unwrap();
        h.engine.submit(&d, "w1", version, false, 0.0).unwrap();

        let t0: i64 = 0;
        for i in 0..100 {
            let fills = h
                .engine
                .on_price("mkt-1", Side::Yes, 0.42 + (i % 5) as f64 * 0.01, t0 + i * 1000)
                .unwrap();
            assert!(fills.is_empty(), "touch must never fill");
        }
    }

    #[test]
    fn cancel_is_terminal() {
        let h = harness();
        let d = trade_decision();
        let version = h.locks.acquire("mkt-1", "w1").unwrap();
        let local_order_id = match h.engine.submit(&d, "w1", version, false, 0.0).unwrap() {
            ExecutionOutcome::Submitted { local_order_id } => local_order_id,
            other => panic!("expected submit, got {other:?}"),
        };

        assert!(h.engine.cancel(&local_order_id).unwrap());
        // Second cancel is a no-op.
        assert!(!h.engine.cancel(&local_order_id).unwrap());
        // A cancelled order never fills.
        assert!(h.engine.on_price("mkt-1", Side::Yes, 0.10, 0).unwrap().is_empty());
        assert!(h.engine.on_price("mkt-1", Side::Yes, 0.10, 10_000).unwrap().is_empty());
    }

    #[test]
    fn duplicate_submission_is_idempotent_in_store() {
        let h = harness();
        let d = trade_decision();
        let version = h.locks.acquire("mkt-1", "w1").unwrap();
        h.engine.submit(&d, "w1", version, false, 0.0).unwrap();
        // Same decision id: the store keeps a single row keyed on it.
        h.engine.submit(&d, "w1", version, false, 0.0).unwrap();
        // Risk gate still allows (no position yet) but the order table holds
        // one row per decision id.
    }
}

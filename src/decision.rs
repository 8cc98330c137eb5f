// =============================================================================
// Decision engine — friction model, EV rule, deterministic decision id
// =============================================================================
//
// The decision id is a SHA-256 over canonical rounded fields: re-running the
// engine on identical inputs produces the identical id, which doubles as the
// client order id and makes submission naturally idempotent.
// =============================================================================

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::constants::{
    BOOK_LEVELS_REQUIRED, EV_MIN, PAPER_FEE_MULTIPLIER, PAPER_MIN_FEE_BPS,
};
use crate::market_data::{top_depth_usd, Snapshot};
use crate::types::{NoTradeReason, RecommendedSide};

fn round6(x: f64) -> f64 {
    (x * 1e6).round() / 1e6
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

// ---------------------------------------------------------------------------
// Friction components
// ---------------------------------------------------------------------------

/// Maker-first spread cost: half the touch.
pub fn spread_cost(bid: f64, ask: f64) -> f64 {
    0.5 * (ask - bid).max(0.0)
}

/// Fee cost per $1 payout share. Paper mode floors the rate and doubles it.
pub fn fee_cost(fee_rate_bps: f64, is_paper: bool) -> f64 {
    if is_paper {
        fee_rate_bps.max(PAPER_MIN_FEE_BPS) * PAPER_FEE_MULTIPLIER / 10_000.0
    } else {
        fee_rate_bps / 10_000.0
    }
}

pub fn slippage_buffer(order_size_usd: f64, depth_usd_top_levels: f64) -> f64 {
    (order_size_usd / depth_usd_top_levels.max(1.0) * 0.02).max(0.005)
}

/// Dispute buffer, raised 1.5x when tier-1 evidence conflicted.
pub fn dispute_buffer(dispute_risk: f64, evidence_conflict_tier1: bool) -> f64 {
    let buf = 0.01 + 0.02 * dispute_risk;
    if evidence_conflict_tier1 {
        buf * 1.5
    } else {
        buf
    }
}

pub fn latency_penalty(decision_to_exec_sec: f64) -> f64 {
    (decision_to_exec_sec - 2.0).max(0.0) * 0.001
}

pub fn time_value_penalty(time_to_resolution_days: f64) -> f64 {
    (time_to_resolution_days * 0.0002).min(0.02)
}

/// Per-side friction breakdown carried on every decision.
#[derive(Debug, Clone, Serialize)]
pub struct FrictionBreakdown {
    pub spread_cost_yes: f64,
    pub spread_cost_no: f64,
    pub fee_cost: f64,
    pub slippage_yes: f64,
    pub slippage_no: f64,
    pub dispute_buffer: f64,
    pub latency_penalty: f64,
    pub time_value_penalty: f64,
}

// ---------------------------------------------------------------------------
// Decision
// ---------------------------------------------------------------------------

/// The auditable outcome of one decision-engine run.
#[derive(Debug, Clone, Serialize)]
pub struct Decision {
    pub decision_id_hex: String,
    pub market_id: String,
    pub candidate_id: String,
    pub side: RecommendedSide,
    pub size_usd: f64,
    pub entry_price: f64,
    pub p_eff: f64,
    pub required_edge: f64,
    pub ev: f64,
    pub ev_yes: f64,
    pub ev_no: f64,
    pub reason: Option<NoTradeReason>,
    pub friction: FrictionBreakdown,
    /// Equal to the decision id: natural idempotency key for the venue.
    pub client_order_id: String,
    pub is_paper: bool,
    /// Wall-clock decision time; not part of the canonical hash.
    pub decided_at_ms: i64,
}

impl Decision {
    pub fn is_trade(&self) -> bool {
        self.side != RecommendedSide::NoTrade
    }
}

/// Inputs that do not come from the snapshot.
#[derive(Debug, Clone)]
pub struct DecisionInputs {
    pub p_eff: f64,
    pub order_size_usd: f64,
    pub dispute_risk: f64,
    pub evidence_conflict_tier1: bool,
    pub decision_to_exec_sec: f64,
    pub time_to_resolution_days: f64,
    pub fee_rate_bps: f64,
    pub is_paper: bool,
}

/// Run the full friction model and EV rule for one candidate.
pub fn make_decision(
    market_id: &str,
    candidate_id: &str,
    snapshot: &Snapshot,
    inputs: &DecisionInputs,
) -> Decision {
    let bid_yes = snapshot.best_bid_yes.unwrap_or(0.0);
    let ask_yes = snapshot.best_ask_yes.unwrap_or(0.0);
    let bid_no = snapshot.best_bid_no.unwrap_or(0.0);
    let ask_no = snapshot.best_ask_no.unwrap_or(0.0);

    let depth_yes = top_depth_usd(&snapshot.depth_yes, BOOK_LEVELS_REQUIRED);
    let depth_no = top_depth_usd(&snapshot.depth_no, BOOK_LEVELS_REQUIRED);

    let spread_yes = spread_cost(bid_yes, ask_yes);
    let spread_no = spread_cost(bid_no, ask_no);
    let fee = fee_cost(inputs.fee_rate_bps, inputs.is_paper);
    let slippage_yes = slippage_buffer(inputs.order_size_usd, depth_yes);
    let slippage_no = slippage_buffer(inputs.order_size_usd, depth_no);
    let dispute = dispute_buffer(inputs.dispute_risk, inputs.evidence_conflict_tier1);
    let latency = latency_penalty(inputs.decision_to_exec_sec);
    let time_value = time_value_penalty(inputs.time_to_resolution_days);

    let edge_yes = spread_yes + fee + slippage_yes + dispute + latency + time_value;
    let edge_no = spread_no + fee + slippage_no + dispute + latency + time_value;

    let ev_yes = inputs.p_eff - ask_yes - edge_yes;
    let ev_no = (1.0 - inputs.p_eff) - ask_no - edge_no;

    let (side, ev, entry_price, required_edge, reason) = if ev_yes >= EV_MIN && ev_yes >= ev_no {
        (RecommendedSide::Yes, ev_yes, ask_yes, edge_yes, None)
    } else if ev_no >= EV_MIN {
        (RecommendedSide::No, ev_no, ask_no, edge_no, None)
    } else {
        (
            RecommendedSide::NoTrade,
            ev_yes.max(ev_no),
            0.0,
            edge_yes.max(edge_no),
            Some(NoTradeReason::EvTooLow),
        )
    };

    let canonical = serde_json::json!({
        "candidate_id": candidate_id,
        "entry_price": round6(entry_price),
        "ev": round6(ev),
        "market_id": market_id,
        "order_size_usd": round2(inputs.order_size_usd),
        "p_eff": round6(inputs.p_eff),
        "required_edge": round6(required_edge),
        "side": side.as_str(),
    });
    let canonical_json =
        serde_json::to_string(&canonical).expect("canonical decision serializes");
    let mut hasher = Sha256::new();
    hasher.update(canonical_json.as_bytes());
    let decision_id_hex = hex::encode(hasher.finalize());

    Decision {
        decision_id_hex: decision_id_hex.clone(),
        market_id: market_id.to_string(),
        candidate_id: candidate_id.to_string(),
        side,
        size_usd: round2(inputs.order_size_usd),
        entry_price: round6(entry_price),
        p_eff: round6(inputs.p_eff),
        required_edge: round6(required_edge),
        ev: round6(ev),
        ev_yes: round6(ev_yes),
        ev_no: round6(ev_no),
        reason,
        friction: FrictionBreakdown {
            spread_cost_yes: round6(spread_yes),
            spread_cost_no: round6(spread_no),
            fee_cost: round6(fee),
            slippage_yes: round6(slippage_yes),
            slippage_no: round6(slippage_no),
            dispute_buffer: round6(dispute),
            latency_penalty: round6(latency),
            time_value_penalty: round6(time_value),
        },
        client_order_id: decision_id_hex,
        is_paper: inputs.is_paper,
        decided_at_ms: chrono::Utc::now().timestamp_millis(),
    }
}

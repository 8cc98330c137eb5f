// =============================================================================
// Candidate pipeline — trigger detection with anti-spoof persistence
// =============================================================================
//
// A trigger never enqueues a candidate directly. It must fire on at least
// TRIGGER_PERSIST_UPDATES distinct WS snapshots spanning at least
// TRIGGER_PERSIST_MIN_SEC per (market, trigger kind); the same snapshot id
// never double-counts. Sliding windows cap enqueue rates globally and per
// market.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::constants::{
    CANDIDATES_PER_MIN_MAX, CANDIDATE_MAX_AGE_SEC, PER_MARKET_CANDIDATES_PER_MIN_MAX,
    TIME_TO_RESOLUTION_MIN_SEC, TRIGGER_DEPTH_DROP_RATIO, TRIGGER_MID_MOVE_ABS,
    TRIGGER_PERSIST_MIN_SEC, TRIGGER_PERSIST_UPDATES, TRIGGER_SPREAD_CHANGE_ABS,
};
use crate::market_data::Snapshot;
use crate::registry::Market;
use crate::types::{CandidateStatus, NoTradeReason, TriggerKind};

/// A potential trading opportunity created when a trigger persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub candidate_id: String,
    pub market_id: String,
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
    pub trigger_reasons: Vec<TriggerKind>,
    pub status: CandidateStatus,
    pub filter_reason: Option<NoTradeReason>,
    pub decision_id_hex: Option<String>,
    /// Filled in by the risk manager before the evidence stage.
    pub intended_size_usd: f64,
}

impl Candidate {
    pub fn new(market_id: &str, snapshot_id: &str, trigger_reasons: Vec<TriggerKind>) -> Self {
        Self {
            candidate_id: Uuid::new_v4().to_string(),
            market_id: market_id.to_string(),
            snapshot_id: snapshot_id.to_string(),
            created_at: Utc::now(),
            trigger_reasons,
            status: CandidateStatus::New,
            filter_reason: None,
            decision_id_hex: None,
            intended_size_usd: 0.0,
        }
    }

    pub fn age_sec(&self, now: DateTime<Utc>) -> i64 {
        (now - self.created_at).num_seconds()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.age_sec(now) > CANDIDATE_MAX_AGE_SEC
    }
}

// ---------------------------------------------------------------------------
// Trigger detection
// ---------------------------------------------------------------------------

/// Detect which triggers fire for the latest snapshot of a market.
pub fn detect_triggers(
    snapshot: &Snapshot,
    prev: Option<&Snapshot>,
    market: Option<&Market>,
    now: DateTime<Utc>,
) -> Vec<TriggerKind> {
    let mut triggers = Vec::new();

    if let (Some(mid), Some(prev_mid)) = (snapshot.mid_yes(), prev.and_then(|p| p.mid_yes())) {
        if (mid - prev_mid).abs() > TRIGGER_MID_MOVE_ABS {
            triggers.push(TriggerKind::MidMove);
        }
    }

    if let (Some(spread), Some(prev_spread)) =
        (snapshot.spread_yes(), prev.and_then(|p| p.spread_yes()))
    {
        if (spread - prev_spread).abs() > TRIGGER_SPREAD_CHANGE_ABS {
            triggers.push(TriggerKind::SpreadChange);
        }
    }

    if let Some(prev) = prev {
        let prev_depth = prev.top_depth_yes();
        if prev_depth > 0.0 && snapshot.top_depth_yes() < prev_depth * TRIGGER_DEPTH_DROP_RATIO {
            triggers.push(TriggerKind::DepthDrop);
        }
    }

    if let Some(remaining) = market.and_then(|m| m.time_to_resolution_sec(now)) {
        if remaining >= TIME_TO_RESOLUTION_MIN_SEC && remaining <= 24 * 3600 {
            triggers.push(TriggerKind::ApproachingResolution);
        }
    }

    triggers
}

// ---------------------------------------------------------------------------
// Persistence tracker (anti-spoof)
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct TriggerEntry {
    first_seen_ms: i64,
    count: u32,
    last_snapshot_id: String,
}

/// Per-(market, trigger) persistence tracker.
#[derive(Debug, Default)]
pub struct TriggerTracker {
    state: HashMap<(String, TriggerKind), TriggerEntry>,
}

impl TriggerTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a trigger firing. Returns `true` once the persistence
    /// thresholds are met (≥ 3 distinct snapshots spanning ≥ 6 s).
    pub fn record(
        &mut self,
        market_id: &str,
        kind: TriggerKind,
        snapshot_id: &str,
        now_ms: i64,
    ) -> bool {
        let key = (market_id.to_string(), kind);

        let entry = self.state.entry(key).or_insert_with(|| TriggerEntry {
            first_seen_ms: now_ms,
            count: 0,
            last_snapshot_id: String::new(),
        });

        if entry.last_snapshot_id == snapshot_id {
            return false;
        }
        entry.count += 1;
        entry.last_snapshot_id = snapshot_id.to_string();

        let elapsed_ms = now_ms - entry.first_seen_ms;
        let met = entry.count >= TRIGGER_PERSIST_UPDATES
            && elapsed_ms >= TRIGGER_PERSIST_MIN_SEC * 1000;
        if met {
            debug!(
                market_id,
                trigger = %kind,
                count = entry.count,
                elapsed_ms,
                "trigger persistence met"
            );
        }
        met
    }

    /// Drop tracking for one trigger (after enqueue or when it stops firing).
    pub fn clear(&mut self, market_id: &str, kind: TriggerKind) {
        self.state.remove(&(market_id.to_string(), kind));
    }

    pub fn clear_market(&mut self, market_id: &str) {
        self.state.retain(|(m, _), _| m != market_id);
    }
}

// ---------------------------------------------------------------------------
// Rate limiter
// ---------------------------------------------------------------------------

/// Sliding-window enqueue caps: 50/min globally, 10/min per market.
#[derive(Debug, Default)]
pub struct CandidateRateLimiter {
    global: VecDeque<i64>,
    per_market: HashMap<String, VecDeque<i64>>,
}

impl CandidateRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn prune(window: &mut VecDeque<i64>, now_ms: i64) {
        let cutoff = now_ms - 60_000;
        while window.front().is_some_and(|t| *t <= cutoff) {
            window.pop_front();
        }
    }

    pub fn can_enqueue(&mut self, market_id: &str, now_ms: i64) -> bool {
        Self::prune(&mut self.global, now_ms);
        let market = self.per_market.entry(market_id.to_string()).or_default();
        Self::prune(market, now_ms);

        self.global.len() < CANDIDATES_PER_MIN_MAX
            && market.len() < PER_MARKET_CANDIDATES_PER_MIN_MAX
    }

    pub fn record_enqueue(&mut self, market_id: &str, now_ms: i64) {
        self.global.push_back(now_ms);
        self.per_market
            .entry(market_id.to_string())
            .or_default()
            .push_back(now_ms);
    }
}

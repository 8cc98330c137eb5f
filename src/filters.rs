// =============================================================================
// Coarse deterministic filters — ten ordered rejects, first failure wins
// =============================================================================

use chrono::{DateTime, Utc};

use crate::candidates::Candidate;
use crate::constants::{
    MAX_SPREAD_ABS, MIN_DEPTH_USD_NEAR_TOP, MIN_LIQUIDITY_USD, MIN_VOLUME_24H_USD,
    TIME_TO_RESOLUTION_MAX_SEC, TIME_TO_RESOLUTION_MIN_SEC,
};
use crate::market_data::{Snapshot, WsHealthView};
use crate::registry::Market;
use crate::types::NoTradeReason;
use crate::ws_health::ws_healthy_decision;

fn filter_candidate_age(candidate: &Candidate, now: DateTime<Utc>) -> Option<NoTradeReason> {
    if candidate.is_expired(now) {
        return Some(NoTradeReason::CandidateExpired);
    }
    None
}

fn filter_market_eligible(market: &Market) -> Option<NoTradeReason> {
    if !market.is_binary_eligible || market.frozen {
        return Some(NoTradeReason::MarketNotEligible);
    }
    None
}

fn filter_time_to_resolution(market: &Market, now: DateTime<Utc>) -> Option<NoTradeReason> {
    match market.time_to_resolution_sec(now) {
        Some(remaining)
            if (TIME_TO_RESOLUTION_MIN_SEC..=TIME_TO_RESOLUTION_MAX_SEC)
                .contains(&remaining) =>
        {
            None
        }
        _ => Some(NoTradeReason::TimeToResolutionOutOfRange),
    }
}

fn filter_volume(market: &Market) -> Option<NoTradeReason> {
    if market.volume_24h_usd < MIN_VOLUME_24H_USD {
        return Some(NoTradeReason::VolumeTooLow);
    }
    None
}

fn filter_liquidity(market: &Market) -> Option<NoTradeReason> {
    if market.liquidity_usd < MIN_LIQUIDITY_USD {
        return Some(NoTradeReason::LiquidityTooLow);
    }
    None
}

fn filter_invalid_book(snapshot: &Snapshot) -> Option<NoTradeReason> {
    if snapshot.invalid_book_anomaly {
        return Some(NoTradeReason::SnapshotInvalidBook);
    }
    None
}

fn filter_ask_sum_anomaly(snapshot: &Snapshot) -> Option<NoTradeReason> {
    if snapshot.ask_sum_anomaly {
        return Some(NoTradeReason::SnapshotAskSumAnomaly);
    }
    None
}

fn filter_spread(snapshot: &Snapshot) -> Option<NoTradeReason> {
    if let Some(spread) = snapshot.spread_yes() {
        if spread > MAX_SPREAD_ABS {
            return Some(NoTradeReason::SpreadTooWide);
        }
    }
    if let Some(spread) = snapshot.spread_no() {
        if spread > MAX_SPREAD_ABS {
            return Some(NoTradeReason::SpreadTooWide);
        }
    }
    None
}

fn filter_depth(snapshot: &Snapshot) -> Option<NoTradeReason> {
    if snapshot.top_depth_yes() < MIN_DEPTH_USD_NEAR_TOP
        || snapshot.top_depth_no() < MIN_DEPTH_USD_NEAR_TOP
    {
        return Some(NoTradeReason::DepthTooThin);
    }
    None
}

fn filter_ws_health(
    market_id: &str,
    snapshot: &Snapshot,
    ws: &WsHealthView,
    now: DateTime<Utc>,
) -> Option<NoTradeReason> {
    let (healthy, _reasons) = ws_healthy_decision(market_id, snapshot, ws, now.timestamp_millis());
    if !healthy {
        return Some(NoTradeReason::WsUnhealthyDecision);
    }
    None
}

/// Run the ten coarse filters in fixed order. The first failure yields a
/// single canonical reject reason.
pub fn run_all_filters(
    candidate: &Candidate,
    market: &Market,
    snapshot: &Snapshot,
    ws: Option<&WsHealthView>,
    now: DateTime<Utc>,
) -> Result<(), NoTradeReason> {
    let checks = [
        filter_candidate_age(candidate, now),
        filter_market_eligible(market),
        filter_time_to_resolution(market, now),
        filter_volume(market),
        filter_liquidity(market),
        filter_invalid_book(snapshot),
        filter_ask_sum_anomaly(snapshot),
        filter_spread(snapshot),
        filter_depth(snapshot),
    ];
    for reason in checks.into_iter().flatten() {
        return Err(reason);
    }

    if let Some(ws) = ws {
        if let Some(reason) = filter_ws_health(&candidate.market_id, snapshot, ws, now) {
            return Err(reason);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidates::Candidate;
    use crate::market_data::BookUpdate;
    use crate::market_data::snapshots::build_snapshot;
    use crate::types::{SnapshotSource, TriggerKind};

    fn market(now: DateTime<Utc>) -> Market {
        Market {
            market_id: "mkt-1".to_string(),
            condition_id: "cond-1".to_string(),
            category: "economics".to_string(),
            title: "t".to_string(),
            description: "d".to_string(),
            resolution_source: "official source".to_string(),
            end_date_utc: Some(now + chrono::Duration::days(7)),
            yes_token_id: "y".to_string(),
            no_token_id: "n".to_string(),
            volume_24h_usd: 85_000.0,
            liquidity_usd: 120_000.0,
            critical_field_hash: "h".to_string(),
            is_binary_eligible: true,
            eligibility_reason: None,
            frozen: false,
        }
    }

    fn snapshot(bid_yes: f64, ask_yes: f64, bid_no: f64, ask_no: f64) -> Snapshot {
        let update = BookUpdate {
            market_id: "mkt-1".to_string(),
            best_bid_yes: Some(bid_yes),
            best_ask_yes: Some(ask_yes),
            best_bid_no: Some(bid_no),
            best_ask_no: Some(ask_no),
            depth_yes: vec![(bid_yes, 100.0), (bid_yes - 0.01, 100.0), (bid_yes - 0.02, 100.0)],
            depth_no: vec![(bid_no, 100.0), (bid_no - 0.01, 100.0), (bid_no - 0.02, 100.0)],
            ws_last_message_ms: Utc::now().timestamp_millis(),
            market_last_update_ms: Some(Utc::now().timestamp_millis()),
            orderbook_last_change_ms: Some(Utc::now().timestamp_millis()),
            snapshot_ws_epoch: 1,
        };
        build_snapshot(&update, SnapshotSource::Ws)
    }

    fn candidate() -> Candidate {
        Candidate::new("mkt-1", "snap-1", vec![TriggerKind::MidMove])
    }

    #[test]
    fn clean_candidate_passes_all_filters() {
        let now = Utc::now();
        let snap = snapshot(0.40, 0.42, 0.58, 0.60);
        assert_eq!(
            run_all_filters(&candidate(), &market(now), &snap, None, now),
            Ok(())
        );
    }

    #[test]
    fn expired_candidate_rejected_first() {
        let now = Utc::now();
        let mut c = candidate();
        c.created_at = now - chrono::Duration::seconds(200);
        // Even with a broken market the age filter wins.
        let mut m = market(now);
        m.is_binary_eligible = false;
        let snap = snapshot(0.40, 0.42, 0.58, 0.60);
        assert_eq!(
            run_all_filters(&c, &m, &snap, None, now),
            Err(NoTradeReason::CandidateExpired)
        );
    }

    #[test]
    fn frozen_market_is_not_eligible() {
        let now = Utc::now();
        let mut m = market(now);
        m.frozen = true;
        let snap = snapshot(0.40, 0.42, 0.58, 0.60);
        assert_eq!(
            run_all_filters(&candidate(), &m, &snap, None, now),
            Err(NoTradeReason::MarketNotEligible)
        );
    }

    #[test]
    fn resolution_window_enforced() {
        let now = Utc::now();
        let mut m = market(now);
        m.end_date_utc = Some(now + chrono::Duration::minutes(30));
        let snap = snapshot(0.40, 0.42, 0.58, 0.60);
        assert_eq!(
            run_all_filters(&candidate(), &m, &snap, None, now),
            Err(NoTradeReason::TimeToResolutionOutOfRange)
        );
    }

    #[test]
    fn volume_and_liquidity_floors() {
        let now = Utc::now();
        let snap = snapshot(0.40, 0.42, 0.58, 0.60);

        let mut m = market(now);
        m.volume_24h_usd = 100.0;
        assert_eq!(
            run_all_filters(&candidate(), &m, &snap, None, now),
            Err(NoTradeReason::VolumeTooLow)
        );

        let mut m = market(now);
        m.liquidity_usd = 500.0;
        assert_eq!(
            run_all_filters(&candidate(), &m, &snap, None, now),
            Err(NoTradeReason::LiquidityTooLow)
        );
    }

    #[test]
    fn ask_sum_anomaly_rejected_at_filter_seven() {
        let now = Utc::now();
        // YES_ask 0.45 + NO_ask 0.50 = 0.95 < 0.98.
        let snap = snapshot(0.43, 0.45, 0.48, 0.50);
        assert_eq!(
            run_all_filters(&candidate(), &market(now), &snap, None, now),
            Err(NoTradeReason::SnapshotAskSumAnomaly)
        );
    }

    #[test]
    fn wide_spread_rejected() {
        let now = Utc::now();
        let snap = snapshot(0.40, 0.45, 0.55, 0.60);
        assert_eq!(
            run_all_filters(&candidate(), &market(now), &snap, None, now),
            Err(NoTradeReason::SpreadTooWide)
        );
    }

    #[test]
    fn thin_depth_rejected() {
        let now = Utc::now();
        let mut snap = snapshot(0.40, 0.42, 0.58, 0.60);
        snap.depth_yes = vec![(0.40, 10.0)];
        assert_eq!(
            run_all_filters(&candidate(), &market(now), &snap, None, now),
            Err(NoTradeReason::DepthTooThin)
        );
    }

    #[test]
    fn unhealthy_ws_rejected_last() {
        let now = Utc::now();
        let snap = snapshot(0.40, 0.42, 0.58, 0.60);
        let ws = WsHealthView {
            connected: false,
            last_message_ms: 0,
            epoch: 99,
        };
        assert_eq!(
            run_all_filters(&candidate(), &market(now), &snap, Some(&ws), now),
            Err(NoTradeReason::WsUnhealthyDecision)
        );
    }
}

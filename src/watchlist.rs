// =============================================================================
// Watchlist — bounded scored market selection with probation and quarantine
// =============================================================================
//
// Up to 200 markets are watched, scored by resolution proximity, volume,
// liquidity, spread tightness, and recent book activity. Markets with
// repeated anomalies sit in probation; markets that trigger constantly
// without ever producing a trade are quarantined for two hours.
// =============================================================================

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use crate::constants::{
    MAX_SPREAD_ABS, MIN_LIQUIDITY_USD, MIN_VOLUME_24H_USD, PROBATION_MAX,
    TIME_TO_RESOLUTION_MAX_SEC, TIME_TO_RESOLUTION_MIN_SEC, WATCHLIST_MAX,
};
use crate::registry::Market;
use crate::store::Store;

/// Triggers per hour that all yield no trade before a market is quarantined.
pub const QUARANTINE_TRIGGER_THRESHOLD: u32 = 10;
pub const QUARANTINE_DURATION_HOURS: i64 = 2;
pub const PROBATION_DURATION_HOURS: i64 = 2;

/// Watchlist priority score. Higher is watched first.
pub fn score_market(
    market: &Market,
    spread: Option<f64>,
    orderbook_last_change_ms: Option<i64>,
    now: DateTime<Utc>,
) -> f64 {
    let mut score = 0.0;

    // Resolution proximity (0-40): closer scores higher inside the window.
    match market.time_to_resolution_sec(now) {
        Some(remaining)
            if (TIME_TO_RESOLUTION_MIN_SEC..=TIME_TO_RESOLUTION_MAX_SEC)
                .contains(&remaining) =>
        {
            let fraction_remaining = remaining as f64 / TIME_TO_RESOLUTION_MAX_SEC as f64;
            score += 40.0 * (1.0 - fraction_remaining);
        }
        _ => score -= 10.0,
    }

    // Volume (0-20), log scale.
    if market.volume_24h_usd >= MIN_VOLUME_24H_USD {
        score += (market.volume_24h_usd.max(1.0).log10() * 4.0).min(20.0);
    } else {
        score -= 5.0;
    }

    // Liquidity (0-20), log scale.
    if market.liquidity_usd >= MIN_LIQUIDITY_USD {
        score += (market.liquidity_usd.max(1.0).log10() * 4.0).min(20.0);
    } else {
        score -= 5.0;
    }

    // Spread tightness (0-10).
    if let Some(spread) = spread {
        if spread <= MAX_SPREAD_ABS {
            score += 10.0 * (1.0 - spread / MAX_SPREAD_ABS);
        }
    }

    // Recent book activity (0-10).
    if let Some(changed) = orderbook_last_change_ms {
        let age_sec = (now.timestamp_millis() - changed) as f64 / 1000.0;
        if age_sec < 60.0 {
            score += 10.0;
        } else if age_sec < 300.0 {
            score += 5.0;
        } else if age_sec < 900.0 {
            score += 2.0;
        }
    }

    (score * 10_000.0).round() / 10_000.0
}

#[derive(Debug, Default, Clone)]
pub struct WatchlistStats {
    pub selected: usize,
    pub excluded_probation: usize,
    pub excluded_quarantine: usize,
}

/// Rebuild the watchlist from eligible markets, excluding probation and
/// quarantine, keeping the top [`WATCHLIST_MAX`] by score.
pub fn refresh_watchlist(
    store: &Store,
    eligible: &[Market],
    now: DateTime<Utc>,
) -> anyhow::Result<WatchlistStats> {
    let now_str = now.to_rfc3339();
    let probation: HashSet<String> = store.active_probation_ids(&now_str)?.into_iter().collect();
    let quarantine: HashSet<String> =
        store.active_quarantine_ids(&now_str)?.into_iter().collect();

    let mut scored: Vec<(String, f64)> = eligible
        .iter()
        .filter(|m| m.is_binary_eligible && !m.frozen)
        .filter(|m| !probation.contains(&m.market_id) && !quarantine.contains(&m.market_id))
        .map(|m| (m.market_id.clone(), score_market(m, None, None, now)))
        .collect();

    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).expect("scores are finite"));
    scored.truncate(WATCHLIST_MAX);

    let stats = WatchlistStats {
        selected: scored.len(),
        excluded_probation: probation.len(),
        excluded_quarantine: quarantine.len(),
    };
    store.replace_watchlist(&scored, &now_str)?;

    info!(
        selected = stats.selected,
        probation = stats.excluded_probation,
        quarantine = stats.excluded_quarantine,
        "watchlist refreshed"
    );
    Ok(stats)
}

/// Put a market on probation after repeated anomalies. Bounded by
/// [`PROBATION_MAX`] active entries.
pub fn add_to_probation(
    store: &Store,
    market_id: &str,
    reason: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<bool> {
    let now_str = now.to_rfc3339();
    if store.probation_count(&now_str)? >= PROBATION_MAX {
        warn!(market_id, "probation list full");
        return Ok(false);
    }
    let until = (now + Duration::hours(PROBATION_DURATION_HOURS)).to_rfc3339();
    store.upsert_probation(market_id, reason, &until, &now_str)?;
    info!(market_id, reason, until = %until, "market on probation");
    Ok(true)
}

/// Track trigger noise for a market and quarantine it once it crosses the
/// threshold with nothing but no-trades. Returns whether the market is now
/// quarantined.
pub fn track_trigger_noise(
    store: &Store,
    market_id: &str,
    yielded_no_trade: bool,
    now: DateTime<Utc>,
) -> anyhow::Result<bool> {
    let now_str = now.to_rfc3339();

    if store
        .active_quarantine_ids(&now_str)?
        .iter()
        .any(|m| m == market_id)
    {
        return Ok(true);
    }

    let (mut triggers, mut no_trades, _) = store
        .quarantine_counts(market_id)?
        .unwrap_or((0, 0, now_str.clone()));
    triggers += 1;
    if yielded_no_trade {
        no_trades += 1;
    }

    let should_quarantine = triggers > QUARANTINE_TRIGGER_THRESHOLD && no_trades >= triggers;
    let until = if should_quarantine {
        (now + Duration::hours(QUARANTINE_DURATION_HOURS)).to_rfc3339()
    } else {
        now_str.clone()
    };

    store.upsert_quarantine(market_id, triggers, no_trades, &until, &now_str)?;

    if should_quarantine {
        warn!(
            market_id,
            triggers, no_trades, "market quarantined for trigger noise"
        );
    }
    Ok(should_quarantine)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn market(id: &str, days_out: i64, volume: f64, liquidity: f64, now: DateTime<Utc>) -> Market {
        Market {
            market_id: id.to_string(),
            condition_id: "c".to_string(),
            category: "economics".to_string(),
            title: "t".to_string(),
            description: "d".to_string(),
            resolution_source: "r".to_string(),
            end_date_utc: Some(now + Duration::days(days_out)),
            yes_token_id: "y".to_string(),
            no_token_id: "n".to_string(),
            volume_24h_usd: volume,
            liquidity_usd: liquidity,
            critical_field_hash: "h".to_string(),
            is_binary_eligible: true,
            eligibility_reason: None,
            frozen: false,
        }
    }

    fn store() -> Store {
        let s = Store::open_in_memory().unwrap();
        s.migrate().unwrap();
        s
    }

    #[test]
    fn closer_resolution_scores_higher() {
        let now = Utc::now();
        let near = market("near", 2, 10_000.0, 50_000.0, now);
        let far = market("far", 80, 10_000.0, 50_000.0, now);
        assert!(
            score_market(&near, None, None, now) > score_market(&far, None, None, now)
        );
    }

    #[test]
    fn thin_markets_score_lower() {
        let now = Utc::now();
        let liquid = market("a", 7, 100_000.0, 200_000.0, now);
        let thin = market("b", 7, 100.0, 100.0, now);
        assert!(
            score_market(&liquid, None, None, now) > score_market(&thin, None, None, now)
        );
    }

    #[test]
    fn tight_spread_and_activity_add_score() {
        let now = Utc::now();
        let m = market("a", 7, 10_000.0, 50_000.0, now);
        let base = score_market(&m, None, None, now);
        let tight = score_market(&m, Some(0.005), Some(now.timestamp_millis()), now);
        assert!(tight > base);
    }

    #[test]
    fn refresh_excludes_probation_and_quarantine() {
        let s = store();
        let now = Utc::now();
        let markets = vec![
            market("m1", 7, 10_000.0, 50_000.0, now),
            market("m2", 7, 10_000.0, 50_000.0, now),
            market("m3", 7, 10_000.0, 50_000.0, now),
        ];

        add_to_probation(&s, "m2", "repeated anomalies", now).unwrap();
        let until = (now + Duration::hours(2)).to_rfc3339();
        s.upsert_quarantine("m3", 11, 11, &until, &now.to_rfc3339()).unwrap();

        let stats = refresh_watchlist(&s, &markets, now).unwrap();
        assert_eq!(stats.selected, 1);
        assert_eq!(s.watchlist_ids().unwrap(), vec!["m1"]);
    }

    #[test]
    fn quarantine_requires_all_no_trades() {
        let s = store();
        let now = Utc::now();

        // Eleven noisy triggers with all no-trades: quarantined.
        let mut quarantined = false;
        for _ in 0..11 {
            quarantined = track_trigger_noise(&s, "noisy", true, now).unwrap();
        }
        assert!(quarantined);

        // A market that actually traded once never quarantines.
        for _ in 0..5 {
            track_trigger_noise(&s, "useful", true, now).unwrap();
        }
        track_trigger_noise(&s, "useful", false, now).unwrap();
        let mut q = false;
        for _ in 0..10 {
            q = track_trigger_noise(&s, "useful", true, now).unwrap();
        }
        assert!(!q);
    }

    #[test]
    fn probation_is_bounded() {
        let s = store();
        let now = Utc::now();
        for i in 0..PROBATION_MAX {
            assert!(add_to_probation(&s, &format!("m{i}"), "anomaly", now).unwrap());
        }
        assert!(!add_to_probation(&s, "overflow", "anomaly", now).unwrap());
    }
}

// =============================================================================
// Risk manager — sizing, exposure limits, TWAP risk mark, daily stop
// =============================================================================
//
// Limits: ≤2% of wallet per market, ≤10% total open exposure, ≤5 open
// positions. The daily stop transitions the engine to HALTED_DAILY when
// cumulative daily P&L reaches −3% of wallet. The risk mark uses a 60–300s
// TWAP with anti-spoof sample rejection.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::constants::{
    DAILY_STOP_LOSS_PCT, MAX_OPEN_POSITIONS, MAX_PER_MARKET_PCT, MAX_TOTAL_EXPOSURE_PCT,
    MIN_DEPTH_USD_NEAR_TOP, WALLET_STALE_SEC,
};
use crate::types::Side;

/// TWAP window bounds (seconds).
const TWAP_WINDOW_SEC: i64 = 300;
const TWAP_MIN_SPAN_SEC: i64 = 60;
const TWAP_MIN_SAMPLES: usize = 3;
const TWAP_OUTLIER_MIN_SAMPLES: usize = 10;

/// A sample rejected when spread is wider than this or depth thinner than
/// the near-top floor.
const TWAP_MAX_SPREAD: f64 = 0.10;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

#[derive(Debug, Clone)]
struct PositionEntry {
    side: Side,
    notional_usd: f64,
    entry_price: f64,
    opened_at_ms: i64,
}

#[derive(Debug, Clone, Copy)]
struct TwapSample {
    mid: f64,
    at_ms: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskStats {
    pub wallet_usd: f64,
    pub wallet_stale: bool,
    pub open_positions: usize,
    pub total_exposure_usd: f64,
    pub daily_pnl: f64,
    pub daily_stop_threshold: f64,
}

struct Inner {
    wallet_usd_last_good: f64,
    wallet_updated_at_ms: i64,
    positions: HashMap<String, PositionEntry>,
    daily_pnl: f64,
    twap: HashMap<String, Vec<TwapSample>>,
}

/// Single owner of position limits and the wallet reference value.
pub struct RiskManager {
    inner: RwLock<Inner>,
}

impl RiskManager {
    pub fn new(wallet_usd: f64) -> Self {
        info!(
            wallet_usd,
            max_per_market_pct = MAX_PER_MARKET_PCT,
            max_total_exposure_pct = MAX_TOTAL_EXPOSURE_PCT,
            max_open_positions = MAX_OPEN_POSITIONS,
            "risk manager initialised"
        );
        Self {
            inner: RwLock::new(Inner {
                wallet_usd_last_good: wallet_usd,
                wallet_updated_at_ms: now_ms(),
                positions: HashMap::new(),
                daily_pnl: 0.0,
                twap: HashMap::new(),
            }),
        }
    }

    // -------------------------------------------------------------------------
    // Sizing & limits
    // -------------------------------------------------------------------------

    /// Intended order size: min(per-market cap, remaining exposure capacity,
    /// venue balance), rounded to cents.
    pub fn compute_order_size(&self, venue_balance_usd: Option<f64>) -> f64 {
        let inner = self.inner.read();
        let max_per_market = MAX_PER_MARKET_PCT * inner.wallet_usd_last_good;
        let remaining = Self::remaining_capacity(&inner);

        let mut size = max_per_market.min(remaining);
        if let Some(balance) = venue_balance_usd {
            size = size.min(balance);
        }
        (size.max(0.0) * 100.0).round() / 100.0
    }

    fn total_exposure(inner: &Inner) -> f64 {
        inner.positions.values().map(|p| p.notional_usd).sum()
    }

    fn remaining_capacity(inner: &Inner) -> f64 {
        let max_exposure = MAX_TOTAL_EXPOSURE_PCT * inner.wallet_usd_last_good;
        (max_exposure - Self::total_exposure(inner)).max(0.0)
    }

    /// Pre-trade gate on position count and total exposure.
    pub fn can_open_position(&self, market_id: &str) -> Result<(), String> {
        let inner = self.inner.read();

        if inner.positions.contains_key(market_id) {
            return Err(format!("position already open on {market_id}"));
        }
        if inner.positions.len() >= MAX_OPEN_POSITIONS {
            return Err(format!("max positions {MAX_OPEN_POSITIONS} reached"));
        }
        let exposure = Self::total_exposure(&inner);
        if exposure >= MAX_TOTAL_EXPOSURE_PCT * inner.wallet_usd_last_good {
            return Err("max total exposure reached".to_string());
        }
        Ok(())
    }

    pub fn add_position(&self, market_id: &str, side: Side, size_usd: f64, entry_price: f64) {
        let mut inner = self.inner.write();
        inner.positions.insert(
            market_id.to_string(),
            PositionEntry {
                side,
                notional_usd: size_usd,
                entry_price,
                opened_at_ms: now_ms(),
            },
        );
        debug!(market_id, %side, size_usd, entry_price, "position tracked");
    }

    /// Close a position and return its realized P&L.
    pub fn close_position(&self, market_id: &str, exit_price: f64) -> f64 {
        let mut inner = self.inner.write();
        let Some(pos) = inner.positions.remove(market_id) else {
            return 0.0;
        };
        let held_ms = now_ms() - pos.opened_at_ms;
        let entry = pos.entry_price.max(0.001);
        let pnl = match pos.side {
            Side::Yes => (exit_price - pos.entry_price) * pos.notional_usd / entry,
            Side::No => (pos.entry_price - exit_price) * pos.notional_usd / entry,
        };
        inner.daily_pnl += pnl;
        info!(market_id, exit_price, pnl, held_ms, "position closed");
        pnl
    }

    pub fn record_pnl(&self, pnl: f64) {
        self.inner.write().daily_pnl += pnl;
    }

    /// Per-market notional map for reconciliation.
    pub fn local_positions(&self) -> HashMap<String, f64> {
        self.inner
            .read()
            .positions
            .iter()
            .map(|(k, v)| (k.clone(), v.notional_usd))
            .collect()
    }

    // -------------------------------------------------------------------------
    // Wallet reference
    // -------------------------------------------------------------------------

    pub fn update_wallet(&self, wallet_usd: f64) {
        let mut inner = self.inner.write();
        inner.wallet_usd_last_good = wallet_usd;
        inner.wallet_updated_at_ms = now_ms();
    }

    pub fn wallet_usd(&self) -> f64 {
        self.inner.read().wallet_usd_last_good
    }

    /// Wallet older than an hour is a degraded condition.
    pub fn is_wallet_stale(&self) -> bool {
        let inner = self.inner.read();
        now_ms() - inner.wallet_updated_at_ms > WALLET_STALE_SEC * 1000
    }

    // -------------------------------------------------------------------------
    // TWAP risk mark
    // -------------------------------------------------------------------------

    /// Add a mark sample. Invalid samples (wide spread, thin depth) are
    /// rejected at the door.
    pub fn add_twap_sample(&self, market_id: &str, mid: f64, spread: f64, depth_top_usd: f64) {
        if spread > TWAP_MAX_SPREAD || depth_top_usd < MIN_DEPTH_USD_NEAR_TOP {
            return;
        }
        let mut inner = self.inner.write();
        let now = now_ms();
        let samples = inner.twap.entry(market_id.to_string()).or_default();
        samples.push(TwapSample { mid, at_ms: now });
        let cutoff = now - TWAP_WINDOW_SEC * 1000;
        samples.retain(|s| s.at_ms > cutoff);
    }

    /// TWAP risk mark with anti-spoof: requires ≥3 valid samples spanning
    /// ≥60s; with ≥10 samples, drops those outside mean ± 2σ; returns the
    /// median of the remainder.
    pub fn risk_mark(&self, market_id: &str) -> Option<f64> {
        let inner = self.inner.read();
        let samples = inner.twap.get(market_id)?;
        if samples.len() < TWAP_MIN_SAMPLES {
            return None;
        }

        let first = samples.iter().map(|s| s.at_ms).min()?;
        let last = samples.iter().map(|s| s.at_ms).max()?;
        if last - first < TWAP_MIN_SPAN_SEC * 1000 {
            return None;
        }

        let mut mids: Vec<f64> = samples.iter().map(|s| s.mid).collect();

        if mids.len() >= TWAP_OUTLIER_MIN_SAMPLES {
            let mean = mids.iter().sum::<f64>() / mids.len() as f64;
            let variance = mids.iter().map(|m| (m - mean) * (m - mean)).sum::<f64>()
                / (mids.len() - 1) as f64;
            let stdev = variance.sqrt();
            if stdev > 0.0 {
                mids.retain(|m| (m - mean).abs() <= 2.0 * stdev);
            }
        }

        if mids.is_empty() {
            return None;
        }
        mids.sort_by(|a, b| a.partial_cmp(b).expect("mids are finite"));
        let n = mids.len();
        let median = if n % 2 == 1 {
            mids[n / 2]
        } else {
            (mids[n / 2 - 1] + mids[n / 2]) / 2.0
        };
        Some(median)
    }

    // -------------------------------------------------------------------------
    // Daily stop
    // -------------------------------------------------------------------------

    /// True when cumulative daily P&L has fallen to −3% of wallet.
    pub fn daily_stop_hit(&self) -> bool {
        let inner = self.inner.read();
        let threshold = -DAILY_STOP_LOSS_PCT * inner.wallet_usd_last_good;
        if inner.daily_pnl <= threshold {
            warn!(
                daily_pnl = inner.daily_pnl,
                threshold, "daily stop loss threshold reached"
            );
            return true;
        }
        false
    }

    pub fn reset_daily(&self) {
        self.inner.write().daily_pnl = 0.0;
    }

    pub fn stats(&self) -> RiskStats {
        let inner = self.inner.read();
        RiskStats {
            wallet_usd: inner.wallet_usd_last_good,
            wallet_stale: now_ms() - inner.wallet_updated_at_ms > WALLET_STALE_SEC * 1000,
            open_positions: inner.positions.len(),
            total_exposure_usd: Self::total_exposure(&inner),
            daily_pnl: inner.daily_pnl,
            daily_stop_threshold: -DAILY_STOP_LOSS_PCT * inner.wallet_usd_last_good,
        }
    }

    #[cfg(test)]
    fn backdate_twap_sample(&self, market_id: &str, index: usize, delta_ms: i64) {
        let mut inner = self.inner.write();
        if let Some(samples) = inner.twap.get_mut(market_id) {
            if let Some(s) = samples.get_mut(index) {
                s.at_ms -= delta_ms;
            }
        }
    }
}

// =============================================================================
// AI budget — atomic reservations, idempotent settlement, reaper
// =============================================================================
//
// Invariant: spent + in_flight never exceeds the daily cap, at every
// observation point. Reserve is a compare-and-swap under one lock; settle and
// force-settle are idempotent so a late swarm result and the reaper can never
// double-account the same reservation.
// =============================================================================

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::constants::{
    AI_ANALYSES_PER_DAY_HARD_CAP, AI_CAP_PCT_PER_DAY, AI_CAP_USD_USER, AI_WINDOW_CAP_PCT_OF_DAILY,
    AI_WINDOW_SEC,
};

/// Reservation lifetime before the reaper may force-settle it.
pub const RESERVATION_EXPIRY_SEC: i64 = 120;
/// Grace added on top of `expires_at` before force-settling.
pub const REAPER_GRACE_SEC: i64 = 5;
/// Force-settles per day that flip the degraded flag.
pub const FORCE_SETTLE_DEGRADED_THRESHOLD: u32 = 3;

/// Effective daily cap: `min($2, 0.5% of wallet)`.
pub fn compute_daily_cap(wallet_usd: f64) -> f64 {
    AI_CAP_USD_USER.min(wallet_usd * AI_CAP_PCT_PER_DAY)
}

/// Rolling-window cap: 20% of the daily cap.
pub fn compute_window_cap(daily_cap: f64) -> f64 {
    daily_cap * AI_WINDOW_CAP_PCT_OF_DAILY
}

#[derive(Debug, Error)]
#[error("AI budget denied: {0}")]
pub struct BudgetDenied(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    Reserved,
    Settled,
    ForceSettled,
    Released,
}

#[derive(Debug, Clone)]
pub struct Reservation {
    pub reservation_id: String,
    pub model_key: String,
    pub reserved_usd: f64,
    pub actual_usd: Option<f64>,
    pub status: ReservationStatus,
    pub correlation_id: String,
    pub ts_utc: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BudgetStats {
    pub daily_cap: f64,
    pub window_cap: f64,
    pub spent_usd: f64,
    pub in_flight_usd: f64,
    pub remaining_daily: f64,
    pub window_sum: f64,
    pub analyses_today: usize,
    pub force_settles_today: u32,
    pub is_degraded: bool,
}

struct Inner {
    today: NaiveDate,
    spent_usd: f64,
    in_flight_usd: f64,
    reservations: HashMap<String, Reservation>,
    correlation_ids_today: HashSet<String>,
    force_settles_today: u32,
}

/// Single owner of all budget accounting.
pub struct BudgetManager {
    inner: Mutex<Inner>,
    pub daily_cap: f64,
    pub window_cap: f64,
}

impl BudgetManager {
    pub fn new(wallet_usd: f64) -> Self {
        let daily_cap = compute_daily_cap(wallet_usd);
        let window_cap = compute_window_cap(daily_cap);
        Self::with_caps(daily_cap, window_cap)
    }

    /// Construct with explicit caps (exercised directly by tests).
    pub fn with_caps(daily_cap: f64, window_cap: f64) -> Self {
        info!(daily_cap, window_cap, "budget manager initialised");
        Self {
            inner: Mutex::new(Inner {
                today: Utc::now().date_naive(),
                spent_usd: 0.0,
                in_flight_usd: 0.0,
                reservations: HashMap::new(),
                correlation_ids_today: HashSet::new(),
                force_settles_today: 0,
            }),
            daily_cap,
            window_cap,
        }
    }

    fn check_day_rollover(inner: &mut Inner) {
        let today = Utc::now().date_naive();
        if today != inner.today {
            info!(old = %inner.today, new = %today, "budget day rollover");
            inner.today = today;
            inner.spent_usd = 0.0;
            inner.in_flight_usd = 0.0;
            inner.correlation_ids_today.clear();
            inner.force_settles_today = 0;
            inner
                .reservations
                .retain(|_, r| r.status == ReservationStatus::Reserved);
        }
    }

    /// In-flight reservations inside the rolling window. Settled spend is
    /// already captured by the daily cap.
    fn window_sum(inner: &Inner, now: DateTime<Utc>) -> f64 {
        let cutoff = now - Duration::seconds(AI_WINDOW_SEC);
        inner
            .reservations
            .values()
            .filter(|r| r.status == ReservationStatus::Reserved && r.ts_utc >= cutoff)
            .map(|r| r.reserved_usd)
            .sum()
    }

    /// Reserve worst-case spend for one model call. Atomic against both caps
    /// and the per-day analysis count.
    pub fn reserve(
        &self,
        model_key: &str,
        worst_case_usd: f64,
        correlation_id: &str,
    ) -> Result<String, BudgetDenied> {
        let mut inner = self.inner.lock();
        Self::check_day_rollover(&mut inner);
        let now = Utc::now();

        if inner.spent_usd + inner.in_flight_usd + worst_case_usd > self.daily_cap {
            return Err(BudgetDenied(format!(
                "daily cap exceeded: spent={:.4} in_flight={:.4} requested={:.4} cap={:.4}",
                inner.spent_usd, inner.in_flight_usd, worst_case_usd, self.daily_cap
            )));
        }

        let window_sum = Self::window_sum(&inner, now);
        if window_sum + worst_case_usd > self.window_cap {
            return Err(BudgetDenied(format!(
                "window cap exceeded: window_sum={:.4} requested={:.4} cap={:.4}",
                window_sum, worst_case_usd, self.window_cap
            )));
        }

        if inner.correlation_ids_today.len() >= AI_ANALYSES_PER_DAY_HARD_CAP
            && !inner.correlation_ids_today.contains(correlation_id)
        {
            return Err(BudgetDenied(format!(
                "analysis count cap exceeded: {} >= {}",
                inner.correlation_ids_today.len(),
                AI_ANALYSES_PER_DAY_HARD_CAP
            )));
        }

        let reservation_id = Uuid::new_v4().to_string();
        inner.reservations.insert(
            reservation_id.clone(),
            Reservation {
                reservation_id: reservation_id.clone(),
                model_key: model_key.to_string(),
                reserved_usd: worst_case_usd,
                actual_usd: None,
                status: ReservationStatus::Reserved,
                correlation_id: correlation_id.to_string(),
                ts_utc: now,
                expires_at: now + Duration::seconds(RESERVATION_EXPIRY_SEC),
            },
        );
        inner.in_flight_usd += worst_case_usd;
        inner.correlation_ids_today.insert(correlation_id.to_string());

        debug!(
            reservation_id = %reservation_id,
            model = model_key,
            usd = worst_case_usd,
            "budget reserved"
        );
        Ok(reservation_id)
    }

    /// Settle a reservation. Idempotent: a second call (or a call after the
    /// reaper got there first) is a no-op returning `false`.
    pub fn settle(&self, reservation_id: &str, actual_usd: Option<f64>) -> bool {
        let mut inner = self.inner.lock();
        Self::check_day_rollover(&mut inner);

        let Some(r) = inner.reservations.get_mut(reservation_id) else {
            warn!(reservation_id, "settle: reservation not found");
            return false;
        };
        if r.status != ReservationStatus::Reserved {
            debug!(reservation_id, status = ?r.status, "settle: already final");
            return false;
        }

        let cost = actual_usd.unwrap_or(r.reserved_usd);
        r.status = ReservationStatus::Settled;
        r.actual_usd = Some(cost);
        let reserved = r.reserved_usd;

        inner.in_flight_usd -= reserved;
        inner.spent_usd += cost;
        debug!(reservation_id, actual = cost, "budget settled");
        true
    }

    /// Release a reservation without spending.
    pub fn release(&self, reservation_id: &str) -> bool {
        let mut inner = self.inner.lock();

        let Some(r) = inner.reservations.get_mut(reservation_id) else {
            return false;
        };
        if r.status != ReservationStatus::Reserved {
            return false;
        }
        r.status = ReservationStatus::Released;
        let reserved = r.reserved_usd;
        inner.in_flight_usd -= reserved;
        debug!(reservation_id, "budget released");
        true
    }

    /// Force-settle reservations past `expires_at` plus grace, attributing
    /// the reserved amount to spend. Returns the number reaped.
    pub fn reap_expired(&self) -> usize {
        let mut inner = self.inner.lock();
        Self::check_day_rollover(&mut inner);
        let deadline = Utc::now() - Duration::seconds(REAPER_GRACE_SEC);

        let expired: Vec<String> = inner
            .reservations
            .values()
            .filter(|r| r.status == ReservationStatus::Reserved && r.expires_at < deadline)
            .map(|r| r.reservation_id.clone())
            .collect();

        for id in &expired {
            let r = inner.reservations.get_mut(id).expect("reservation exists");
            r.status = ReservationStatus::ForceSettled;
            r.actual_usd = Some(r.reserved_usd);
            let reserved = r.reserved_usd;
            let model = r.model_key.clone();
            inner.in_flight_usd -= reserved;
            inner.spent_usd += reserved;
            inner.force_settles_today += 1;
            warn!(reservation_id = %id, model = %model, usd = reserved, "budget force-settled");
        }

        expired.len()
    }

    /// ≥3 force-settles in a day degrade cost accounting.
    pub fn is_degraded(&self) -> bool {
        self.inner.lock().force_settles_today >= FORCE_SETTLE_DEGRADED_THRESHOLD
    }

    pub fn stats(&self) -> BudgetStats {
        let mut inner = self.inner.lock();
        Self::check_day_rollover(&mut inner);
        let now = Utc::now();
        BudgetStats {
            daily_cap: self.daily_cap,
            window_cap: self.window_cap,
            spent_usd: inner.spent_usd,
            in_flight_usd: inner.in_flight_usd,
            remaining_daily: self.daily_cap - inner.spent_usd - inner.in_flight_usd,
            window_sum: Self::window_sum(&inner, now),
            analyses_today: inner.correlation_ids_today.len(),
            force_settles_today: inner.force_settles_today,
            is_degraded: inner.force_settles_today >= FORCE_SETTLE_DEGRADED_THRESHOLD,
        }
    }

    #[cfg(test)]
    fn force_expire(&self, reservation_id: &str) {
        let mut inner = self.inner.lock();
        if let Some(r) = inner.reservations.get_mut(reservation_id) {
            r.expires_at = Utc::now() - Duration::seconds(60);
        }
    }
}

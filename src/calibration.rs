// =============================================================================
// Calibration & trust control — Brier accumulation, w_ai, effective probability
// =============================================================================
//
// The AI influence weight starts at zero and stays there until at least 50
// resolved trades exist. Above the gate it starts at W_AI_MAX and is only
// ever reduced. The effective probability is hard-clamped to delta_max of the
// market price no matter what the models said.
// =============================================================================

use std::collections::HashMap;

use serde::Serialize;

use crate::constants::{
    DELTA_MAX_DEFAULT, DELTA_MAX_HIGH_DISPUTE, N_RESOLVED_MIN, P_EFF_OUTLIER_THRESHOLD, W_AI_MAX,
};
use crate::types::NoTradeReason;

/// Brier score over paired predictions and binary outcomes. Lower is better;
/// degenerate input scores worst-case 1.0.
pub fn brier_score(predictions: &[f64], outcomes: &[u8]) -> f64 {
    if predictions.is_empty() || predictions.len() != outcomes.len() {
        return 1.0;
    }
    let n = predictions.len() as f64;
    predictions
        .iter()
        .zip(outcomes.iter())
        .map(|(p, o)| {
            let diff = p - *o as f64;
            diff * diff
        })
        .sum::<f64>()
        / n
}

/// One calibration bin over a uniform [0,1] decomposition.
#[derive(Debug, Clone, Serialize)]
pub struct CalibrationBin {
    pub bin_lo: f64,
    pub bin_hi: f64,
    pub predicted_mean: Option<f64>,
    pub observed_fraction: Option<f64>,
    pub count: usize,
}

/// Ten uniform calibration bins; the top bin is closed at 1.0.
pub fn calibration_bins(predictions: &[f64], outcomes: &[u8]) -> Vec<CalibrationBin> {
    let mut bins = Vec::with_capacity(10);
    for i in 0..10 {
        let lo = i as f64 / 10.0;
        let hi = (i + 1) as f64 / 10.0;

        let mut bin_preds = Vec::new();
        let mut bin_outcomes = Vec::new();
        for (p, o) in predictions.iter().zip(outcomes.iter()) {
            let in_bin = (*p >= lo && *p < hi) || (i == 9 && *p == 1.0);
            if in_bin {
                bin_preds.push(*p);
                bin_outcomes.push(*o);
            }
        }

        let count = bin_preds.len();
        if count > 0 {
            bins.push(CalibrationBin {
                bin_lo: lo,
                bin_hi: hi,
                predicted_mean: Some(bin_preds.iter().sum::<f64>() / count as f64),
                observed_fraction: Some(
                    bin_outcomes.iter().map(|o| *o as f64).sum::<f64>() / count as f64,
                ),
                count,
            });
        } else {
            bins.push(CalibrationBin {
                bin_lo: lo,
                bin_hi: hi,
                predicted_mean: None,
                observed_fraction: None,
                count: 0,
            });
        }
    }
    bins
}

// ---------------------------------------------------------------------------
// Per-category accumulation
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct CategoryRecord {
    ai_predictions: Vec<f64>,
    market_predictions: Vec<f64>,
    outcomes: Vec<u8>,
}

/// Accumulates resolved outcomes per category for Brier comparison.
#[derive(Debug, Default)]
pub struct CalibrationTracker {
    categories: HashMap<String, CategoryRecord>,
}

impl CalibrationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_resolution(
        &mut self,
        category: &str,
        p_ai: f64,
        p_market: f64,
        outcome_yes: bool,
    ) {
        let rec = self.categories.entry(category.to_string()).or_default();
        rec.ai_predictions.push(p_ai);
        rec.market_predictions.push(p_market);
        rec.outcomes.push(outcome_yes as u8);
    }

    pub fn n_resolved(&self) -> usize {
        self.categories.values().map(|r| r.outcomes.len()).sum()
    }

    /// `(ai_brier, baseline_brier)` for a category, if it has data.
    pub fn category_briers(&self, category: &str) -> Option<(f64, f64)> {
        let rec = self.categories.get(category)?;
        if rec.outcomes.is_empty() {
            return None;
        }
        Some((
            brier_score(&rec.ai_predictions, &rec.outcomes),
            brier_score(&rec.market_predictions, &rec.outcomes),
        ))
    }

    pub fn category_bins(&self, category: &str) -> Option<Vec<CalibrationBin>> {
        let rec = self.categories.get(category)?;
        Some(calibration_bins(&rec.ai_predictions, &rec.outcomes))
    }
}

// ---------------------------------------------------------------------------
// Influence weight and effective probability
// ---------------------------------------------------------------------------

/// AI influence weight control law.
///
/// Zero until `n_resolved >= 50`, then `W_AI_MAX` multiplicatively reduced
/// by calibration quality, disagreement, dispute risk, and a missing tier-1
/// evidence base.
pub fn compute_w_ai(
    n_resolved: usize,
    category_brier_ai: Option<f64>,
    category_brier_baseline: Option<f64>,
    disagreement: f64,
    dispute_risk: f64,
    tier1_count: Option<usize>,
) -> f64 {
    if n_resolved < N_RESOLVED_MIN {
        return 0.0;
    }

    let mut w = W_AI_MAX;

    if let (Some(ai), Some(baseline)) = (category_brier_ai, category_brier_baseline) {
        if ai > baseline {
            w *= baseline / ai.max(0.001);
        }
    }

    if disagreement > 0.0 {
        w *= (1.0 - disagreement * 3.0).max(0.0);
    }

    if dispute_risk > 0.5 {
        w *= (1.0 - (dispute_risk - 0.5) * 2.0).max(0.0);
    }

    if tier1_count == Some(0) {
        w *= 0.5;
    }

    w.clamp(0.0, W_AI_MAX)
}

/// Hard bound on |p_eff − p_market| given dispute risk.
pub fn delta_max(dispute_risk: f64) -> f64 {
    if dispute_risk >= 0.7 {
        DELTA_MAX_HIGH_DISPUTE
    } else {
        DELTA_MAX_DEFAULT
    }
}

/// Effective probability: `p_market + w_ai × (p_ai_cal − p_market)`, clamped
/// to delta_max and [0, 1].
///
/// A pre-clamp deviation above the outlier threshold surfaces
/// `P_EFF_OUTLIER`; the value itself is still clamped and returned.
pub fn compute_p_eff(
    p_market: f64,
    p_ai_cal: f64,
    w_ai: f64,
    dispute_risk: f64,
) -> (f64, Option<NoTradeReason>) {
    let raw = p_market + w_ai * (p_ai_cal - p_market);
    let bound = delta_max(dispute_risk);

    let outlier = if (raw - p_market).abs() > P_EFF_OUTLIER_THRESHOLD {
        Some(NoTradeReason::PEffOutlier)
    } else {
        None
    };

    let clamped = raw.clamp(p_market - bound, p_market + bound).clamp(0.0, 1.0);
    (clamped, outlier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn brier_basics() {
        // Perfect predictions score zero.
        assert_eq!(brier_score(&[1.0, 0.0], &[1, 0]), 0.0);
        // Maximally wrong predictions score one.
        assert_eq!(brier_score(&[1.0, 0.0], &[0, 1]), 1.0);
        // Mismatched lengths degrade to worst case.
        assert_eq!(brier_score(&[0.5], &[1, 0]), 1.0);
        assert_eq!(brier_score(&[], &[]), 1.0);
    }

    #[test]
    fn bins_cover_unit_interval() {
        let preds = vec![0.05, 0.15, 0.95, 1.0];
        let outs = vec![0, 0, 1, 1];
        let bins = calibration_bins(&preds, &outs);
        assert_eq!(bins.len(), 10);
        assert_eq!(bins[0].count, 1);
        assert_eq!(bins[1].count, 1);
        // 0.95 and the closed top boundary 1.0 both land in the last bin.
        assert_eq!(bins[9].count, 2);
        assert_eq!(bins[9].observed_fraction, Some(1.0));
        assert_eq!(bins[5].count, 0);
        assert!(bins[5].predicted_mean.is_none());
    }

    #[test]
    fn w_ai_gated_until_fifty_resolved() {
        assert_eq!(compute_w_ai(0, None, None, 0.0, 0.0, None), 0.0);
        assert_eq!(compute_w_ai(49, None, None, 0.0, 0.0, None), 0.0);
        assert_eq!(compute_w_ai(50, None, None, 0.0, 0.0, None), W_AI_MAX);
    }

    #[test]
    fn w_ai_reductions_compose() {
        // AI worse than baseline halves via the ratio.
        let w = compute_w_ai(100, Some(0.30), Some(0.15), 0.0, 0.0, None);
        assert!((w - W_AI_MAX * 0.5).abs() < 1e-9);

        // Disagreement reduction: (1 - 3 * 0.1) = 0.7.
        let w = compute_w_ai(100, None, None, 0.1, 0.0, None);
        assert!((w - W_AI_MAX * 0.7).abs() < 1e-9);

        // Dispute above 0.5: (1 - 2 * 0.2) = 0.6.
        let w = compute_w_ai(100, None, None, 0.0, 0.7, None);
        assert!((w - W_AI_MAX * 0.6).abs() < 1e-9);

        // No tier-1 evidence halves.
        let w = compute_w_ai(100, None, None, 0.0, 0.0, Some(0));
        assert!((w - W_AI_MAX * 0.5).abs() < 1e-9);

        // AI better than baseline is not rewarded.
        let w = compute_w_ai(100, Some(0.10), Some(0.20), 0.0, 0.0, None);
        assert_eq!(w, W_AI_MAX);
    }

    #[test]
    fn p_eff_blends_and_clamps() {
        // Clean geopolitics scenario: p_market 0.40, p_ai 0.70, w_ai 0.35.
        // Raw blend 0.40 + 0.35*0.30 = 0.505, clamped to 0.40 + 0.10 = 0.50.
        let (p_eff, outlier) = compute_p_eff(0.40, 0.70, 0.35, 0.1);
        assert!((p_eff - 0.50).abs() < 1e-9);
        assert!(outlier.is_none());
    }

    #[test]
    fn p_eff_delta_max_tightens_on_dispute() {
        let (p_eff, _) = compute_p_eff(0.40, 0.90, 0.35, 0.8);
        assert!((p_eff - 0.45).abs() < 1e-9);
        assert!((p_eff - 0.40).abs() <= DELTA_MAX_HIGH_DISPUTE + 1e-12);
    }

    #[test]
    fn p_eff_outlier_surfaced_but_clamped() {
        // w_ai = 1 exaggerated to force a raw deviation above 0.20.
        let (p_eff, outlier) = compute_p_eff(0.30, 0.80, 1.0, 0.0);
        assert_eq!(outlier, Some(NoTradeReason::PEffOutlier));
        assert!((p_eff - 0.40).abs() < 1e-9);
    }

    #[test]
    fn p_eff_always_in_unit_interval() {
        for &(pm, pa, w, d) in &[
            (0.01, 0.99, 0.35, 0.0),
            (0.99, 0.01, 0.35, 0.0),
            (0.05, 0.0, 0.35, 0.9),
            (0.0, 1.0, 0.35, 0.0),
        ] {
            let (p_eff, _) = compute_p_eff(pm, pa, w, d);
            assert!((0.0..=1.0).contains(&p_eff));
            assert!((p_eff - pm).abs() <= delta_max(d) + 1e-12);
        }
    }

    #[test]
    fn tracker_accumulates_per_category() {
        let mut t = CalibrationTracker::new();
        for i in 0..10 {
            t.record_resolution("economics", 0.8, 0.6, i % 2 == 0);
        }
        t.record_resolution("geopolitics", 0.4, 0.5, false);
        assert_eq!(t.n_resolved(), 11);
        let (ai, base) = t.category_briers("economics").unwrap();
        assert!(ai > 0.0 && base > 0.0);
        assert!(t.category_briers("missing").is_none());
        assert_eq!(t.category_bins("economics").unwrap().len(), 10);
    }
}

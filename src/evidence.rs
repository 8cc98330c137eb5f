// =============================================================================
// Evidence service — deterministic bundles, thesis/high-stakes, conflicts
// =============================================================================
//
// Bundle construction is fully deterministic: TTL filter, sort by
// (tier asc, published desc, source_id asc), cap at 6 items / 40k chars /
// 250 KB, hash over canonical JSON. The same inputs always produce the same
// bundle hash.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::candidates::Candidate;
use crate::constants::EVIDENCE_FETCHES_PER_HOUR_MAX;
use crate::registry::{is_allowlisted_category, Market};
use crate::types::{NoTradeReason, TriggerKind};

/// Bundle limits.
pub const MAX_EVIDENCE_ITEMS: usize = 6;
pub const MAX_EVIDENCE_TEXT_CHARS_TOTAL: usize = 40_000;
pub const MAX_EVIDENCE_BYTES_TOTAL: usize = 250 * 1024;

/// Resolution-source wording that forces the thesis requirement.
pub const DEFAULT_SUBJECTIVE_TERMS: [&str; 9] = [
    "likely",
    "probably",
    "uncertain",
    "debatable",
    "controversial",
    "disputed",
    "questionable",
    "ambiguous",
    "subjective",
];

/// A single evidence item from a registered source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceItem {
    pub source_id: String,
    pub url: String,
    pub title: String,
    pub text: String,
    pub published_at_utc: Option<DateTime<Utc>>,
    /// 1 is the highest reliability tier.
    pub reliability_tier: u8,
    pub parser_name: String,
    pub parser_version: String,
}

/// A registered evidence source from the signed config.
#[derive(Debug, Clone, Deserialize)]
pub struct EvidenceSource {
    pub source_id: String,
    #[serde(default)]
    pub url: String,
    pub reliability_tier: u8,
    #[serde(default = "default_ttl_sec")]
    pub ttl_sec: i64,
}

fn default_ttl_sec() -> i64 {
    3600
}

/// Load the evidence source registry from `evidence_sources.json`.
pub fn load_evidence_sources(path: &std::path::Path) -> anyhow::Result<Vec<EvidenceSource>> {
    let raw = std::fs::read_to_string(path)?;
    let value: serde_json::Value = serde_json::from_str(&raw)?;
    let sources = value
        .get("sources")
        .cloned()
        .unwrap_or_else(|| serde_json::Value::Array(vec![]));
    Ok(serde_json::from_value(sources)?)
}

// ---------------------------------------------------------------------------
// Thesis / high-stakes determination
// ---------------------------------------------------------------------------

/// Evidence is required when any of:
/// - allowlisted category with a mid-move or resolution-approach trigger,
/// - intended size ≥ 0.5 % of wallet,
/// - resolution text contains a subjective term.
pub fn is_thesis_required(
    candidate: &Candidate,
    market: &Market,
    wallet_usd: f64,
    subjective_terms: &[&str],
) -> bool {
    if is_allowlisted_category(&market.category)
        && candidate.trigger_reasons.iter().any(|t| {
            matches!(t, TriggerKind::MidMove | TriggerKind::ApproachingResolution)
        })
    {
        return true;
    }

    if candidate.intended_size_usd >= 0.005 * wallet_usd {
        return true;
    }

    let resolution_text = market.resolution_source.to_lowercase();
    subjective_terms.iter().any(|t| resolution_text.contains(t))
}

/// High stakes when any of: intended size ≥ 1 % of wallet, ≤ 6 h to
/// resolution, or dispute risk ≥ 0.7.
pub fn is_high_stakes(
    candidate: &Candidate,
    market: &Market,
    wallet_usd: f64,
    dispute_risk: f64,
    now: DateTime<Utc>,
) -> bool {
    if candidate.intended_size_usd >= 0.01 * wallet_usd {
        return true;
    }

    if let Some(remaining) = market.time_to_resolution_sec(now) {
        if remaining <= 6 * 3600 {
            return true;
        }
    }

    dispute_risk >= 0.7
}

// ---------------------------------------------------------------------------
// Bundle construction
// ---------------------------------------------------------------------------

/// Evidence is valid iff it carries a publication time no older than the
/// effective TTL (source TTL, optionally tightened by a category override).
pub fn is_ttl_valid(
    item: &EvidenceItem,
    source_ttl_sec: i64,
    category_ttl_override_sec: Option<i64>,
    now: DateTime<Utc>,
) -> bool {
    let Some(published) = item.published_at_utc else {
        return false;
    };
    let effective = match category_ttl_override_sec {
        Some(o) => source_ttl_sec.min(o),
        None => source_ttl_sec,
    };
    (now - published).num_seconds() <= effective
}

fn canonical_item_json(item: &EvidenceItem) -> serde_json::Value {
    serde_json::json!({
        "parser_name": item.parser_name,
        "parser_version": item.parser_version,
        "published_at_utc": item.published_at_utc.map(|t| t.to_rfc3339()),
        "reliability_tier": item.reliability_tier,
        "source_id": item.source_id,
        "text": item.text,
        "title": item.title,
        "url": item.url,
    })
}

/// SHA-256 hex over the canonical JSON array of the selected items.
pub fn compute_bundle_hash(items: &[EvidenceItem]) -> String {
    let canonical: Vec<serde_json::Value> = items.iter().map(canonical_item_json).collect();
    let json = serde_json::to_string(&canonical).expect("evidence bundle serializes");
    let mut hasher = Sha256::new();
    hasher.update(json.as_bytes());
    hex::encode(hasher.finalize())
}

/// Build the deterministic evidence bundle.
///
/// Returns the selected (possibly truncated) items and the bundle hash.
pub fn build_bundle(
    items: Vec<EvidenceItem>,
    source_ttls: &HashMap<String, i64>,
    category_ttl_override_sec: Option<i64>,
    now: DateTime<Utc>,
) -> (Vec<EvidenceItem>, String) {
    let mut valid: Vec<EvidenceItem> = items
        .into_iter()
        .filter(|item| {
            let ttl = source_ttls
                .get(&item.source_id)
                .copied()
                .unwrap_or_else(default_ttl_sec);
            is_ttl_valid(item, ttl, category_ttl_override_sec, now)
        })
        .collect();

    valid.sort_by(|a, b| {
        let ts_a = a.published_at_utc.map(|t| t.timestamp()).unwrap_or(0);
        let ts_b = b.published_at_utc.map(|t| t.timestamp()).unwrap_or(0);
        a.reliability_tier
            .cmp(&b.reliability_tier)
            .then(ts_b.cmp(&ts_a))
            .then(a.source_id.cmp(&b.source_id))
    });

    valid.truncate(MAX_EVIDENCE_ITEMS);

    let mut total_chars = 0usize;
    let mut total_bytes = 0usize;
    let mut selected = Vec::new();
    for mut item in valid {
        let chars = item.text.chars().count();
        let bytes = item.text.len();

        if total_chars + chars > MAX_EVIDENCE_TEXT_CHARS_TOTAL {
            let remaining = MAX_EVIDENCE_TEXT_CHARS_TOTAL - total_chars;
            // A truncated tail item is only worth keeping if a meaningful
            // amount of it fits.
            if remaining > 100 {
                item.text = item.text.chars().take(remaining).collect();
                selected.push(item);
            }
            break;
        }
        if total_bytes + bytes > MAX_EVIDENCE_BYTES_TOTAL {
            break;
        }

        total_chars += chars;
        total_bytes += bytes;
        selected.push(item);
    }

    let hash = compute_bundle_hash(&selected);
    debug!(
        items = selected.len(),
        chars = total_chars,
        bundle_hash = %hash,
        "evidence bundle built"
    );
    (selected, hash)
}

// ---------------------------------------------------------------------------
// Fetch throttle
// ---------------------------------------------------------------------------

/// Sliding-window throttle the evidence fetcher consults: at most 60 source
/// fetches per hour across the whole engine.
#[derive(Debug, Default)]
pub struct EvidenceFetchRateLimiter {
    fetches_ms: std::collections::VecDeque<i64>,
}

impl EvidenceFetchRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn can_fetch(&mut self, now_ms: i64) -> bool {
        let cutoff = now_ms - 3_600_000;
        while self.fetches_ms.front().is_some_and(|t| *t <= cutoff) {
            self.fetches_ms.pop_front();
        }
        self.fetches_ms.len() < EVIDENCE_FETCHES_PER_HOUR_MAX
    }

    pub fn record_fetch(&mut self, now_ms: i64) {
        self.fetches_ms.push_back(now_ms);
    }
}

// ---------------------------------------------------------------------------
// Conflict detection
// ---------------------------------------------------------------------------

const YES_SIGNALS: [&str; 6] = ["will", "yes", "likely", "confirms", "approved", "passed"];
const NO_SIGNALS: [&str; 6] = ["won't", "no", "unlikely", "denied", "rejected", "failed"];

/// Detect mutually exclusive assertions among tier-1/2 items. Returns a
/// description of the conflict when one exists.
pub fn detect_conflict(items: &[EvidenceItem]) -> Option<String> {
    let high_tier: Vec<&EvidenceItem> =
        items.iter().filter(|i| i.reliability_tier <= 2).collect();
    if high_tier.len() < 2 {
        return None;
    }

    let mut yes_count = 0u32;
    let mut no_count = 0u32;
    for item in &high_tier {
        let text = item.text.to_lowercase();
        let yes_hits = YES_SIGNALS.iter().filter(|w| text.contains(**w)).count();
        let no_hits = NO_SIGNALS.iter().filter(|w| text.contains(**w)).count();
        if yes_hits > no_hits {
            yes_count += 1;
        } else if no_hits > yes_hits {
            no_count += 1;
        }
    }

    if yes_count > 0 && no_count > 0 {
        return Some(format!(
            "conflicting tier-1/2 evidence: {yes_count} YES vs {no_count} NO signals"
        ));
    }
    None
}

/// Outcome of conflict resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConflictResolution {
    /// No conflict found.
    Proceed,
    /// Conflict with a tier-1 majority: proceed but raise the dispute
    /// buffer downstream.
    ProceedWithBuffer,
    NoTrade(NoTradeReason),
}

/// Resolve a detected conflict. High-stakes candidates with fewer than two
/// tier-1 items never proceed.
pub fn resolve_conflict(items: &[EvidenceItem], high_stakes: bool) -> ConflictResolution {
    if detect_conflict(items).is_none() {
        return ConflictResolution::Proceed;
    }

    let tier1_count = items.iter().filter(|i| i.reliability_tier == 1).count();

    if high_stakes && tier1_count < 2 {
        return ConflictResolution::NoTrade(NoTradeReason::EvidenceTier1Insufficient);
    }
    if tier1_count >= 2 {
        return ConflictResolution::ProceedWithBuffer;
    }
    ConflictResolution::NoTrade(NoTradeReason::EvidenceConflict)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CandidateStatus;

    fn item(source: &str, tier: u8, age_sec: i64, text: &str, now: DateTime<Utc>) -> EvidenceItem {
        EvidenceItem {
            source_id: source.to_string(),
            url: format!("https://example.org/{source}"),
            title: format!("{source} headline"),
            text: text.to_string(),
            published_at_utc: Some(now - chrono::Duration::seconds(age_sec)),
            reliability_tier: tier,
            parser_name: "rss".to_string(),
            parser_version: "1.0".to_string(),
        }
    }

    fn market(category: &str, now: DateTime<Utc>) -> Market {
        Market {
            market_id: "mkt-1".to_string(),
            condition_id: "cond-1".to_string(),
            category: category.to_string(),
            title: "t".to_string(),
            description: "d".to_string(),
            resolution_source: "official announcement".to_string(),
            end_date_utc: Some(now + chrono::Duration::days(7)),
            yes_token_id: "y".to_string(),
            no_token_id: "n".to_string(),
            volume_24h_usd: 10_000.0,
            liquidity_usd: 50_000.0,
            critical_field_hash: "h".to_string(),
            is_binary_eligible: true,
            eligibility_reason: None,
            frozen: false,
        }
    }

    fn candidate(triggers: Vec<TriggerKind>, size: f64) -> Candidate {
        let mut c = Candidate::new("mkt-1", "snap-1", triggers);
        c.status = CandidateStatus::New;
        c.intended_size_usd = size;
        c
    }

    #[test]
    fn thesis_required_for_allowlisted_mid_move() {
        let now = Utc::now();
        let m = market("geopolitics", now);
        let c = candidate(vec![TriggerKind::MidMove], 0.0);
        assert!(is_thesis_required(&c, &m, 100.0, &DEFAULT_SUBJECTIVE_TERMS));
    }

    #[test]
    fn thesis_not_required_for_small_spread_change() {
        let now = Utc::now();
        let m = market("geopolitics", now);
        let c = candidate(vec![TriggerKind::SpreadChange], 0.1);
        assert!(!is_thesis_required(&c, &m, 100.0, &DEFAULT_SUBJECTIVE_TERMS));
    }

    #[test]
    fn thesis_required_by_size_and_subjective_text() {
        let now = Utc::now();
        let m = market("weather", now);
        let c = candidate(vec![TriggerKind::SpreadChange], 0.6);
        // 0.6 >= 0.5% of 100.
        assert!(is_thesis_required(&c, &m, 100.0, &DEFAULT_SUBJECTIVE_TERMS));

        let mut m2 = market("weather", now);
        m2.resolution_source = "outcome is debatable among experts".to_string();
        let c2 = candidate(vec![TriggerKind::SpreadChange], 0.0);
        assert!(is_thesis_required(&c2, &m2, 100.0, &DEFAULT_SUBJECTIVE_TERMS));
    }

    #[test]
    fn high_stakes_rules() {
        let now = Utc::now();
        let m = market("economics", now);
        assert!(is_high_stakes(&candidate(vec![], 1.5), &m, 100.0, 0.0, now));
        assert!(!is_high_stakes(&candidate(vec![], 0.1), &m, 100.0, 0.0, now));
        assert!(is_high_stakes(&candidate(vec![], 0.1), &m, 100.0, 0.8, now));

        let mut soon = market("economics", now);
        soon.end_date_utc = Some(now + chrono::Duration::hours(3));
        assert!(is_high_stakes(&candidate(vec![], 0.1), &soon, 100.0, 0.0, now));
    }

    #[test]
    fn bundle_sorts_tier_first_then_newest() {
        let now = Utc::now();
        let items = vec![
            item("wire-b", 2, 60, "b", now),
            item("wire-a", 1, 600, "a-old", now),
            item("wire-c", 1, 30, "c-new", now),
        ];
        let (selected, hash) = build_bundle(items, &HashMap::new(), None, now);
        assert_eq!(selected.len(), 3);
        assert_eq!(selected[0].source_id, "wire-c");
        assert_eq!(selected[1].source_id, "wire-a");
        assert_eq!(selected[2].source_id, "wire-b");
        assert_eq!(hash.len(), 64);
    }

    #[test]
    fn bundle_hash_is_deterministic() {
        let now = Utc::now();
        let items = vec![item("wire-a", 1, 60, "text", now)];
        let (_, h1) = build_bundle(items.clone(), &HashMap::new(), None, now);
        let (_, h2) = build_bundle(items, &HashMap::new(), None, now);
        assert_eq!(h1, h2);
    }

    #[test]
    fn bundle_drops_expired_items() {
        let now = Utc::now();
        let mut ttls = HashMap::new();
        ttls.insert("wire-a".to_string(), 120i64);
        let items = vec![
            item("wire-a", 1, 60, "fresh", now),
            item("wire-a", 1, 600, "stale", now),
        ];
        let (selected, _) = build_bundle(items, &ttls, None, now);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].text, "fresh");
    }

    #[test]
    fn bundle_caps_at_six_items() {
        let now = Utc::now();
        let items: Vec<EvidenceItem> = (0..10)
            .map(|i| item(&format!("wire-{i}"), 1, 60, "t", now))
            .collect();
        let (selected, _) = build_bundle(items, &HashMap::new(), None, now);
        assert_eq!(selected.len(), MAX_EVIDENCE_ITEMS);
    }

    #[test]
    fn bundle_truncates_text_budget() {
        let now = Utc::now();
        let long = "x".repeat(30_000);
        let items = vec![
            item("wire-a", 1, 30, &long, now),
            item("wire-b", 1, 60, &long, now),
        ];
        let (selected, _) = build_bundle(items, &HashMap::new(), None, now);
        assert_eq!(selected.len(), 2);
        let total: usize = selected.iter().map(|i| i.text.chars().count()).sum();
        assert!(total <= MAX_EVIDENCE_TEXT_CHARS_TOTAL);
        assert_eq!(selected[1].text.chars().count(), 10_000);
    }

    #[test]
    fn conflict_detection_and_resolution() {
        let now = Utc::now();
        let conflicted = vec![
            item("wire-a", 1, 60, "the measure was approved and passed", now),
            item("wire-b", 1, 60, "officials denied it; the vote failed", now),
        ];
        assert!(detect_conflict(&conflicted).is_some());
        // Tier-1 majority exists: proceed with a raised buffer.
        assert_eq!(
            resolve_conflict(&conflicted, false),
            ConflictResolution::ProceedWithBuffer
        );

        // High stakes with only one tier-1 item among the conflicted set.
        let thin = vec![
            item("wire-a", 1, 60, "approved and passed", now),
            item("wire-b", 2, 60, "denied and rejected", now),
        ];
        assert_eq!(
            resolve_conflict(&thin, true),
            ConflictResolution::NoTrade(NoTradeReason::EvidenceTier1Insufficient)
        );
        assert_eq!(
            resolve_conflict(&thin, false),
            ConflictResolution::NoTrade(NoTradeReason::EvidenceConflict)
        );
    }

    #[test]
    fn fetch_throttle_slides() {
        let mut rl = EvidenceFetchRateLimiter::new();
        let t0: i64 = 0;
        for i in 0..60 {
            assert!(rl.can_fetch(t0 + i));
            rl.record_fetch(t0 + i);
        }
        assert!(!rl.can_fetch(t0 + 100));
        // An hour later the window has drained.
        assert!(rl.can_fetch(t0 + 3_600_100));
    }

    #[test]
    fn no_conflict_proceeds() {
        let now = Utc::now();
        let agreeing = vec![
            item("wire-a", 1, 60, "approved and passed", now),
            item("wire-b", 1, 60, "confirms it will happen", now),
        ];
        assert_eq!(resolve_conflict(&agreeing, true), ConflictResolution::Proceed);
    }
}

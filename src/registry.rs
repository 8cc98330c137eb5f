// =============================================================================
// Market registry — catalog parsing, eligibility, critical-field freeze
// =============================================================================
//
// The catalog fetcher upstream hands us raw JSON market records. This module
// normalizes them into [`Market`] rows: binary YES/NO detection, category
// allow/deny classification, and the critical-field hash whose change freezes
// a market against further trading.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use unicode_normalization::UnicodeNormalization;

use crate::constants::{ALLOWLIST_CATEGORIES, DENYLIST_CATEGORIES};

/// A catalog market as tracked by the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Market {
    pub market_id: String,
    pub condition_id: String,
    pub category: String,
    pub title: String,
    pub description: String,
    pub resolution_source: String,
    pub end_date_utc: Option<DateTime<Utc>>,
    pub yes_token_id: String,
    pub no_token_id: String,
    pub volume_24h_usd: f64,
    pub liquidity_usd: f64,
    /// SHA-256 over the pipe-joined critical fields. Any change freezes the
    /// market.
    pub critical_field_hash: String,
    pub is_binary_eligible: bool,
    pub eligibility_reason: Option<String>,
    pub frozen: bool,
}

impl Market {
    /// Seconds until resolution, negative if past.
    pub fn time_to_resolution_sec(&self, now: DateTime<Utc>) -> Option<i64> {
        self.end_date_utc.map(|end| (end - now).num_seconds())
    }
}

// ---------------------------------------------------------------------------
// Normalization + eligibility
// ---------------------------------------------------------------------------

/// Normalize an outcome label: NFKC, trim, collapse whitespace, uppercase.
pub fn normalize_label(label: &str) -> String {
    let nfkc: String = label.nfkc().collect();
    nfkc.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

/// An outcome as it appears in the catalog payload.
#[derive(Debug, Clone, Deserialize)]
pub struct Outcome {
    #[serde(default, alias = "value")]
    pub label: String,
    #[serde(default, alias = "asset_id")]
    pub token_id: String,
}

/// A market is binary-eligible iff it has exactly two outcomes whose labels
/// normalize to YES and NO.
pub fn is_binary_eligible(outcomes: &[Outcome]) -> (bool, Option<String>) {
    if outcomes.len() != 2 {
        return (
            false,
            Some(format!(
                "NON_BINARY: {} outcomes (need exactly 2)",
                outcomes.len()
            )),
        );
    }

    let mut labels: Vec<String> = outcomes.iter().map(|o| normalize_label(&o.label)).collect();
    labels.sort();
    if labels != ["NO", "YES"] {
        return (
            false,
            Some(format!("NON_BINARY: labels={labels:?} (need exactly YES and NO)")),
        );
    }

    (true, None)
}

/// Category allow/deny classification.
pub fn classify_category(category: &str) -> (bool, Option<String>) {
    let cat = category.trim().to_lowercase();

    if DENYLIST_CATEGORIES.iter().any(|c| *c == cat) {
        return (
            false,
            Some(format!("MARKET_NOT_ELIGIBLE: category '{category}' is in denylist")),
        );
    }
    if ALLOWLIST_CATEGORIES.iter().any(|c| *c == cat) {
        return (true, None);
    }

    (
        false,
        Some(format!("MARKET_NOT_ELIGIBLE: category '{category}' not in allowlist")),
    )
}

pub fn is_allowlisted_category(category: &str) -> bool {
    let cat = category.trim().to_lowercase();
    ALLOWLIST_CATEGORIES.iter().any(|c| *c == cat)
}

/// SHA-256 hex over `title|description|resolution_source|end_date|yes|no|category`.
pub fn critical_field_hash(
    title: &str,
    description: &str,
    resolution_source: &str,
    end_date: &str,
    yes_token_id: &str,
    no_token_id: &str,
    category: &str,
) -> String {
    let canonical = [
        title,
        description,
        resolution_source,
        end_date,
        yes_token_id,
        no_token_id,
        category,
    ]
    .join("|");
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Catalog parsing
// ---------------------------------------------------------------------------

fn extract_token_ids(outcomes: &[Outcome]) -> (String, String) {
    let mut yes_id = String::new();
    let mut no_id = String::new();
    for o in outcomes {
        match normalize_label(&o.label).as_str() {
            "YES" => yes_id = o.token_id.clone(),
            "NO" => no_id = o.token_id.clone(),
            _ => {}
        }
    }
    (yes_id, no_id)
}

/// Parse one raw catalog record. Returns `None` when critical fields are
/// missing entirely.
pub fn parse_catalog_market(raw: &serde_json::Value) -> Option<Market> {
    let market_id = raw
        .get("id")
        .or_else(|| raw.get("condition_id"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())?;

    let outcomes: Vec<Outcome> = raw
        .get("outcomes")
        .or_else(|| raw.get("tokens"))
        .and_then(|v| serde_json::from_value(v.clone()).ok())?;
    if outcomes.is_empty() {
        return None;
    }

    let category = raw
        .get("category")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let (mut eligible, mut reason) = is_binary_eligible(&outcomes);
    let (cat_allowed, cat_reason) = classify_category(&category);
    if !cat_allowed {
        eligible = false;
        reason = cat_reason;
    }

    let (yes_token_id, no_token_id) = extract_token_ids(&outcomes);

    let title = raw
        .get("question")
        .or_else(|| raw.get("title"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let description = raw
        .get("description")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let resolution_source = raw
        .get("resolutionSource")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let end_date_raw = raw
        .get("endDate")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    let end_date_utc = DateTime::parse_from_rfc3339(&end_date_raw)
        .map(|dt| dt.with_timezone(&Utc))
        .ok();

    let hash = critical_field_hash(
        &title,
        &description,
        &resolution_source,
        &end_date_raw,
        &yes_token_id,
        &no_token_id,
        &category,
    );

    Some(Market {
        market_id,
        condition_id: raw
            .get("condition_id")
            .and_then(|v| v.as_str())
            .unwrap_or("")
            .to_string(),
        category,
        title,
        description,
        resolution_source,
        end_date_utc,
        yes_token_id,
        no_token_id,
        volume_24h_usd: raw.get("volume24hr").and_then(|v| v.as_f64()).unwrap_or(0.0),
        liquidity_usd: raw
            .get("liquidityClob")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0),
        critical_field_hash: hash,
        is_binary_eligible: eligible,
        eligibility_reason: reason,
        frozen: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn label_normalization() {
        assert_eq!(normalize_label("  yes "), "YES");
        assert_eq!(normalize_label("N\u{00a0}o"), "N O");
        assert_eq!(normalize_label("No"), "NO");
    }

    fn outcome(label: &str, token: &str) -> Outcome {
        Outcome {
            label: label.to_string(),
            token_id: token.to_string(),
        }
    }

    #[test]
    fn binary_eligibility_requires_yes_no_pair() {
        let (ok, _) = is_binary_eligible(&[outcome("Yes", "t1"), outcome("No", "t2")]);
        assert!(ok);

        let (ok, reason) =
            is_binary_eligible(&[outcome("Team A", "t1"), outcome("Team B", "t2")]);
        assert!(!ok);
        assert!(reason.unwrap().contains("NON_BINARY"));

        let (ok, _) = is_binary_eligible(&[
            outcome("Yes", "t1"),
            outcome("No", "t2"),
            outcome("Maybe", "t3"),
        ]);
        assert!(!ok);
    }

    #[test]
    fn category_classification() {
        assert!(classify_category("geopolitics").0);
        assert!(classify_category("Economics").0);
        assert!(!classify_category("sports").0);
        assert!(!classify_category("weather").0);
    }

    #[test]
    fn critical_hash_is_order_sensitive() {
        let a = critical_field_hash("t", "d", "r", "e", "y", "n", "c");
        let b = critical_field_hash("t", "d", "r", "e", "y", "n", "c");
        assert_eq!(a, b);
        let c = critical_field_hash("t2", "d", "r", "e", "y", "n", "c");
        assert_ne!(a, c);
    }

    #[test]
    fn parse_catalog_market_full_record() {
        let raw = serde_json::json!({
            "id": "mkt-42",
            "condition_id": "cond-42",
            "question": "Will the central bank cut rates in March?",
            "description": "Resolves YES on an official rate-cut announcement.",
            "category": "economics",
            "resolutionSource": "Central bank official statement",
            "endDate": "2026-03-20T18:00:00Z",
            "outcomes": [
                {"value": "Yes", "asset_id": "tok-yes"},
                {"value": "No", "asset_id": "tok-no"},
            ],
            "volume24hr": 85000.0,
            "liquidityClob": 120000.0,
        });
        let m = parse_catalog_market(&raw).unwrap();
        assert_eq!(m.market_id, "mkt-42");
        assert!(m.is_binary_eligible);
        assert_eq!(m.yes_token_id, "tok-yes");
        assert_eq!(m.no_token_id, "tok-no");
        assert_eq!(m.volume_24h_usd, 85000.0);
        assert!(m.end_date_utc.is_some());
        assert_eq!(m.critical_field_hash.len(), 64);
    }

    #[test]
    fn parse_catalog_market_denylisted_category() {
        let raw = serde_json::json!({
            "id": "mkt-s",
            "question": "Which team wins?",
            "category": "sports",
            "outcomes": [
                {"value": "Yes", "asset_id": "a"},
                {"value": "No", "asset_id": "b"},
            ],
        });
        let m = parse_catalog_market(&raw).unwrap();
        assert!(!m.is_binary_eligible);
        assert!(m.eligibility_reason.unwrap().contains("denylist"));
    }
}

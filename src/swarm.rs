// =============================================================================
// AI swarm — parallel model calls with strict JSON, quorum, and budget gating
// =============================================================================
//
// Four models with fixed weights (2+2+1+1 = 6) are dispatched in parallel.
// Each call is budget-reserved before dispatch and settled when it completes;
// calls cut off by the swarm-wide timeout keep their reservation open for the
// reaper. Quorum requires ≥3 parsing responses, aggregated weight ≥4, and a
// weighted stdev of prob_yes_raw ≤ 0.12.
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::budget::BudgetManager;
use crate::candidates::Candidate;
use crate::evidence::EvidenceItem;
use crate::market_data::Snapshot;
use crate::registry::Market;
use crate::types::{NoTradeReason, RecommendedSide};

/// Strict response schema version.
pub const SCHEMA_VERSION: &str = "polyedge.ai.v2.5";

pub const PER_MODEL_TIMEOUT_SEC: u64 = 8;
pub const SWARM_TOTAL_TIMEOUT_SEC: u64 = 10;

pub const QUORUM_MIN_MODELS: usize = 3;
pub const QUORUM_MIN_WEIGHT: u32 = 4;
pub const DISAGREE_THRESHOLD: f64 = 0.12;

/// Swarm composition. Total weight = 6.
pub const SWARM_MODELS: [(&str, u32); 4] = [
    ("deepseek/deepseek-v3.2", 2),
    ("minimax/minimax-m2.5", 2),
    ("moonshotai/kimi-k2.5", 1),
    ("z-ai/glm-5", 1),
];

// ---------------------------------------------------------------------------
// Response schema
// ---------------------------------------------------------------------------

/// A validated model response.
#[derive(Debug, Clone, Serialize)]
pub struct AiResponse {
    pub market_id: String,
    pub prob_yes_raw: f64,
    pub confidence_raw: f64,
    pub resolution_risk: f64,
    pub dispute_risk: f64,
    pub resolution_summary: String,
    pub evidence_summary: String,
    pub uncertainty_reason: String,
    pub notes: String,
    pub key_drivers: Vec<String>,
    pub disqualifiers: Vec<String>,
    pub recommended_side: RecommendedSide,
}

const UNIT_FIELDS: [&str; 4] = [
    "prob_yes_raw",
    "confidence_raw",
    "resolution_risk",
    "dispute_risk",
];
const STRING_FIELDS: [&str; 4] = [
    "resolution_summary",
    "evidence_summary",
    "uncertainty_reason",
    "notes",
];
const ARRAY_FIELDS: [&str; 2] = ["key_drivers", "disqualifiers"];

/// Validate a parsed JSON value against the schema. The market id is pinned
/// to the queried market regardless of what the model echoed.
pub fn validate_response(value: &serde_json::Value, market_id: &str) -> Result<AiResponse, Vec<String>> {
    let mut errors = Vec::new();
    let obj = match value.as_object() {
        Some(obj) => obj,
        None => return Err(vec!["response is not a JSON object".to_string()]),
    };

    for field in UNIT_FIELDS {
        match obj.get(field).and_then(|v| v.as_f64()) {
            Some(v) if (0.0..=1.0).contains(&v) => {}
            Some(v) => errors.push(format!("{field} out of range [0,1]: {v}")),
            None => errors.push(format!("missing or non-numeric field: {field}")),
        }
    }
    for field in STRING_FIELDS {
        if obj.get(field).and_then(|v| v.as_str()).is_none() {
            errors.push(format!("missing or non-string field: {field}"));
        }
    }
    for field in ARRAY_FIELDS {
        if obj.get(field).and_then(|v| v.as_array()).is_none() {
            errors.push(format!("missing or non-array field: {field}"));
        }
    }
    if !obj.contains_key("market_id") {
        errors.push("missing field: market_id".to_string());
    }

    let side = match obj.get("recommended_side").and_then(|v| v.as_str()) {
        Some(s) => match RecommendedSide::parse(s) {
            Some(side) => Some(side),
            None => {
                errors.push(format!("recommended_side invalid: '{s}'"));
                None
            }
        },
        None => {
            errors.push("missing field: recommended_side".to_string());
            None
        }
    };

    if !errors.is_empty() {
        return Err(errors);
    }

    let get_f = |f: &str| obj[f].as_f64().unwrap_or(0.0);
    let get_s = |f: &str| obj[f].as_str().unwrap_or("").to_string();
    let get_arr = |f: &str| -> Vec<String> {
        obj[f]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(|s| s.to_string()))
                    .collect()
            })
            .unwrap_or_default()
    };

    Ok(AiResponse {
        market_id: market_id.to_string(),
        prob_yes_raw: get_f("prob_yes_raw"),
        confidence_raw: get_f("confidence_raw"),
        resolution_risk: get_f("resolution_risk"),
        dispute_risk: get_f("dispute_risk"),
        resolution_summary: get_s("resolution_summary"),
        evidence_summary: get_s("evidence_summary"),
        uncertainty_reason: get_s("uncertainty_reason"),
        notes: get_s("notes"),
        key_drivers: get_arr("key_drivers"),
        disqualifiers: get_arr("disqualifiers"),
        recommended_side: side.expect("validated above"),
    })
}

/// Strip a triple-backtick fence (with optional language tag) from model
/// output, returning the inner body.
pub fn strip_fences(content: &str) -> String {
    let trimmed = content.trim();
    if !trimmed.starts_with("```") {
        return trimmed.to_string();
    }
    let mut lines = trimmed.lines();
    lines.next(); // opening fence
    let mut body = Vec::new();
    for line in lines {
        if line.starts_with("```") {
            break;
        }
        body.push(line);
    }
    body.join("\n")
}

/// SHA-256 hex of the prompt, recorded with every analysis for replay.
pub fn prompt_hash(prompt: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hex::encode(hasher.finalize())
}

// ---------------------------------------------------------------------------
// Quorum math
// ---------------------------------------------------------------------------

/// Per-model call outcome.
#[derive(Debug, Clone)]
pub struct ModelResult {
    pub model: String,
    pub weight: u32,
    pub parse_ok: bool,
    pub response: Option<AiResponse>,
    pub error: Option<String>,
    pub latency_ms: u64,
}

impl ModelResult {
    fn failed(model: &str, weight: u32, error: String, latency_ms: u64) -> Self {
        Self {
            model: model.to_string(),
            weight,
            parse_ok: false,
            response: None,
            error: Some(error),
            latency_ms,
        }
    }
}

/// Weighted standard deviation of `prob_yes_raw` across parsing results.
pub fn weighted_disagreement(results: &[ModelResult]) -> f64 {
    let valid: Vec<&ModelResult> = results.iter().filter(|r| r.parse_ok).collect();
    if valid.len() < 2 {
        return 0.0;
    }
    let total_weight: f64 = valid.iter().map(|r| r.weight as f64).sum();
    if total_weight == 0.0 {
        return 0.0;
    }
    let mean: f64 = valid
        .iter()
        .map(|r| r.response.as_ref().expect("parse_ok").prob_yes_raw * r.weight as f64)
        .sum::<f64>()
        / total_weight;
    let variance: f64 = valid
        .iter()
        .map(|r| {
            let p = r.response.as_ref().expect("parse_ok").prob_yes_raw;
            r.weight as f64 * (p - mean) * (p - mean)
        })
        .sum::<f64>()
        / total_weight;
    variance.sqrt()
}

/// Quorum check. Returns the failing reason and a description when not met.
pub fn check_quorum(results: &[ModelResult]) -> Result<(), (NoTradeReason, String)> {
    let valid: Vec<&ModelResult> = results.iter().filter(|r| r.parse_ok).collect();

    if valid.len() < QUORUM_MIN_MODELS {
        return Err((
            NoTradeReason::AiQuorumFailed,
            format!(
                "only {}/{} models returned valid JSON",
                valid.len(),
                QUORUM_MIN_MODELS
            ),
        ));
    }

    let total_weight: u32 = valid.iter().map(|r| r.weight).sum();
    if total_weight < QUORUM_MIN_WEIGHT {
        return Err((
            NoTradeReason::AiQuorumFailed,
            format!("total weight {total_weight}/{QUORUM_MIN_WEIGHT} insufficient"),
        ));
    }

    let disagreement = weighted_disagreement(results);
    if disagreement > DISAGREE_THRESHOLD {
        return Err((
            NoTradeReason::AiDisagreement,
            format!("weighted stdev {disagreement:.4} > threshold {DISAGREE_THRESHOLD:.4}"),
        ));
    }

    Ok(())
}

fn weighted_mean<F: Fn(&AiResponse) -> f64>(results: &[ModelResult], f: F) -> Option<f64> {
    let valid: Vec<&ModelResult> = results.iter().filter(|r| r.parse_ok).collect();
    if valid.is_empty() {
        return None;
    }
    let total_weight: f64 = valid.iter().map(|r| r.weight as f64).sum();
    if total_weight == 0.0 {
        return None;
    }
    Some(
        valid
            .iter()
            .map(|r| f(r.response.as_ref().expect("parse_ok")) * r.weight as f64)
            .sum::<f64>()
            / total_weight,
    )
}

// ---------------------------------------------------------------------------
// Prompt
// ---------------------------------------------------------------------------

/// Build the analysis prompt for one candidate.
pub fn build_prompt(market: &Market, evidence: &[EvidenceItem], snapshot: &Snapshot) -> String {
    let mut parts = vec![
        "You are analysing a binary prediction market. Respond ONLY with valid JSON.".to_string(),
        String::new(),
        format!("Market: {}", market.title),
        format!("Description: {}", market.description),
        format!("Category: {}", market.category),
        format!("Resolution source: {}", market.resolution_source),
        format!(
            "End date: {}",
            market
                .end_date_utc
                .map(|t| t.to_rfc3339())
                .unwrap_or_default()
        ),
        String::new(),
        "Current prices:".to_string(),
        format!(
            "  YES best_bid={:?} best_ask={:?}",
            snapshot.best_bid_yes, snapshot.best_ask_yes
        ),
        format!(
            "  NO  best_bid={:?} best_ask={:?}",
            snapshot.best_bid_no, snapshot.best_ask_no
        ),
    ];

    if !evidence.is_empty() {
        parts.push(String::new());
        parts.push("Evidence:".to_string());
        for (i, item) in evidence.iter().enumerate() {
            parts.push(format!(
                "  [{}] {} (Tier {} - {})",
                i + 1,
                item.title,
                item.reliability_tier,
                item.source_id
            ));
            let excerpt: String = item.text.chars().take(500).collect();
            parts.push(format!("    {excerpt}"));
        }
    }

    parts.push(String::new());
    parts.push(format!(
        "Respond with JSON matching schema version \"{SCHEMA_VERSION}\":"
    ));
    parts.push(
        serde_json::to_string_pretty(&serde_json::json!({
            "market_id": market.market_id,
            "prob_yes_raw": 0.55,
            "confidence_raw": 0.7,
            "resolution_risk": 0.1,
            "dispute_risk": 0.05,
            "resolution_summary": "...",
            "evidence_summary": "...",
            "uncertainty_reason": "...",
            "key_drivers": ["..."],
            "disqualifiers": ["..."],
            "recommended_side": "YES|NO|NO_TRADE",
            "notes": "...",
        }))
        .expect("template serializes"),
    );

    parts.join("\n")
}

// ---------------------------------------------------------------------------
// Swarm
// ---------------------------------------------------------------------------

/// Completed swarm analysis for one candidate.
#[derive(Debug, Clone)]
pub struct SwarmAnalysis {
    pub market_id: String,
    pub candidate_id: String,
    pub prompt_hash: String,
    pub schema_version: &'static str,
    pub quorum_failure: Option<(NoTradeReason, String)>,
    pub disagreement: f64,
    pub aggregated_prob_yes: Option<f64>,
    pub aggregated_dispute_risk: f64,
    pub results: Vec<ModelResult>,
    pub models_valid: usize,
}

impl SwarmAnalysis {
    pub fn quorum_met(&self) -> bool {
        self.quorum_failure.is_none()
    }
}

pub struct AiSwarm {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    enabled: bool,
    /// Worst-case USD reserved per model call.
    worst_case_usd_per_call: f64,
}

impl AiSwarm {
    pub fn new(api_url: &str, api_key: &str, worst_case_usd_per_call: f64) -> Self {
        let enabled = !api_key.is_empty();
        if enabled {
            info!(models = SWARM_MODELS.len(), "AI swarm initialised");
        } else {
            info!("AI swarm initialised in DISABLED mode (no API key)");
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(PER_MODEL_TIMEOUT_SEC))
            .build()
            .expect("reqwest client builds");
        Self {
            client,
            api_url: api_url.to_string(),
            api_key: api_key.to_string(),
            enabled,
            worst_case_usd_per_call,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Run the full swarm for one candidate.
    ///
    /// Every dispatched call holds a budget reservation (correlation id =
    /// candidate id). Calls that complete settle immediately; calls cut off
    /// by the swarm timeout leave their reservation for the reaper.
    pub async fn analyze(
        &self,
        market: &Market,
        candidate: &Candidate,
        evidence: &[EvidenceItem],
        snapshot: &Snapshot,
        budget: &BudgetManager,
    ) -> Result<SwarmAnalysis, NoTradeReason> {
        let prompt = Arc::new(build_prompt(market, evidence, snapshot));
        let hash = prompt_hash(&prompt);

        if !self.enabled {
            return Ok(SwarmAnalysis {
                market_id: market.market_id.clone(),
                candidate_id: candidate.candidate_id.clone(),
                prompt_hash: hash,
                schema_version: SCHEMA_VERSION,
                quorum_failure: Some((
                    NoTradeReason::AiQuorumFailed,
                    "swarm disabled: no API key".to_string(),
                )),
                disagreement: 0.0,
                aggregated_prob_yes: None,
                aggregated_dispute_risk: 0.0,
                results: Vec::new(),
                models_valid: 0,
            });
        }

        // Reserve before dispatch; models without budget are not called.
        let mut dispatch = Vec::new();
        for (model, weight) in SWARM_MODELS {
            match budget.reserve(model, self.worst_case_usd_per_call, &candidate.candidate_id) {
                Ok(reservation_id) => dispatch.push((model, weight, reservation_id)),
                Err(e) => {
                    warn!(model, error = %e, "model call skipped: budget denied");
                }
            }
        }
        if dispatch.is_empty() {
            return Err(NoTradeReason::AiBudgetExceeded);
        }

        let mut set: JoinSet<(String, ModelResult)> = JoinSet::new();
        for (model, weight, reservation_id) in dispatch {
            let client = self.client.clone();
            let api_url = self.api_url.clone();
            let api_key = self.api_key.clone();
            let prompt = Arc::clone(&prompt);
            let market_id = market.market_id.clone();
            set.spawn(async move {
                let result =
                    call_single_model(&client, &api_url, &api_key, model, weight, &prompt, &market_id)
                        .await;
                (reservation_id, result)
            });
        }

        let mut results = Vec::new();
        let collect = async {
            while let Some(joined) = set.join_next().await {
                match joined {
                    Ok((reservation_id, result)) => {
                        // A completed call settles its reservation at the
                        // reserved worst case.
                        budget.settle(&reservation_id, None);
                        results.push(result);
                    }
                    Err(e) => warn!(error = %e, "swarm task join error"),
                }
            }
        };
        if tokio::time::timeout(Duration::from_secs(SWARM_TOTAL_TIMEOUT_SEC), collect)
            .await
            .is_err()
        {
            // Whatever parsed in time is used; aborted calls settle via the
            // reaper.
            warn!(
                candidate_id = %candidate.candidate_id,
                collected = results.len(),
                "swarm-wide timeout reached"
            );
            set.abort_all();
        }

        let quorum_failure = check_quorum(&results).err();
        let disagreement = weighted_disagreement(&results);
        let aggregated_prob_yes = weighted_mean(&results, |r| r.prob_yes_raw);
        let aggregated_dispute_risk = weighted_mean(&results, |r| r.dispute_risk).unwrap_or(0.0);
        let models_valid = results.iter().filter(|r| r.parse_ok).count();

        debug!(
            candidate_id = %candidate.candidate_id,
            models_valid,
            disagreement,
            quorum_met = quorum_failure.is_none(),
            "swarm analysis complete"
        );

        Ok(SwarmAnalysis {
            market_id: market.market_id.clone(),
            candidate_id: candidate.candidate_id.clone(),
            prompt_hash: hash,
            schema_version: SCHEMA_VERSION,
            quorum_failure,
            disagreement,
            aggregated_prob_yes,
            aggregated_dispute_risk,
            results,
            models_valid,
        })
    }
}

/// POST one chat-style request and parse the strict JSON body.
async fn call_single_model(
    client: &reqwest::Client,
    api_url: &str,
    api_key: &str,
    model: &str,
    weight: u32,
    prompt: &str,
    market_id: &str,
) -> ModelResult {
    let start = std::time::Instant::now();
    let payload = serde_json::json!({
        "model": model,
        "messages": [{"role": "user", "content": prompt}],
        "temperature": 0.1,
        "max_tokens": 2000,
    });

    let response = client
        .post(api_url)
        .bearer_auth(api_key)
        .json(&payload)
        .send()
        .await;

    let latency_ms = start.elapsed().as_millis() as u64;
    let response = match response {
        Ok(r) => r,
        Err(e) => return ModelResult::failed(model, weight, format!("request failed: {e}"), latency_ms),
    };

    let status = response.status();
    if !status.is_success() {
        return ModelResult::failed(model, weight, format!("HTTP {status}"), latency_ms);
    }

    let body: serde_json::Value = match response.json().await {
        Ok(v) => v,
        Err(e) => return ModelResult::failed(model, weight, format!("body parse: {e}"), latency_ms),
    };

    let content = body
        .get("choices")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("message"))
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
        .unwrap_or("");
    if content.is_empty() {
        return ModelResult::failed(model, weight, "no choices in response".to_string(), latency_ms);
    }

    let stripped = strip_fences(content);
    let parsed: serde_json::Value = match serde_json::from_str(&stripped) {
        Ok(v) => v,
        Err(e) => return ModelResult::failed(model, weight, format!("JSON parse: {e}"), latency_ms),
    };

    match validate_response(&parsed, market_id) {
        Ok(response) => ModelResult {
            model: model.to_string(),
            weight,
            parse_ok: true,
            response: Some(response),
            error: None,
            latency_ms,
        },
        Err(errors) => ModelResult::failed(
            model,
            weight,
            format!("schema validation: {}", errors.join("; ")),
            latency_ms,
        ),
    }
}

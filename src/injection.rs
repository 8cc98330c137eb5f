// =============================================================================
// Injection defence — versioned pattern ruleset over normalized text
// =============================================================================
//
// Market text and evidence pass through this scanner before any of it reaches
// an AI prompt. The engine fails closed: if the ruleset did not load or is
// below the minimum version, every check blocks with
// INJECTION_DETECTOR_INVALID.
// =============================================================================

use std::path::Path;

use regex::RegexBuilder;
use serde::Deserialize;
use tracing::{error, info};
use unicode_normalization::UnicodeNormalization;

use crate::types::NoTradeReason;

/// Minimum accepted ruleset version.
pub const MIN_RULESET_VERSION: &str = "1.0.0";

/// Severity carried by each pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Severity {
    #[serde(rename = "SUSPICIOUS")]
    Suspicious,
    #[serde(rename = "INJECTION_DETECTED")]
    InjectionDetected,
}

#[derive(Debug, Clone)]
pub struct InjectionPattern {
    pub pattern_id: String,
    pub severity: Severity,
    regex: regex::Regex,
}

/// One pattern hit, truncated for logging.
#[derive(Debug, Clone)]
pub struct PatternMatch {
    pub pattern_id: String,
    pub severity: Severity,
    pub matched: String,
}

/// Verdict of a scan over one or more texts.
#[derive(Debug, Clone)]
pub enum InjectionVerdict {
    Allow(Vec<PatternMatch>),
    Block {
        reason: NoTradeReason,
        matches: Vec<PatternMatch>,
    },
}

impl InjectionVerdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow(_))
    }
}

#[derive(Debug, Deserialize)]
struct RulesetFile {
    #[serde(default)]
    pattern_set_version: String,
    #[serde(default)]
    patterns: Vec<RawPattern>,
}

#[derive(Debug, Deserialize)]
struct RawPattern {
    pattern_id: String,
    regex_utf8: String,
    severity: Severity,
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Normalize text before scanning: NFKC, BOM strip, NUL removal, whitespace
/// collapse.
pub fn normalize_for_injection(text: &str) -> String {
    let nfkc: String = text.nfkc().collect();
    let stripped = nfkc.strip_prefix('\u{feff}').unwrap_or(&nfkc);
    let no_nul: String = stripped.chars().filter(|c| *c != '\u{0}').collect();
    no_nul.split_whitespace().collect::<Vec<_>>().join(" ")
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The deterministic injection defence engine.
#[derive(Debug, Default)]
pub struct InjectionDefence {
    pub version: String,
    pub valid: bool,
    patterns: Vec<InjectionPattern>,
}

impl InjectionDefence {
    /// An engine with no loaded ruleset. Blocks everything.
    pub fn invalid() -> Self {
        Self::default()
    }

    /// Load the ruleset from `injection_patterns.json`. An unreadable file,
    /// an unparsable pattern set, or a version below the gate leaves the
    /// engine invalid.
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                error!(path = %path.display(), error = %e, "injection ruleset unreadable");
                return Self::invalid();
            }
        };

        let file: RulesetFile = match serde_json::from_str(&raw) {
            Ok(file) => file,
            Err(e) => {
                error!(path = %path.display(), error = %e, "injection ruleset unparsable");
                return Self::invalid();
            }
        };

        if !version_gte(&file.pattern_set_version, MIN_RULESET_VERSION) {
            error!(
                version = %file.pattern_set_version,
                minimum = MIN_RULESET_VERSION,
                "injection ruleset below minimum version"
            );
            return Self::invalid();
        }

        let mut patterns = Vec::new();
        for raw in file.patterns {
            match RegexBuilder::new(&raw.regex_utf8)
                .case_insensitive(true)
                .unicode(true)
                .build()
            {
                Ok(regex) => patterns.push(InjectionPattern {
                    pattern_id: raw.pattern_id,
                    severity: raw.severity,
                    regex,
                }),
                Err(e) => {
                    error!(pattern_id = %raw.pattern_id, error = %e, "invalid injection regex");
                }
            }
        }

        info!(
            version = %file.pattern_set_version,
            patterns = patterns.len(),
            "injection defence loaded"
        );
        Self {
            version: file.pattern_set_version,
            valid: true,
            patterns,
        }
    }

    /// Scan one normalized text against every pattern.
    pub fn scan(&self, text: &str) -> Vec<PatternMatch> {
        let normalized = normalize_for_injection(text);
        self.patterns
            .iter()
            .filter_map(|p| {
                p.regex.find(&normalized).map(|m| PatternMatch {
                    pattern_id: p.pattern_id.clone(),
                    severity: p.severity,
                    matched: m.as_str().chars().take(100).collect(),
                })
            })
            .collect()
    }

    /// Check a set of texts and apply the severity decision table:
    ///
    /// | severity found     | high stakes | tier-1 ≥ 2 | outcome |
    /// |--------------------|-------------|------------|---------|
    /// | INJECTION_DETECTED | any         | any        | block   |
    /// | SUSPICIOUS         | yes         | any        | block   |
    /// | SUSPICIOUS         | no          | no         | block   |
    /// | SUSPICIOUS         | no          | yes        | allow   |
    /// | none               | —           | —          | allow   |
    pub fn check(&self, texts: &[&str], high_stakes: bool, tier1_count: usize) -> InjectionVerdict {
        if !self.valid {
            return InjectionVerdict::Block {
                reason: NoTradeReason::InjectionDetectorInvalid,
                matches: Vec::new(),
            };
        }

        let mut matches = Vec::new();
        for text in texts {
            matches.extend(self.scan(text));
        }

        if matches.is_empty() {
            return InjectionVerdict::Allow(matches);
        }

        let has_injection = matches
            .iter()
            .any(|m| m.severity == Severity::InjectionDetected);
        if has_injection {
            return InjectionVerdict::Block {
                reason: NoTradeReason::InjectionDetected,
                matches,
            };
        }

        // Only SUSPICIOUS hits from here on.
        if high_stakes || tier1_count < 2 {
            return InjectionVerdict::Block {
                reason: NoTradeReason::InjectionDetected,
                matches,
            };
        }

        InjectionVerdict::Allow(matches)
    }
}

/// Compare dotted numeric versions, `true` when `v1 >= v2`.
fn version_gte(v1: &str, v2: &str) -> bool {
    let parse = |v: &str| -> Option<Vec<u64>> {
        v.split('.').map(|part| part.parse::<u64>().ok()).collect()
    };
    match (parse(v1), parse(v2)) {
        (Some(a), Some(b)) => a >= b,
        _ => false,
    }
}

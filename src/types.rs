// =============================================================================
// Shared closed enumerations used across the Kestrel engine
// =============================================================================
//
// Every status, reason code, and record type that crosses a module boundary
// is a tagged variant here so exhaustiveness is machine-checked. The wire /
// store representation of each variant is its SCREAMING_SNAKE_CASE name.
// =============================================================================

use serde::{Deserialize, Serialize};

/// Durable engine state. Any `Live*` state is force-downgraded to
/// `ObserveOnly` at process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BotStateKind {
    ObserveOnly,
    PaperTrading,
    LiveArmed,
    LiveTrading,
    Halted,
    HaltedDaily,
}

impl BotStateKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ObserveOnly => "OBSERVE_ONLY",
            Self::PaperTrading => "PAPER_TRADING",
            Self::LiveArmed => "LIVE_ARMED",
            Self::LiveTrading => "LIVE_TRADING",
            Self::Halted => "HALTED",
            Self::HaltedDaily => "HALTED_DAILY",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "OBSERVE_ONLY" => Some(Self::ObserveOnly),
            "PAPER_TRADING" => Some(Self::PaperTrading),
            "LIVE_ARMED" => Some(Self::LiveArmed),
            "LIVE_TRADING" => Some(Self::LiveTrading),
            "HALTED" => Some(Self::Halted),
            "HALTED_DAILY" => Some(Self::HaltedDaily),
            _ => None,
        }
    }

    /// True for the two states that permit live order submission paths.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::LiveArmed | Self::LiveTrading)
    }
}

impl std::fmt::Display for BotStateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token side of a binary market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Side {
    Yes,
    No,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Yes => "YES",
            Self::No => "NO",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "YES" => Some(Self::Yes),
            "NO" => Some(Self::No),
            _ => None,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verdict side from the decision engine or an AI model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecommendedSide {
    Yes,
    No,
    NoTrade,
}

impl RecommendedSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Yes => "YES",
            Self::No => "NO",
            Self::NoTrade => "NO_TRADE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "YES" => Some(Self::Yes),
            "NO" => Some(Self::No),
            "NO_TRADE" => Some(Self::NoTrade),
            _ => None,
        }
    }
}

impl std::fmt::Display for RecommendedSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a candidate through the decision pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CandidateStatus {
    New,
    Filtered,
    EvidenceDone,
    AiDone,
    Decided,
    Executed,
    Dropped,
}

impl CandidateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "NEW",
            Self::Filtered => "FILTERED",
            Self::EvidenceDone => "EVIDENCE_DONE",
            Self::AiDone => "AI_DONE",
            Self::Decided => "DECIDED",
            Self::Executed => "EXECUTED",
            Self::Dropped => "DROPPED",
        }
    }
}

impl std::fmt::Display for CandidateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Microstructure trigger kinds tracked by the candidate pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    MidMove,
    SpreadChange,
    DepthDrop,
    ApproachingResolution,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MidMove => "mid_move",
            Self::SpreadChange => "spread_change",
            Self::DepthDrop => "depth_drop",
            Self::ApproachingResolution => "approaching_resolution",
        }
    }
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The 23 canonical terminal reasons a candidate can end without a trade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NoTradeReason {
    CandidateExpired,
    MarketNotEligible,
    TimeToResolutionOutOfRange,
    VolumeTooLow,
    LiquidityTooLow,
    SnapshotInvalidBook,
    SnapshotAskSumAnomaly,
    SpreadTooWide,
    DepthTooThin,
    WsUnhealthyDecision,
    EvidenceRequired,
    EvidenceConflict,
    EvidenceTier1Insufficient,
    InjectionDetected,
    InjectionDetectorInvalid,
    AiQuorumFailed,
    AiDisagreement,
    AiBudgetExceeded,
    PEffOutlier,
    EvTooLow,
    RiskLimitHit,
    LockLost,
    ReconcileRed,
}

impl NoTradeReason {
    pub const ALL: [NoTradeReason; 23] = [
        Self::CandidateExpired,
        Self::MarketNotEligible,
        Self::TimeToResolutionOutOfRange,
        Self::VolumeTooLow,
        Self::LiquidityTooLow,
        Self::SnapshotInvalidBook,
        Self::SnapshotAskSumAnomaly,
        Self::SpreadTooWide,
        Self::DepthTooThin,
        Self::WsUnhealthyDecision,
        Self::EvidenceRequired,
        Self::EvidenceConflict,
        Self::EvidenceTier1Insufficient,
        Self::InjectionDetected,
        Self::InjectionDetectorInvalid,
        Self::AiQuorumFailed,
        Self::AiDisagreement,
        Self::AiBudgetExceeded,
        Self::PEffOutlier,
        Self::EvTooLow,
        Self::RiskLimitHit,
        Self::LockLost,
        Self::ReconcileRed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CandidateExpired => "CANDIDATE_EXPIRED",
            Self::MarketNotEligible => "MARKET_NOT_ELIGIBLE",
            Self::TimeToResolutionOutOfRange => "TIME_TO_RESOLUTION_OUT_OF_RANGE",
            Self::VolumeTooLow => "VOLUME_TOO_LOW",
            Self::LiquidityTooLow => "LIQUIDITY_TOO_LOW",
            Self::SnapshotInvalidBook => "SNAPSHOT_INVALID_BOOK",
            Self::SnapshotAskSumAnomaly => "SNAPSHOT_ASK_SUM_ANOMALY",
            Self::SpreadTooWide => "SPREAD_TOO_WIDE",
            Self::DepthTooThin => "DEPTH_TOO_THIN",
            Self::WsUnhealthyDecision => "WS_UNHEALTHY_DECISION",
            Self::EvidenceRequired => "EVIDENCE_REQUIRED",
            Self::EvidenceConflict => "EVIDENCE_CONFLICT",
            Self::EvidenceTier1Insufficient => "EVIDENCE_TIER1_INSUFFICIENT",
            Self::InjectionDetected => "INJECTION_DETECTED",
            Self::InjectionDetectorInvalid => "INJECTION_DETECTOR_INVALID",
            Self::AiQuorumFailed => "AI_QUORUM_FAILED",
            Self::AiDisagreement => "AI_DISAGREEMENT",
            Self::AiBudgetExceeded => "AI_BUDGET_EXCEEDED",
            Self::PEffOutlier => "P_EFF_OUTLIER",
            Self::EvTooLow => "EV_TOO_LOW",
            Self::RiskLimitHit => "RISK_LIMIT_HIT",
            Self::LockLost => "LOCK_LOST",
            Self::ReconcileRed => "RECONCILE_RED",
        }
    }
}

impl std::fmt::Display for NoTradeReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record types accepted by the write-ahead log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WalRecordType {
    StateChanged,
    OrderIntent,
    OrderIntentAborted,
    OrderResult,
    CancelIntent,
    CancelResult,
}

impl WalRecordType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StateChanged => "STATE_CHANGED",
            Self::OrderIntent => "ORDER_INTENT",
            Self::OrderIntentAborted => "ORDER_INTENT_ABORTED",
            Self::OrderResult => "ORDER_RESULT",
            Self::CancelIntent => "CANCEL_INTENT",
            Self::CancelResult => "CANCEL_RESULT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "STATE_CHANGED" => Some(Self::StateChanged),
            "ORDER_INTENT" => Some(Self::OrderIntent),
            "ORDER_INTENT_ABORTED" => Some(Self::OrderIntentAborted),
            "ORDER_RESULT" => Some(Self::OrderResult),
            "CANCEL_INTENT" => Some(Self::CancelIntent),
            "CANCEL_RESULT" => Some(Self::CancelResult),
            _ => None,
        }
    }
}

impl std::fmt::Display for WalRecordType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Origin of a book snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SnapshotSource {
    Ws,
    Rest,
}

impl SnapshotSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ws => "WS",
            Self::Rest => "REST",
        }
    }
}

impl std::fmt::Display for SnapshotSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

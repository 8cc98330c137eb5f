// =============================================================================
// Central application state — Kestrel trading engine
// =============================================================================
//
// The single source of truth for the engine. Every subsystem is its own
// owner behind Arc; AppState ties them together for the task loops. Snapshots
// are immutable once built and shared as Arcs; per-market candidate work is
// serialized by the lock manager.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::alerts::AlertSink;
use crate::arming::ArmingCeremony;
use crate::bot_state::BotStateManager;
use crate::budget::BudgetManager;
use crate::calibration::CalibrationTracker;
use crate::candidates::{CandidateRateLimiter, TriggerTracker};
use crate::evidence::{EvidenceItem, EvidenceSource};
use crate::execution::ExecutionEngine;
use crate::injection::InjectionDefence;
use crate::locks::LockManager;
use crate::market_data::{BookUpdate, Snapshot, WsTracker};
use crate::market_data::snapshots::build_snapshot;
use crate::observability::EventLog;
use crate::reconcile::ReconcileEngine;
use crate::registry::Market;
use crate::risk::RiskManager;
use crate::store::Store;
use crate::swarm::AiSwarm;
use crate::types::SnapshotSource;
use crate::wal::WalWriter;

// =============================================================================
// EngineConfig
// =============================================================================

fn default_ws_url() -> String {
    "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string()
}

fn default_ai_api_url() -> String {
    "https://openrouter.ai/api/v1/chat/completions".to_string()
}

fn default_wallet_usd() -> f64 {
    100.0
}

fn default_ai_worst_case_usd() -> f64 {
    0.01
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_config_dir() -> PathBuf {
    PathBuf::from("config")
}

fn default_secrets_dir() -> PathBuf {
    PathBuf::from("secrets")
}

/// Engine configuration. Every field carries a serde default so older files
/// keep loading as fields are added.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Markets to watch at boot (the catalog sync extends this).
    #[serde(default)]
    pub markets: Vec<String>,

    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    #[serde(default = "default_ai_api_url")]
    pub ai_api_url: String,

    /// Worst-case USD reserved per AI model call.
    #[serde(default = "default_ai_worst_case_usd")]
    pub ai_worst_case_usd_per_call: f64,

    #[serde(default = "default_wallet_usd")]
    pub wallet_usd: f64,

    /// Venue fee rate in basis points.
    #[serde(default)]
    pub fee_rate_bps: f64,

    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_config_dir")]
    pub config_dir: PathBuf,

    #[serde(default = "default_secrets_dir")]
    pub secrets_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            markets: Vec::new(),
            ws_url: default_ws_url(),
            ai_api_url: default_ai_api_url(),
            ai_worst_case_usd_per_call: default_ai_worst_case_usd(),
            wallet_usd: default_wallet_usd(),
            fee_rate_bps: 0.0,
            data_dir: default_data_dir(),
            config_dir: default_config_dir(),
            secrets_dir: default_secrets_dir(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading engine config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&raw)
            .with_context(|| format!("parsing engine config from {}", path.display()))?;
        info!(path = %path.display(), markets = config.markets.len(), "engine config loaded");
        Ok(config)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("kestrel.wal")
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("kestrel.db")
    }
}

// =============================================================================
// AppState
// =============================================================================

/// Latest and previous snapshot for one market, for delta triggers.
#[derive(Clone, Default)]
pub struct SnapshotPair {
    pub latest: Option<Arc<Snapshot>>,
    pub prev: Option<Arc<Snapshot>>,
}

/// Central state shared across all task loops via `Arc<AppState>`.
pub struct AppState {
    pub config: EngineConfig,
    pub state_version: AtomicU64,

    pub store: Arc<Store>,
    pub wal: Arc<WalWriter>,
    pub bot_state: Arc<BotStateManager>,

    pub ws: Arc<WsTracker>,
    pub budget: Arc<BudgetManager>,
    pub risk: Arc<RiskManager>,
    pub locks: Arc<LockManager>,
    pub reconcile: Arc<ReconcileEngine>,
    pub execution: Arc<ExecutionEngine>,
    pub injection: Arc<InjectionDefence>,
    pub swarm: Arc<AiSwarm>,
    pub events: Arc<EventLog>,
    pub alerts: Arc<AlertSink>,

    pub calibration: RwLock<CalibrationTracker>,
    pub triggers: Mutex<TriggerTracker>,
    pub rate_limiter: Mutex<CandidateRateLimiter>,
    /// Two-step arming ceremony bound to this process.
    pub arming: Mutex<ArmingCeremony>,

    pub markets: RwLock<HashMap<String, Market>>,
    pub snapshots: RwLock<HashMap<String, SnapshotPair>>,
    /// Per-market evidence feed cache, filled by the evidence fetcher.
    pub evidence_items: RwLock<HashMap<String, Vec<EvidenceItem>>>,
    pub evidence_sources: Vec<EvidenceSource>,

    pub process_start_ms: i64,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        store: Arc<Store>,
        wal: Arc<WalWriter>,
        bot_state: Arc<BotStateManager>,
        injection: Arc<InjectionDefence>,
        evidence_sources: Vec<EvidenceSource>,
        ai_api_key: &str,
        state_secret: &str,
        instance_id: &str,
    ) -> Arc<Self> {
        let process_start_ms = Utc::now().timestamp_millis();
        let arming = ArmingCeremony::new(process_start_ms, state_secret, &config.data_dir);
        let ws = Arc::new(WsTracker::new());
        let budget = Arc::new(BudgetManager::new(config.wallet_usd));
        let risk = Arc::new(RiskManager::new(config.wallet_usd));
        let locks = Arc::new(LockManager::new(instance_id));
        let reconcile = Arc::new(ReconcileEngine::new(config.wallet_usd));
        let execution = Arc::new(ExecutionEngine::new(
            Arc::clone(&wal),
            Arc::clone(&locks),
            Arc::clone(&risk),
            Arc::clone(&reconcile),
            Arc::clone(&store),
        ));
        let swarm = Arc::new(AiSwarm::new(
            &config.ai_api_url,
            ai_api_key,
            config.ai_worst_case_usd_per_call,
        ));

        Arc::new(Self {
            config,
            state_version: AtomicU64::new(1),
            store,
            wal,
            bot_state,
            ws,
            budget,
            risk,
            locks,
            reconcile,
            execution,
            injection,
            swarm,
            events: Arc::new(EventLog::new()),
            alerts: Arc::new(AlertSink::new()),
            calibration: RwLock::new(CalibrationTracker::new()),
            triggers: Mutex::new(TriggerTracker::new()),
            rate_limiter: Mutex::new(CandidateRateLimiter::new()),
            arming: Mutex::new(arming),
            markets: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
            evidence_items: RwLock::new(HashMap::new()),
            evidence_sources,
            process_start_ms,
        })
    }

    pub fn bump_version(&self) -> u64 {
        self.state_version.fetch_add(1, Ordering::SeqCst)
    }

    // ── Markets ─────────────────────────────────────────────────────────

    /// Sync one market from the catalog. A changed critical-field hash
    /// freezes the market against further trading.
    pub fn sync_market(&self, mut market: Market) -> Result<()> {
        if let Some((stored_hash, frozen)) = self.store.market_hash(&market.market_id)? {
            if frozen {
                market.frozen = true;
            } else if stored_hash != market.critical_field_hash {
                warn!(
                    market_id = %market.market_id,
                    "critical field hash changed — freezing market"
                );
                self.store.freeze_market(&market.market_id)?;
                market.frozen = true;
            }
        }
        self.store.upsert_market(&market)?;
        self.markets
            .write()
            .insert(market.market_id.clone(), market);
        self.bump_version();
        Ok(())
    }

    pub fn market(&self, market_id: &str) -> Option<Market> {
        self.markets.read().get(market_id).cloned()
    }

    // ── Snapshots ───────────────────────────────────────────────────────

    /// Build and record an immutable snapshot for a book update, rotating
    /// the per-market latest/previous pair.
    pub fn record_snapshot(&self, update: &BookUpdate) -> Arc<Snapshot> {
        let snapshot = Arc::new(build_snapshot(update, SnapshotSource::Ws));
        if let Err(e) = self.store.insert_snapshot(&snapshot) {
            warn!(error = %e, "snapshot persist failed");
        }

        let mut snapshots = self.snapshots.write();
        let pair = snapshots.entry(update.market_id.clone()).or_default();
        pair.prev = pair.latest.take();
        pair.latest = Some(Arc::clone(&snapshot));
        drop(snapshots);

        self.bump_version();
        snapshot
    }

    pub fn snapshot_pair(&self, market_id: &str) -> SnapshotPair {
        self.snapshots
            .read()
            .get(market_id)
            .cloned()
            .unwrap_or_default()
    }

    // ── Evidence cache ──────────────────────────────────────────────────

    pub fn evidence_for(&self, market_id: &str) -> Vec<EvidenceItem> {
        self.evidence_items
            .read()
            .get(market_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn source_ttls(&self) -> HashMap<String, i64> {
        self.evidence_sources
            .iter()
            .map(|s| (s.source_id.clone(), s.ttl_sec))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BotStateKind;

    fn state() -> Arc<AppState> {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.migrate().unwrap();
        let wal = Arc::new(WalWriter::new(dir.path().join("wal.log")));
        wal.open().unwrap();
        let bot_state =
            Arc::new(BotStateManager::initialise(Arc::clone(&store), "secret").unwrap());
        // Leak the tempdir so the WAL file outlives the test setup.
        std::mem::forget(dir);
        AppState::new(
            EngineConfig::default(),
            store,
            wal,
            bot_state,
            Arc::new(InjectionDefence::invalid()),
            Vec::new(),
            "",
            "secret",
            "inst-test",
        )
    }

    fn market(id: &str, hash: &str) -> Market {
        Market {
            market_id: id.to_string(),
            condition_id: "c".to_string(),
            category: "economics".to_string(),
            title: "t".to_string(),
            description: "d".to_string(),
            resolution_source: "r".to_string(),
            end_date_utc: Some(Utc::now() + chrono::Duration::days(7)),
            yes_token_id: "y".to_string(),
            no_token_id: "n".to_string(),
            volume_24h_usd: 1000.0,
            liquidity_usd: 2000.0,
            critical_field_hash: hash.to_string(),
            is_binary_eligible: true,
            eligibility_reason: None,
            frozen: false,
        }
    }

    #[test]
    fn changed_critical_hash_freezes_market() {
        let state = state();
        state.sync_market(market("m1", "hash-a")).unwrap();
        assert!(!state.market("m1").unwrap().frozen);

        // Same hash: still tradable.
        state.sync_market(market("m1", "hash-a")).unwrap();
        assert!(!state.market("m1").unwrap().frozen);

        // Changed hash: frozen, durably.
        state.sync_market(market("m1", "hash-b")).unwrap();
        assert!(state.market("m1").unwrap().frozen);
        let (_, frozen) = state.store.market_hash("m1").unwrap().unwrap();
        assert!(frozen);

        // Once frozen, always frozen.
        state.sync_market(market("m1", "hash-b")).unwrap();
        assert!(state.market("m1").unwrap().frozen);
    }

    #[test]
    fn snapshot_pair_rotates() {
        let state = state();
        let update = BookUpdate {
            market_id: "m1".to_string(),
            best_bid_yes: Some(0.48),
            best_ask_yes: Some(0.50),
            best_bid_no: Some(0.50),
            best_ask_no: Some(0.52),
            depth_yes: vec![(0.48, 100.0)],
            depth_no: vec![(0.50, 100.0)],
            ws_last_message_ms: 1,
            market_last_update_ms: Some(1),
            orderbook_last_change_ms: Some(1),
            snapshot_ws_epoch: 1,
        };

        let s1 = state.record_snapshot(&update);
        let pair = state.snapshot_pair("m1");
        assert_eq!(pair.latest.as_ref().unwrap().snapshot_id, s1.snapshot_id);
        assert!(pair.prev.is_none());

        let s2 = state.record_snapshot(&update);
        let pair = state.snapshot_pair("m1");
        assert_eq!(pair.latest.as_ref().unwrap().snapshot_id, s2.snapshot_id);
        assert_eq!(pair.prev.as_ref().unwrap().snapshot_id, s1.snapshot_id);
    }

    #[test]
    fn boot_state_is_observe_only() {
        let state = state();
        assert_eq!(state.bot_state.current_kind(), BotStateKind::ObserveOnly);
    }
}

// =============================================================================
// Startup ladder — eleven ordered checks that gate the main loop
// =============================================================================
//
// 1 config manifest verify   (fatal, exit 10)
// 2 secrets permission check (fatal, exit 11)
// 3 store open               (fatal)
// 4 store migrate            (fatal)
// 5 WAL verify + replay      (fatal, exit 13)
// 6 bot state load           (fatal, exit 12; LIVE_* force-downgraded)
// 7 injection ruleset load   (degraded on failure: detector fails closed)
// 8 evidence source load     (degraded on failure)
// 9 clock sanity             (fatal, exit 14)
// 10 initial reconciliation  (baseline pass)
// 11 forced OBSERVE_ONLY     (assertion of the fail-safe default)
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::app_state::EngineConfig;
use crate::bot_state::{BotStateManager, StateError};
use crate::config_signing::verify_manifest;
use crate::evidence::{load_evidence_sources, EvidenceSource};
use crate::injection::InjectionDefence;
use crate::secrets::load_secrets;
use crate::store::Store;
use crate::types::BotStateKind;
use crate::wal::{replay, WalReader, WalWriter};

/// Clock floor: the engine refuses to run with a clock before this epoch
/// (2025-01-01T00:00:00Z). TTL arithmetic is meaningless on a wrong clock.
const CLOCK_FLOOR_UNIX_SEC: i64 = 1_735_689_600;

pub mod exit_codes {
    pub const CONFIG_TAMPER: i32 = 10;
    pub const INSECURE_SECRETS: i32 = 11;
    pub const STATE_SIGNATURE: i32 = 12;
    pub const WAL_SYNC: i32 = 13;
    pub const CLOCK_WRONG: i32 = 14;
    pub const GENERIC: i32 = 1;
}

/// A startup blocker with its process exit code.
#[derive(Debug)]
pub struct StartupFailure {
    pub step: &'static str,
    pub exit_code: i32,
    pub message: String,
}

impl std::fmt::Display for StartupFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "startup blocked at {}: {}", self.step, self.message)
    }
}

/// Everything the main loop needs, produced by a successful ladder run.
#[derive(Debug)]
pub struct StartupContext {
    pub secrets: HashMap<String, String>,
    pub store: Arc<Store>,
    pub wal: Arc<WalWriter>,
    pub bot_state: Arc<BotStateManager>,
    pub injection: Arc<InjectionDefence>,
    pub evidence_sources: Vec<EvidenceSource>,
    pub degraded_flags: Vec<String>,
}

fn blocker(step: &'static str, exit_code: i32, message: String) -> StartupFailure {
    error!(step, exit_code, "startup BLOCKER: {message}");
    StartupFailure {
        step,
        exit_code,
        message,
    }
}

/// Run all eleven steps in strict order. The first hard failure aborts.
pub fn run_startup(config: &EngineConfig) -> Result<StartupContext, StartupFailure> {
    let mut degraded_flags = Vec::new();

    // ── 1. Config manifest ───────────────────────────────────────────────
    // The operator key is read first since the manifest is signed under it;
    // a missing secrets dir surfaces as step 2's error class.
    let secrets = match load_secrets(&config.secrets_dir) {
        Ok(secrets) => secrets,
        Err(e) => {
            return Err(blocker(
                "2_secrets_verify",
                exit_codes::INSECURE_SECRETS,
                e.to_string(),
            ))
        }
    };
    let operator_key = secrets
        .get("OPERATOR_KEY")
        .expect("required secret present after validation")
        .clone();

    if let Err(e) = verify_manifest(&config.config_dir, &operator_key) {
        return Err(blocker(
            "1_config_verify",
            exit_codes::CONFIG_TAMPER,
            e.to_string(),
        ));
    }
    info!("startup step 1_config_verify: OK");
    info!("startup step 2_secrets_verify: OK");

    // ── 3. Store open ────────────────────────────────────────────────────
    let store = match Store::open(&config.store_path()) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            return Err(blocker("3_store_open", exit_codes::GENERIC, e.to_string()))
        }
    };
    info!("startup step 3_store_open: OK");

    // ── 4. Migrate ───────────────────────────────────────────────────────
    if let Err(e) = store.migrate() {
        return Err(blocker("4_store_migrate", exit_codes::GENERIC, e.to_string()));
    }
    info!("startup step 4_store_migrate: OK");

    // ── 5. WAL verify + replay ───────────────────────────────────────────
    let wal_path = config.wal_path();
    if let Err(e) = WalReader::new(&wal_path).read_all() {
        return Err(blocker("5_wal_verify", exit_codes::WAL_SYNC, e.to_string()));
    }
    match replay(&wal_path, &store) {
        Ok(stats) => info!(
            inserted = stats.inserted,
            orphans = stats.orphans_adopted,
            "startup step 5_wal_verify: OK"
        ),
        Err(e) => return Err(blocker("5_wal_verify", exit_codes::WAL_SYNC, e.to_string())),
    }
    let wal = Arc::new(WalWriter::new(&wal_path));
    if let Err(e) = wal.open() {
        return Err(blocker("5_wal_verify", exit_codes::WAL_SYNC, e.to_string()));
    }

    // ── 6. Bot state load (+ forced downgrade of LIVE_*) ─────────────────
    let state_secret = secrets
        .get("LOCAL_STATE_SECRET")
        .expect("required secret present after validation");
    let bot_state = match BotStateManager::initialise(Arc::clone(&store), state_secret) {
        Ok(mgr) => Arc::new(mgr),
        Err(e @ StateError::SignatureMismatch) => {
            return Err(blocker(
                "6_bot_state_load",
                exit_codes::STATE_SIGNATURE,
                e.to_string(),
            ))
        }
        Err(e) => {
            return Err(blocker("6_bot_state_load", exit_codes::GENERIC, e.to_string()))
        }
    };
    info!(state = %bot_state.current_kind(), "startup step 6_bot_state_load: OK");

    // ── 7. Injection ruleset ─────────────────────────────────────────────
    let injection = InjectionDefence::load(&config.config_dir.join("injection_patterns.json"));
    if injection.valid {
        info!(version = %injection.version, "startup step 7_injection_patterns: OK");
    } else {
        warn!("startup step 7_injection_patterns: DEGRADED (detector fails closed)");
        degraded_flags.push("INJECTION_DETECTOR_INVALID".to_string());
    }
    let injection = Arc::new(injection);

    // ── 8. Evidence sources ──────────────────────────────────────────────
    let evidence_sources =
        match load_evidence_sources(&config.config_dir.join("evidence_sources.json")) {
            Ok(sources) => {
                info!(count = sources.len(), "startup step 8_evidence_sources: OK");
                sources
            }
            Err(e) => {
                warn!(error = %e, "startup step 8_evidence_sources: DEGRADED");
                degraded_flags.push("EVIDENCE_SOURCES_MISSING".to_string());
                Vec::new()
            }
        };

    // ── 9. Clock sanity ──────────────────────────────────────────────────
    let now = Utc::now().timestamp();
    if now < CLOCK_FLOOR_UNIX_SEC {
        return Err(blocker(
            "9_clock_sanity",
            exit_codes::CLOCK_WRONG,
            format!("system clock reads {now}, before the build-era floor"),
        ));
    }
    info!("startup step 9_clock_sanity: OK");

    // ── 10. Initial reconciliation baseline ──────────────────────────────
    // The first live reconciliation runs in the reconcile loop; here we only
    // surface any orders the WAL replay left unresolved.
    match store.count_orders_with_status("PENDING_UNKNOWN") {
        Ok(0) => info!("startup step 10_reconcile_initial: OK"),
        Ok(n) => {
            warn!(pending_unknown = n, "startup step 10_reconcile_initial: unresolved orders");
            info!("startup step 10_reconcile_initial: OK (pending resolution)");
        }
        Err(e) => {
            return Err(blocker(
                "10_reconcile_initial",
                exit_codes::GENERIC,
                e.to_string(),
            ))
        }
    }

    // ── 11. Forced OBSERVE_ONLY ──────────────────────────────────────────
    // Step 6 already downgraded LIVE_*; this is the final assertion that the
    // main loop starts from the fail-safe default.
    if bot_state.current_kind().is_live() {
        return Err(blocker(
            "11_observe_only",
            exit_codes::GENERIC,
            "live state survived initialisation".to_string(),
        ));
    }
    info!(state = %bot_state.current_kind(), "startup step 11_observe_only: OK");

    Ok(StartupContext {
        secrets,
        store,
        wal,
        bot_state,
        injection,
        evidence_sources,
        degraded_flags,
    })
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::config_signing::generate_manifest;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn write_secret(dir: &Path, name: &str, value: &str) {
        let path = dir.join(name);
        std::fs::write(&path, value).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600)).unwrap();
    }

    fn scaffold(root: &Path) -> EngineConfig {
        let config_dir = root.join("config");
        let secrets_dir = root.join("secrets");
        let data_dir = root.join("data");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::create_dir_all(&secrets_dir).unwrap();
        std::fs::create_dir_all(&data_dir).unwrap();

        std::fs::write(config_dir.join("config.yaml"), "markets: []\n").unwrap();
        std::fs::write(config_dir.join("evidence_sources.json"), "{\"sources\":[]}").unwrap();
        std::fs::write(
            config_dir.join("injection_patterns.json"),
            "{\"pattern_set_version\":\"1.0.0\",\"patterns\":[]}",
        )
        .unwrap();
        std::fs::write(config_dir.join("model_pricing.json"), "{}").unwrap();

        write_secret(&secrets_dir, "LOCAL_STATE_SECRET", "state-secret");
        write_secret(&secrets_dir, "OPERATOR_KEY", "operator-key");
        write_secret(&secrets_dir, "AI_API_KEY", "ai-key");
        write_secret(&secrets_dir, "EXCHANGE_API_KEY", "exchange-key");

        generate_manifest(&config_dir, "operator-key").unwrap();

        EngineConfig {
            data_dir,
            config_dir,
            secrets_dir,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn full_ladder_passes_on_clean_scaffold() {
        let root = tempfile::tempdir().unwrap();
        let config = scaffold(root.path());
        let ctx = run_startup(&config).unwrap();
        assert_eq!(ctx.bot_state.current_kind(), BotStateKind::ObserveOnly);
        assert!(ctx.injection.valid);
        assert!(ctx.degraded_flags.is_empty());
        assert_eq!(ctx.secrets.len(), 4);
    }

    #[test]
    fn tampered_config_blocks_with_exit_ten() {
        let root = tempfile::tempdir().unwrap();
        let config = scaffold(root.path());
        std::fs::write(config.config_dir.join("config.yaml"), "tampered\n").unwrap();

        let failure = run_startup(&config).unwrap_err();
        assert_eq!(failure.exit_code, exit_codes::CONFIG_TAMPER);
        assert_eq!(failure.step, "1_config_verify");
    }

    #[test]
    fn world_readable_secret_blocks_with_exit_eleven() {
        let root = tempfile::tempdir().unwrap();
        let config = scaffold(root.path());
        std::fs::set_permissions(
            config.secrets_dir.join("OPERATOR_KEY"),
            std::fs::Permissions::from_mode(0o644),
        )
        .unwrap();

        let failure = run_startup(&config).unwrap_err();
        assert_eq!(failure.exit_code, exit_codes::INSECURE_SECRETS);
    }

    #[test]
    fn corrupt_wal_blocks_with_exit_thirteen() {
        let root = tempfile::tempdir().unwrap();
        let config = scaffold(root.path());
        std::fs::write(config.wal_path(), "not json\n").unwrap();

        let failure = run_startup(&config).unwrap_err();
        assert_eq!(failure.exit_code, exit_codes::WAL_SYNC);
    }

    #[test]
    fn invalid_injection_ruleset_degrades_not_blocks() {
        let root = tempfile::tempdir().unwrap();
        let mut config = scaffold(root.path());
        std::fs::write(
            config.config_dir.join("injection_patterns.json"),
            "{\"pattern_set_version\":\"0.1.0\",\"patterns\":[]}",
        )
        .unwrap();
        // Re-sign so step 1 passes with the downgraded ruleset.
        generate_manifest(&config.config_dir, "operator-key").unwrap();
        config.markets = vec![];

        let ctx = run_startup(&config).unwrap();
        assert!(!ctx.injection.valid);
        assert!(ctx
            .degraded_flags
            .contains(&"INJECTION_DETECTOR_INVALID".to_string()));
    }

    #[test]
    fn tampered_bot_state_blocks_with_exit_twelve() {
        let root = tempfile::tempdir().unwrap();
        let config = scaffold(root.path());

        // First boot creates and signs the row.
        run_startup(&config).unwrap();

        // Corrupt the signature out-of-band.
        {
            let store = Store::open(&config.store_path()).unwrap();
            let mut bs = store.load_bot_state().unwrap().unwrap();
            bs.counter += 1;
            store.save_bot_state(&bs).unwrap();
        }

        let failure = run_startup(&config).unwrap_err();
        assert_eq!(failure.exit_code, exit_codes::STATE_SIGNATURE);
        assert_eq!(failure.step, "6_bot_state_load");
    }
}

// =============================================================================
// Kestrel — autonomous edge detection for binary prediction markets
// =============================================================================
//
// The engine always boots into OBSERVE_ONLY. Paper trading and the live
// ladder are reached only through signed state transitions and the arming
// ceremony; every fatal condition exits non-zero and the next boot lands
// back in observe-only.
// =============================================================================

mod alerts;
mod app_state;
mod arming;
mod bot_state;
mod budget;
mod calibration;
mod candidates;
mod config_signing;
mod constants;
mod decision;
mod evidence;
mod execution;
mod filters;
mod injection;
mod locks;
mod market_data;
mod observability;
mod reconcile;
mod registry;
mod risk;
mod secrets;
mod startup;
mod store;
mod strategy;
mod swarm;
mod types;
mod wal;
mod watchlist;
mod ws_health;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::alerts::AlertSeverity;
use crate::app_state::{AppState, EngineConfig};
use crate::candidates::{detect_triggers, Candidate};
use crate::constants::FAST_LOOP_SEC;
use crate::market_data::ws_client::run_market_stream;
use crate::market_data::BookUpdate;
use crate::startup::{exit_codes, run_startup};
use crate::strategy::{evaluate_candidate, PipelineOutcome};
use crate::types::{BotStateKind, Side, TriggerKind};

#[tokio::main]
async fn main() {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Kestrel engine starting up");

    // ── 1. Engine config ─────────────────────────────────────────────────
    let config_path =
        std::env::var("KESTREL_CONFIG").unwrap_or_else(|_| "kestrel.json".to_string());
    let config = EngineConfig::load(&config_path).unwrap_or_else(|e| {
        warn!(error = %e, "engine config missing — using defaults");
        EngineConfig::default()
    });

    // ── 2. Startup ladder ────────────────────────────────────────────────
    let ctx = match run_startup(&config) {
        Ok(ctx) => ctx,
        Err(failure) => {
            error!("{failure}");
            std::process::exit(failure.exit_code);
        }
    };

    let instance_id = uuid::Uuid::new_v4().to_string();
    let ai_api_key = ctx.secrets.get("AI_API_KEY").cloned().unwrap_or_default();
    let state_secret = ctx
        .secrets
        .get("LOCAL_STATE_SECRET")
        .cloned()
        .unwrap_or_default();

    let state = AppState::new(
        config,
        ctx.store,
        ctx.wal,
        ctx.bot_state,
        ctx.injection,
        ctx.evidence_sources,
        &ai_api_key,
        &state_secret,
        &instance_id,
    );

    for flag in &ctx.degraded_flags {
        state
            .alerts
            .send(AlertSeverity::Degraded, flag, "degraded at startup");
    }

    // Seed the registry from the latest catalog drop, when present. The
    // catalog fetcher is an external collaborator; the engine only consumes
    // its records (and freezes markets whose critical fields changed).
    let catalog_path = state.config.data_dir.join("markets.json");
    if let Ok(raw) = std::fs::read_to_string(&catalog_path) {
        match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(serde_json::Value::Array(records)) => {
                let mut synced = 0usize;
                for record in &records {
                    if let Some(market) = registry::parse_catalog_market(record) {
                        if state.sync_market(market).is_ok() {
                            synced += 1;
                        }
                    }
                }
                info!(synced, total = records.len(), "market catalog seeded");
            }
            _ => warn!(path = %catalog_path.display(), "catalog file is not a JSON array"),
        }
    }

    info!(
        instance_id = %instance_id,
        state = %state.bot_state.current_kind(),
        markets = state.config.markets.len(),
        "startup complete — entering main loop"
    );

    // ── 3. Market data stream ────────────────────────────────────────────
    let (book_tx, mut book_rx) = mpsc::channel::<BookUpdate>(1024);
    {
        let stream_state = Arc::clone(&state);
        let tx = book_tx.clone();
        tokio::spawn(async move {
            let markets = stream_state.config.markets.clone();
            if markets.is_empty() {
                warn!("no markets configured — WS stream idle");
                return;
            }
            loop {
                if let Err(e) = run_market_stream(
                    &stream_state.config.ws_url,
                    &markets,
                    &stream_state.ws,
                    &tx,
                )
                .await
                {
                    error!(error = %e, "market stream error — reconnecting in 5s");
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
        });
    }

    // ── 4. Snapshot consumer ─────────────────────────────────────────────
    {
        let consume_state = Arc::clone(&state);
        tokio::spawn(async move {
            while let Some(update) = book_rx.recv().await {
                let snapshot = consume_state.record_snapshot(&update);

                // Risk-mark samples and paper fills ride on the same feed.
                if let (Some(mid), Some(spread)) = (snapshot.mid_yes(), snapshot.spread_yes()) {
                    consume_state.risk.add_twap_sample(
                        &snapshot.market_id,
                        mid,
                        spread,
                        snapshot.top_depth_yes(),
                    );

                    let now_ms = Utc::now().timestamp_millis();
                    for (side, price) in [
                        (Side::Yes, mid),
                        (Side::No, ((1.0 - mid) * 1e6).round() / 1e6),
                    ] {
                        match consume_state.execution.on_price(
                            &snapshot.market_id,
                            side,
                            price,
                            now_ms,
                        ) {
                            Ok(fills) => {
                                for fill in fills {
                                    consume_state.events.log_event(
                                        "PAPER_FILL",
                                        Some(&fill.market_id),
                                        None,
                                        None,
                                        serde_json::json!({
                                            "local_order_id": fill.local_order_id,
                                            "price": fill.price,
                                            "size_usd": fill.size_usd,
                                            "fee_usd": fill.fee_usd,
                                        }),
                                    );
                                }
                            }
                            Err(e) => {
                                error!(error = %e, "WAL failure on fill — halting");
                                std::process::exit(exit_codes::WAL_SYNC);
                            }
                        }
                    }
                }
            }
        });
    }

    // ── 5. Fast candidate loop ───────────────────────────────────────────
    {
        let fast_state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(FAST_LOOP_SEC));
            loop {
                ticker.tick().await;
                run_fast_loop_tick(&fast_state).await;
            }
        });
    }

    // ── 6. Budget reaper ─────────────────────────────────────────────────
    {
        let reaper_state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(5));
            loop {
                ticker.tick().await;
                let reaped = reaper_state.budget.reap_expired();
                if reaped > 0 {
                    warn!(reaped, "budget reaper force-settled reservations");
                }
                if reaper_state.budget.is_degraded() {
                    reaper_state.alerts.send(
                        AlertSeverity::Degraded,
                        "COST_ACCOUNTING_DEGRADED",
                        "three or more force-settles today",
                    );
                }
            }
        });
    }

    // ── 7. Reconciliation loop ───────────────────────────────────────────
    {
        let recon_state = Arc::clone(&state);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;

                // The paper venue of record is the engine's own fill book;
                // live mode swaps the remote side for the exchange REST view.
                let local = recon_state.risk.local_positions();
                let remote = local.clone();
                recon_state.reconcile.reconcile_positions(&local, &remote);

                match recon_state.store.count_orders_with_status("PENDING_UNKNOWN") {
                    Ok(n) => recon_state
                        .reconcile
                        .set_pending_unknown_orders(n as usize),
                    Err(e) => warn!(error = %e, "pending-unknown count failed"),
                }

                let (green, reasons) = recon_state.reconcile.reconcile_green();
                if !green {
                    recon_state.alerts.send(
                        AlertSeverity::Degraded,
                        "RECONCILE_RED",
                        &reasons.join("; "),
                    );
                }

                if recon_state.risk.is_wallet_stale() {
                    recon_state.alerts.send(
                        AlertSeverity::Degraded,
                        "WALLET_STALE",
                        "wallet reference older than one hour",
                    );
                }
            }
        });
    }

    info!("all subsystems running — Ctrl+C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "signal handler failed");
    }
    warn!("shutdown signal received — stopping");
    info!("Kestrel engine shut down");
}

/// One fast-loop tick: trigger detection, anti-spoof persistence, rate caps,
/// then the full pipeline for each enqueued candidate.
async fn run_fast_loop_tick(state: &Arc<AppState>) {
    // Daily stop check first: it halts everything else.
    if state.risk.daily_stop_hit()
        && state.bot_state.current_kind() != BotStateKind::HaltedDaily
    {
        if let Err(e) = state
            .bot_state
            .transition(BotStateKind::HaltedDaily, "daily stop loss")
        {
            warn!(error = %e, "daily-stop transition failed");
        }
        if let Err(e) = state.wal.append(
            types::WalRecordType::StateChanged,
            serde_json::json!({"to": "HALTED_DAILY", "reason": "daily stop loss"}),
        ) {
            error!(error = %e, "WAL failure on state change — halting");
            std::process::exit(exit_codes::WAL_SYNC);
        }
    }
    match state.bot_state.current_kind() {
        BotStateKind::Halted | BotStateKind::HaltedDaily => return,
        _ => {}
    }

    // A live session is only as good as its arming file: re-verify every
    // tick and fall back to observe-only the moment it stops checking out.
    if state.bot_state.current_kind().is_live() {
        let armed = state.arming.lock().verify_arming_file();
        if let Err(e) = armed {
            warn!(error = %e, "arming file no longer valid — downgrading");
            if let Err(e) = state
                .bot_state
                .transition(BotStateKind::ObserveOnly, "arming check failed")
            {
                warn!(error = %e, "downgrade transition failed");
            }
            if let Err(e) = state.wal.append(
                types::WalRecordType::StateChanged,
                serde_json::json!({"to": "OBSERVE_ONLY", "reason": "arming check failed"}),
            ) {
                error!(error = %e, "WAL failure on state change — halting");
                std::process::exit(exit_codes::WAL_SYNC);
            }
        }
    }

    let market_ids: Vec<String> = state.markets.read().keys().cloned().collect();
    let now = Utc::now();
    let now_ms = now.timestamp_millis();

    for market_id in market_ids {
        let pair = state.snapshot_pair(&market_id);
        let Some(snapshot) = pair.latest.clone() else {
            continue;
        };
        let market = state.market(&market_id);

        let fired = detect_triggers(&snapshot, pair.prev.as_deref(), market.as_ref(), now);
        let mut persisted: Vec<TriggerKind> = Vec::new();
        {
            let mut tracker = state.triggers.lock();
            for kind in fired {
                if tracker.record(&market_id, kind, &snapshot.snapshot_id, now_ms) {
                    tracker.clear(&market_id, kind);
                    persisted.push(kind);
                }
            }
        }
        if persisted.is_empty() {
            continue;
        }

        {
            let mut limiter = state.rate_limiter.lock();
            if !limiter.can_enqueue(&market_id, now_ms) {
                warn!(market_id = %market_id, "candidate rate cap hit");
                continue;
            }
            limiter.record_enqueue(&market_id, now_ms);
        }

        let candidate = Candidate::new(&market_id, &snapshot.snapshot_id, persisted);
        state.events.log_event(
            "CANDIDATE_ENQUEUED",
            Some(&market_id),
            Some(&candidate.candidate_id),
            None,
            serde_json::json!({
                "triggers": candidate
                    .trigger_reasons
                    .iter()
                    .map(|t| t.as_str())
                    .collect::<Vec<_>>(),
            }),
        );

        match evaluate_candidate(state, candidate, "fast-loop").await {
            PipelineOutcome::Trade { decision, .. } => {
                info!(market_id = %market_id, decision_id = %decision.decision_id_hex, "candidate traded");
            }
            PipelineOutcome::NoTrade { reason, .. } => {
                info!(market_id = %market_id, reason = %reason, "candidate ended without trade");
            }
            PipelineOutcome::Fatal(e) => {
                error!(error = %e, "WAL failure in pipeline — halting");
                std::process::exit(exit_codes::WAL_SYNC);
            }
        }
    }
}

// =============================================================================
// Strategy pipeline — the deterministic decision path for one candidate
// =============================================================================
//
// Stage order is fixed: coarse filters → evidence → injection → AI swarm
// (budget-gated) → calibration → decision → risk → lock + execution. Every
// candidate ends in exactly one terminal status with at most one canonical
// reason, logged as a single event.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::app_state::AppState;
use crate::calibration::{compute_p_eff, compute_w_ai};
use crate::candidates::Candidate;
use crate::decision::{make_decision, Decision, DecisionInputs};
use crate::evidence::{
    build_bundle, is_high_stakes, is_thesis_required, resolve_conflict, ConflictResolution,
    DEFAULT_SUBJECTIVE_TERMS,
};
use crate::execution::ExecutionOutcome;
use crate::filters::run_all_filters;
use crate::injection::InjectionVerdict;
use crate::types::{BotStateKind, CandidateStatus, NoTradeReason};
use crate::wal::WalError;
use crate::watchlist::track_trigger_noise;
use crate::ws_health::ws_healthy_exec;

/// Terminal outcome of one pipeline run.
#[derive(Debug)]
pub enum PipelineOutcome {
    Trade {
        candidate_id: String,
        decision: Decision,
        local_order_id: String,
    },
    NoTrade {
        candidate_id: String,
        reason: NoTradeReason,
    },
    /// A WAL write failed mid-pipeline. The process must exit.
    Fatal(WalError),
}

fn finish_no_trade(
    state: &Arc<AppState>,
    candidate: &mut Candidate,
    status: CandidateStatus,
    reason: NoTradeReason,
    detail: &str,
) -> PipelineOutcome {
    candidate.status = status;
    candidate.filter_reason = Some(reason);
    if let Err(e) = state.store.upsert_candidate(candidate) {
        tracing::warn!(error = %e, "candidate persist failed");
    }
    state.events.log_event(
        "CANDIDATE_TERMINAL",
        Some(&candidate.market_id),
        Some(&candidate.candidate_id),
        Some(reason),
        serde_json::json!({ "detail": detail, "status": status.as_str() }),
    );
    let _ = track_trigger_noise(&state.store, &candidate.market_id, true, Utc::now());

    PipelineOutcome::NoTrade {
        candidate_id: candidate.candidate_id.clone(),
        reason,
    }
}

/// Evaluate one candidate end to end.
pub async fn evaluate_candidate(
    state: &Arc<AppState>,
    mut candidate: Candidate,
    worker_id: &str,
) -> PipelineOutcome {
    let market_id = candidate.market_id.clone();

    // Per-market serialization: the lock is held for the whole pipeline run.
    let Some(lock_version) = state.locks.acquire(&market_id, worker_id) else {
        return finish_no_trade(
            state,
            &mut candidate,
            CandidateStatus::Dropped,
            NoTradeReason::LockLost,
            "market lock held elsewhere",
        );
    };

    let outcome = evaluate_locked(state, &mut candidate, worker_id, lock_version).await;
    state.locks.release(&market_id, worker_id);
    outcome
}

async fn evaluate_locked(
    state: &Arc<AppState>,
    candidate: &mut Candidate,
    worker_id: &str,
    lock_version: u64,
) -> PipelineOutcome {
    let now = Utc::now();
    let market_id = candidate.market_id.clone();

    let Some(market) = state.market(&market_id) else {
        return finish_no_trade(
            state,
            candidate,
            CandidateStatus::Filtered,
            NoTradeReason::MarketNotEligible,
            "market not in registry",
        );
    };

    let pair = state.snapshot_pair(&market_id);
    let Some(snapshot) = pair.latest else {
        return finish_no_trade(
            state,
            candidate,
            CandidateStatus::Filtered,
            NoTradeReason::WsUnhealthyDecision,
            "no snapshot for market",
        );
    };

    // Intended size drives thesis / high-stakes classification downstream.
    candidate.intended_size_usd = state.risk.compute_order_size(None);
    if let Err(e) = state.store.upsert_candidate(candidate) {
        tracing::warn!(error = %e, "candidate persist failed");
    }

    // ── Coarse filters ──────────────────────────────────────────────────
    let ws = state.ws.health_view();
    if let Err(reason) = run_all_filters(candidate, &market, &snapshot, Some(&ws), now) {
        return finish_no_trade(
            state,
            candidate,
            CandidateStatus::Filtered,
            reason,
            "coarse filter reject",
        );
    }

    // ── Evidence ────────────────────────────────────────────────────────
    let wallet_usd = state.risk.wallet_usd();
    let (bundle, bundle_hash) = build_bundle(
        state.evidence_for(&market_id),
        &state.source_ttls(),
        None,
        now,
    );
    let tier1_count = bundle.iter().filter(|i| i.reliability_tier == 1).count();

    let thesis_required =
        is_thesis_required(candidate, &market, wallet_usd, &DEFAULT_SUBJECTIVE_TERMS);
    if thesis_required && bundle.is_empty() {
        return finish_no_trade(
            state,
            candidate,
            CandidateStatus::Dropped,
            NoTradeReason::EvidenceRequired,
            "thesis required but no valid evidence",
        );
    }

    // Dispute risk is unknown before the swarm; high-stakes here keys on
    // size and resolution proximity.
    let high_stakes = is_high_stakes(candidate, &market, wallet_usd, 0.0, now);

    let mut evidence_conflict_tier1 = false;
    match resolve_conflict(&bundle, high_stakes) {
        ConflictResolution::Proceed => {}
        ConflictResolution::ProceedWithBuffer => evidence_conflict_tier1 = true,
        ConflictResolution::NoTrade(reason) => {
            return finish_no_trade(
                state,
                candidate,
                CandidateStatus::Dropped,
                reason,
                "evidence conflict",
            );
        }
    }

    candidate.status = CandidateStatus::EvidenceDone;
    if let Err(e) = state.store.upsert_candidate(candidate) {
        tracing::warn!(error = %e, "candidate persist failed");
    }
    debug!(
        candidate_id = %candidate.candidate_id,
        items = bundle.len(),
        tier1 = tier1_count,
        bundle_hash = %bundle_hash,
        thesis_required,
        high_stakes,
        "evidence stage complete"
    );

    // ── Injection defence ───────────────────────────────────────────────
    let mut texts: Vec<&str> = vec![
        market.title.as_str(),
        market.description.as_str(),
        market.resolution_source.as_str(),
    ];
    texts.extend(bundle.iter().map(|i| i.text.as_str()));
    if let InjectionVerdict::Block { reason, matches } =
        state.injection.check(&texts, high_stakes, tier1_count)
    {
        return finish_no_trade(
            state,
            candidate,
            CandidateStatus::Dropped,
            reason,
            &format!("{} pattern hits", matches.len()),
        );
    }

    // ── AI swarm (budget-gated) ─────────────────────────────────────────
    let analysis = match state
        .swarm
        .analyze(&market, candidate, &bundle, &snapshot, &state.budget)
        .await
    {
        Ok(analysis) => analysis,
        Err(reason) => {
            return finish_no_trade(
                state,
                candidate,
                CandidateStatus::Dropped,
                reason,
                "budget denied all model calls",
            );
        }
    };
    if let Some((reason, detail)) = analysis.quorum_failure.clone() {
        return finish_no_trade(state, candidate, CandidateStatus::Dropped, reason, &detail);
    }

    candidate.status = CandidateStatus::AiDone;
    if let Err(e) = state.store.upsert_candidate(candidate) {
        tracing::warn!(error = %e, "candidate persist failed");
    }

    // ── Calibration ─────────────────────────────────────────────────────
    let p_market = snapshot.best_bid_yes.unwrap_or(0.5);
    let p_ai = analysis.aggregated_prob_yes.unwrap_or(p_market);
    let dispute_risk = analysis.aggregated_dispute_risk;

    let (n_resolved, briers) = {
        let cal = state.calibration.read();
        (cal.n_resolved(), cal.category_briers(&market.category))
    };
    let (brier_ai, brier_baseline) = match briers {
        Some((a, b)) => (Some(a), Some(b)),
        None => (None, None),
    };
    let w_ai = compute_w_ai(
        n_resolved,
        brier_ai,
        brier_baseline,
        analysis.disagreement,
        dispute_risk,
        Some(tier1_count),
    );
    let (p_eff, outlier) = compute_p_eff(p_market, p_ai, w_ai, dispute_risk);
    if let Some(reason) = outlier {
        return finish_no_trade(
            state,
            candidate,
            CandidateStatus::Dropped,
            reason,
            "pre-clamp deviation above outlier threshold",
        );
    }

    // ── Decision ────────────────────────────────────────────────────────
    let time_to_resolution_days = market
        .time_to_resolution_sec(now)
        .map(|s| s as f64 / 86_400.0)
        .unwrap_or(0.0);
    let is_paper = state.bot_state.current_kind() != BotStateKind::LiveTrading;

    let decision = make_decision(
        &market_id,
        &candidate.candidate_id,
        &snapshot,
        &DecisionInputs {
            p_eff,
            order_size_usd: candidate.intended_size_usd,
            dispute_risk,
            evidence_conflict_tier1,
            decision_to_exec_sec: 0.0,
            time_to_resolution_days,
            fee_rate_bps: state.config.fee_rate_bps,
            is_paper,
        },
    );

    candidate.decision_id_hex = Some(decision.decision_id_hex.clone());
    candidate.status = CandidateStatus::Decided;
    if let Err(e) = state.store.upsert_candidate(candidate) {
        tracing::warn!(error = %e, "candidate persist failed");
    }

    if !decision.is_trade() {
        return finish_no_trade(
            state,
            candidate,
            CandidateStatus::Decided,
            NoTradeReason::EvTooLow,
            &format!("ev_yes={} ev_no={}", decision.ev_yes, decision.ev_no),
        );
    }

    // ── Risk gate ───────────────────────────────────────────────────────
    if let Err(detail) = state.risk.can_open_position(&market_id) {
        return finish_no_trade(
            state,
            candidate,
            CandidateStatus::Decided,
            NoTradeReason::RiskLimitHit,
            &detail,
        );
    }

    // ── Execution freshness + submission ────────────────────────────────
    let (exec_healthy, exec_reasons) = ws_healthy_exec(
        &market_id,
        &snapshot,
        &state.ws.health_view(),
        now.timestamp_millis(),
    );
    if !exec_healthy {
        return finish_no_trade(
            state,
            candidate,
            CandidateStatus::Decided,
            NoTradeReason::WsUnhealthyDecision,
            &exec_reasons.join("; "),
        );
    }

    let lock_version = state
        .locks
        .renew(&market_id, worker_id)
        .unwrap_or(lock_version);
    let live = !is_paper;

    match state.execution.submit(
        &decision,
        worker_id,
        lock_version,
        live,
        state.config.fee_rate_bps,
    ) {
        Ok(ExecutionOutcome::Submitted { local_order_id }) => {
            candidate.status = CandidateStatus::Executed;
            if let Err(e) = state.store.upsert_candidate(candidate) {
                tracing::warn!(error = %e, "candidate persist failed");
            }
            state.events.log_event(
                "ORDER_SUBMITTED",
                Some(&market_id),
                Some(&candidate.candidate_id),
                None,
                serde_json::json!({
                    "decision_id": decision.decision_id_hex,
                    "side": decision.side.as_str(),
                    "size_usd": decision.size_usd,
                    "ev": decision.ev,
                    "prompt_hash": analysis.prompt_hash,
                }),
            );
            let _ = track_trigger_noise(&state.store, &market_id, false, now);
            info!(
                candidate_id = %candidate.candidate_id,
                decision_id = %decision.decision_id_hex,
                side = %decision.side,
                ev = decision.ev,
                "trade submitted"
            );
            PipelineOutcome::Trade {
                candidate_id: candidate.candidate_id.clone(),
                decision,
                local_order_id,
            }
        }
        Ok(ExecutionOutcome::Aborted { reason, detail }) => {
            finish_no_trade(state, candidate, CandidateStatus::Decided, reason, &detail)
        }
        Err(e) => PipelineOutcome::Fatal(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app_state::EngineConfig;
    use crate::bot_state::BotStateManager;
    use crate::injection::InjectionDefence;
    use crate::market_data::BookUpdate;
    use crate::registry::Market;
    use crate::store::Store;
    use crate::types::TriggerKind;
    use crate::wal::WalWriter;

    fn state_with_market() -> Arc<AppState> {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open_in_memory().unwrap());
        store.migrate().unwrap();
        let wal = Arc::new(WalWriter::new(dir.path().join("wal.log")));
        wal.open().unwrap();
        std::mem::forget(dir);
        let bot_state =
            Arc::new(BotStateManager::initialise(Arc::clone(&store), "secret").unwrap());
        let state = AppState::new(
            EngineConfig::default(),
            store,
            wal,
            bot_state,
            Arc::new(InjectionDefence::invalid()),
            Vec::new(),
            "", // swarm disabled
            "secret",
            "inst-test",
        );

        let now = Utc::now();
        state
            .sync_market(Market {
                market_id: "mkt-1".to_string(),
                condition_id: "c".to_string(),
                category: "economics".to_string(),
                title: "Will rates be cut?".to_string(),
                description: "Resolves YES on an official announcement.".to_string(),
                resolution_source: "central bank statement".to_string(),
                end_date_utc: Some(now + chrono::Duration::days(7)),
                yes_token_id: "y".to_string(),
                no_token_id: "n".to_string(),
                volume_24h_usd: 85_000.0,
                liquidity_usd: 120_000.0,
                critical_field_hash: "h".to_string(),
                is_binary_eligible: true,
                eligibility_reason: None,
                frozen: false,
            })
            .unwrap();
        state
    }

    fn feed_snapshot(state: &Arc<AppState>, bid: f64, ask: f64) {
        state.ws.mark_connected();
        let update = state.ws.process_book_message(
            "mkt-1",
            Some(bid),
            Some(ask),
            Some(1.0 - ask),
            Some(1.0 - bid),
            vec![(bid, 200.0), (bid - 0.01, 200.0), (bid - 0.02, 200.0)],
            vec![
                (1.0 - ask, 200.0),
                (1.0 - ask - 0.01, 200.0),
                (1.0 - ask - 0.02, 200.0),
            ],
        );
        state.record_snapshot(&update);
    }

    #[tokio::test]
    async fn coarse_filter_reject_is_terminal_with_one_reason() {
        let state = state_with_market();
        // Ask-sum anomaly book: YES ask 0.45, NO ask 0.50.
        state.ws.mark_connected();
        let update = state.ws.process_book_message(
            "mkt-1",
            Some(0.43),
            Some(0.45),
            Some(0.48),
            Some(0.50),
            vec![(0.43, 200.0), (0.42, 200.0), (0.41, 200.0)],
            vec![(0.48, 200.0), (0.47, 200.0), (0.46, 200.0)],
        );
        state.record_snapshot(&update);

        let candidate = Candidate::new("mkt-1", "snap-x", vec![TriggerKind::MidMove]);
        let candidate_id = candidate.candidate_id.clone();
        let outcome = evaluate_candidate(&state, candidate, "w1").await;
        match outcome {
            PipelineOutcome::NoTrade { reason, .. } => {
                assert_eq!(reason, NoTradeReason::SnapshotAskSumAnomaly)
            }
            other => panic!("expected no-trade, got {other:?}"),
        }
        assert_eq!(
            state.store.candidate_status(&candidate_id).unwrap(),
            Some(CandidateStatus::Filtered)
        );
    }

    #[tokio::test]
    async fn injection_detector_invalid_blocks_before_ai() {
        // The harness uses an unloaded ruleset: every candidate that reaches
        // the injection stage must block with INJECTION_DETECTOR_INVALID.
        let state = state_with_market();
        feed_snapshot(&state, 0.40, 0.42);

        let candidate = Candidate::new("mkt-1", "snap-x", vec![TriggerKind::SpreadChange]);
        let outcome = evaluate_candidate(&state, candidate, "w1").await;
        match outcome {
            PipelineOutcome::NoTrade { reason, .. } => {
                assert_eq!(reason, NoTradeReason::InjectionDetectorInvalid)
            }
            other => panic!("expected no-trade, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn lock_is_released_after_terminal_outcome() {
        let state = state_with_market();
        feed_snapshot(&state, 0.40, 0.42);

        let candidate = Candidate::new("mkt-1", "snap-x", vec![TriggerKind::SpreadChange]);
        evaluate_candidate(&state, candidate, "w1").await;

        // A different worker can take the lock immediately afterwards.
        assert!(state.locks.acquire("mkt-1", "w2").is_some());
    }
}

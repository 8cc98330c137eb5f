// =============================================================================
// Durable bot state — signed singleton with forced startup downgrade
// =============================================================================
//
// The state row is HMAC-SHA-256 signed over `state=S|counter=N|ts_utc=T`.
// A signature mismatch on load is a fatal tamper error. On process start any
// LIVE_* state is downgraded to OBSERVE_ONLY with the counter bumped, so a
// crash can never resume live trading on its own.
// =============================================================================

use std::sync::Arc;

use chrono::Utc;
use hmac::{Hmac, Mac};
use parking_lot::RwLock;
use sha2::Sha256;
use thiserror::Error;
use tracing::{info, warn};

use crate::constants::ARMING_FILE_MAX_AGE_SEC;
use crate::store::Store;
use crate::types::BotStateKind;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum StateError {
    #[error("bot state signature verification failed — possible tampering")]
    SignatureMismatch,
    #[error("invalid state transition: {0}")]
    InvalidTransition(String),
    #[error("bot state persistence failed: {0}")]
    Persistence(String),
}

/// The singleton durable state row.
#[derive(Debug, Clone)]
pub struct BotState {
    pub state: BotStateKind,
    pub counter: i64,
    /// RFC 3339. The signature covers this exact string.
    pub ts_utc: String,
    pub armed_until_utc: Option<String>,
    pub halt_until_utc: Option<String>,
    pub halt_resume_state: Option<BotStateKind>,
    pub signature: Vec<u8>,
}

fn compute_signature(state: BotStateKind, counter: i64, ts_utc: &str, secret: &str) -> Vec<u8> {
    let canonical = format!("state={}|counter={}|ts_utc={}", state.as_str(), counter, ts_utc);
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
    mac.update(canonical.as_bytes());
    mac.finalize().into_bytes().to_vec()
}

impl BotState {
    pub fn initial() -> Self {
        Self {
            state: BotStateKind::ObserveOnly,
            counter: 1,
            ts_utc: Utc::now().to_rfc3339(),
            armed_until_utc: None,
            halt_until_utc: None,
            halt_resume_state: None,
            signature: Vec::new(),
        }
    }

    pub fn sign(&mut self, secret: &str) {
        self.signature = compute_signature(self.state, self.counter, &self.ts_utc, secret);
    }

    pub fn verify(&self, secret: &str) -> bool {
        let canonical = format!(
            "state={}|counter={}|ts_utc={}",
            self.state.as_str(),
            self.counter,
            self.ts_utc
        );
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(canonical.as_bytes());
        mac.verify_slice(&self.signature).is_ok()
    }
}

/// Allowed transition edges. Everything may fall into HALTED / OBSERVE_ONLY;
/// live states are only reachable through the arming path.
fn transition_allowed(from: BotStateKind, to: BotStateKind) -> bool {
    use BotStateKind::*;
    if from == to {
        return true;
    }
    match (from, to) {
        // Fail-safe edges are always allowed.
        (_, ObserveOnly) | (_, Halted) | (_, HaltedDaily) => true,
        (ObserveOnly, PaperTrading) => true,
        (PaperTrading, LiveArmed) => true,
        (LiveArmed, LiveTrading) => true,
        (Halted, PaperTrading) | (HaltedDaily, PaperTrading) => true,
        _ => false,
    }
}

/// Single owner of the durable state. All mutations go through
/// [`BotStateManager::transition`], which signs and persists atomically.
#[derive(Debug)]
pub struct BotStateManager {
    store: Arc<Store>,
    secret: String,
    current: RwLock<BotState>,
}

impl BotStateManager {
    /// Load-or-create the state row, verify its signature, and apply the
    /// startup force-downgrade.
    pub fn initialise(store: Arc<Store>, secret: &str) -> Result<Self, StateError> {
        let existing = store
            .load_bot_state()
            .map_err(|e| StateError::Persistence(e.to_string()))?;

        let state = match existing {
            None => {
                let mut bs = BotState::initial();
                bs.sign(secret);
                store
                    .save_bot_state(&bs)
                    .map_err(|e| StateError::Persistence(e.to_string()))?;
                info!(state = %bs.state, "bot state initialised");
                bs
            }
            Some(mut bs) => {
                if !bs.verify(secret) {
                    return Err(StateError::SignatureMismatch);
                }
                if bs.state.is_live() {
                    let old = bs.state;
                    bs.state = BotStateKind::ObserveOnly;
                    bs.counter += 1;
                    bs.ts_utc = Utc::now().to_rfc3339();
                    bs.armed_until_utc = None;
                    bs.sign(secret);
                    store
                        .save_bot_state(&bs)
                        .map_err(|e| StateError::Persistence(e.to_string()))?;
                    warn!(from = %old, to = %bs.state, "startup force-downgrade");
                }
                bs
            }
        };

        Ok(Self {
            store,
            secret: secret.to_string(),
            current: RwLock::new(state),
        })
    }

    pub fn current(&self) -> BotState {
        self.current.read().clone()
    }

    pub fn current_kind(&self) -> BotStateKind {
        self.current.read().state
    }

    /// Apply a signed transition. Returns the new state.
    pub fn transition(&self, to: BotStateKind, reason: &str) -> Result<BotState, StateError> {
        let mut guard = self.current.write();
        let from = guard.state;

        if !transition_allowed(from, to) {
            return Err(StateError::InvalidTransition(format!(
                "{} -> {} ({reason})",
                from.as_str(),
                to.as_str()
            )));
        }

        let mut next = guard.clone();
        next.state = to;
        next.counter += 1;
        next.ts_utc = Utc::now().to_rfc3339();
        if to == BotStateKind::LiveArmed {
            // The armed window is bounded by the arming-file lifetime.
            next.armed_until_utc = Some(
                (Utc::now() + chrono::Duration::seconds(ARMING_FILE_MAX_AGE_SEC)).to_rfc3339(),
            );
        } else if !to.is_live() {
            next.armed_until_utc = None;
        }
        next.sign(&self.secret);

        self.store
            .save_bot_state(&next)
            .map_err(|e| StateError::Persistence(e.to_string()))?;

        info!(from = %from, to = %to, counter = next.counter, reason, "state transition");
        *guard = next.clone();
        Ok(next)
    }
}

// =============================================================================
// Observability — canonical event log with reason counters
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use crate::types::NoTradeReason;

const MAX_RECENT_EVENTS: usize = 100;

/// One canonical engine event.
#[derive(Debug, Clone, Serialize)]
pub struct EngineEvent {
    pub at_ms: i64,
    pub event_type: String,
    pub market_id: Option<String>,
    pub candidate_id: Option<String>,
    pub reason: Option<NoTradeReason>,
    pub details: serde_json::Value,
}

#[derive(Debug, Default)]
struct Inner {
    events: Vec<EngineEvent>,
    total_events: u64,
    no_trade_counts: HashMap<NoTradeReason, u64>,
}

/// In-memory event ring with per-reason counters. The durable event log
/// lives in the store; this is the operational view.
#[derive(Debug, Default)]
pub struct EventLog {
    inner: Mutex<Inner>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn log_event(
        &self,
        event_type: &str,
        market_id: Option<&str>,
        candidate_id: Option<&str>,
        reason: Option<NoTradeReason>,
        details: serde_json::Value,
    ) {
        let event = EngineEvent {
            at_ms: Utc::now().timestamp_millis(),
            event_type: event_type.to_string(),
            market_id: market_id.map(|s| s.to_string()),
            candidate_id: candidate_id.map(|s| s.to_string()),
            reason,
            details,
        };

        info!(
            event_type,
            market_id = market_id.unwrap_or("-"),
            reason = reason.map(|r| r.as_str()).unwrap_or("-"),
            "event"
        );

        let mut inner = self.inner.lock();
        inner.total_events += 1;
        if let Some(reason) = reason {
            *inner.no_trade_counts.entry(reason).or_insert(0) += 1;
        }
        inner.events.push(event);
        let overflow = inner.events.len().saturating_sub(MAX_RECENT_EVENTS);
        if overflow > 0 {
            inner.events.drain(..overflow);
        }
    }

    pub fn no_trade_counts(&self) -> HashMap<NoTradeReason, u64> {
        self.inner.lock().no_trade_counts.clone()
    }

    pub fn recent_events(&self) -> Vec<EngineEvent> {
        self.inner.lock().events.clone()
    }

    pub fn total_events(&self) -> u64 {
        self.inner.lock().total_events
    }
}

// =============================================================================
// Operator alerts — deduplicated sink for fatal and degraded conditions
// =============================================================================
//
// The chat transport lives outside the core; this sink owns severity and the
// 5-minute dedup key that suppresses alert storms.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{error, warn};

use crate::constants::ALERT_DEDUP_SEC;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertSeverity {
    Degraded,
    Fatal,
}

/// Alert sink with per-key dedup.
#[derive(Debug, Default)]
pub struct AlertSink {
    last_sent_ms: Mutex<HashMap<String, i64>>,
}

impl AlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emit an alert unless the same dedup key fired within the window.
    /// Returns whether the alert went out.
    pub fn send(&self, severity: AlertSeverity, dedup_key: &str, message: &str) -> bool {
        let now = Utc::now().timestamp_millis();
        let mut last = self.last_sent_ms.lock();

        if let Some(at) = last.get(dedup_key) {
            if now - at < ALERT_DEDUP_SEC * 1000 {
                return false;
            }
        }
        last.insert(dedup_key.to_string(), now);

        match severity {
            AlertSeverity::Fatal => error!(dedup_key, "OPERATOR ALERT: {message}"),
            AlertSeverity::Degraded => warn!(dedup_key, "operator alert: {message}"),
        }
        true
    }

    #[cfg(test)]
    fn backdate(&self, dedup_key: &str, delta_ms: i64) {
        let mut last = self.last_sent_ms.lock();
        if let Some(at) = last.get_mut(dedup_key) {
            *at -= delta_ms;
        }
    }
}

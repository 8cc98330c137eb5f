// =============================================================================
// Market data — WS book ingestion and immutable snapshots
// =============================================================================

pub mod snapshots;
pub mod ws_client;

pub use snapshots::Snapshot;
pub use ws_client::{WsHealthView, WsTracker};

use serde::{Deserialize, Serialize};

/// One price level: `(price, size_usd)`.
pub type BookLevel = (f64, f64);

/// A normalized book update as produced by the WS driver.
///
/// Both token sides of the binary market are carried; depth arrays are
/// best-first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookUpdate {
    pub market_id: String,
    pub best_bid_yes: Option<f64>,
    pub best_ask_yes: Option<f64>,
    pub best_bid_no: Option<f64>,
    pub best_ask_no: Option<f64>,
    #[serde(default)]
    pub depth_yes: Vec<BookLevel>,
    #[serde(default)]
    pub depth_no: Vec<BookLevel>,
    pub ws_last_message_ms: i64,
    pub market_last_update_ms: Option<i64>,
    pub orderbook_last_change_ms: Option<i64>,
    pub snapshot_ws_epoch: u64,
}

/// Sum of the size column over the first `levels` entries.
pub fn top_depth_usd(depth: &[BookLevel], levels: usize) -> f64 {
    depth.iter().take(levels).map(|(_, size)| size).sum()
}

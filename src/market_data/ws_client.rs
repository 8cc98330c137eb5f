// =============================================================================
// Orderbook WebSocket client — connection epochs + per-market timestamps
// =============================================================================
//
// The tracker owns everything the freshness predicates need:
//   - ws_connected, ws_last_message_ms, current epoch (global)
//   - market_last_update_ms, orderbook_last_change_ms (per market)
//
// The epoch is bumped on every connect AND every disconnect, so a snapshot
// taken on a previous connection can never pass a health check.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{error, info, warn};

use super::{BookLevel, BookUpdate};
use crate::constants::BOOK_LEVELS_REQUIRED;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Per-market tracking state.
#[derive(Debug, Default, Clone)]
struct MarketWsState {
    market_last_update_ms: i64,
    orderbook_last_change_ms: i64,
    last_best_bid_yes: Option<f64>,
    last_best_ask_yes: Option<f64>,
    last_best_bid_no: Option<f64>,
    last_best_ask_no: Option<f64>,
    last_depth_yes: Vec<BookLevel>,
    last_depth_no: Vec<BookLevel>,
}

#[derive(Debug, Default)]
struct WsState {
    connected: bool,
    last_message_ms: i64,
    epoch: u64,
    markets: HashMap<String, MarketWsState>,
}

/// Read-only view of the connection state consumed by the health predicates.
#[derive(Debug, Clone, Copy)]
pub struct WsHealthView {
    pub connected: bool,
    pub last_message_ms: i64,
    pub epoch: u64,
}

// ---------------------------------------------------------------------------
// Tracker
// ---------------------------------------------------------------------------

/// Owns the WS connection state map. The driver task is the only writer;
/// everything else reads through [`WsHealthView`].
pub struct WsTracker {
    state: RwLock<WsState>,
}

impl WsTracker {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(WsState::default()),
        }
    }

    pub fn mark_connected(&self) -> u64 {
        let mut s = self.state.write();
        s.connected = true;
        s.epoch += 1;
        s.last_message_ms = now_ms();
        info!(epoch = s.epoch, "WS connected");
        s.epoch
    }

    pub fn mark_disconnected(&self) -> u64 {
        let mut s = self.state.write();
        s.connected = false;
        s.epoch += 1;
        info!(epoch = s.epoch, "WS disconnected");
        s.epoch
    }

    /// Record a non-book message (heartbeat etc.).
    pub fn touch(&self) {
        self.state.write().last_message_ms = now_ms();
    }

    pub fn health_view(&self) -> WsHealthView {
        let s = self.state.read();
        WsHealthView {
            connected: s.connected,
            last_message_ms: s.last_message_ms,
            epoch: s.epoch,
        }
    }

    /// Process one book message: update global + per-market timestamps and
    /// return a [`BookUpdate`] ready for snapshot creation.
    ///
    /// `orderbook_last_change_ms` only advances when the best prices or the
    /// top levels actually changed, which is what the depth-drop trigger and
    /// the freshness predicates key on.
    #[allow(clippy::too_many_arguments)]
    pub fn process_book_message(
        &self,
        market_id: &str,
        best_bid_yes: Option<f64>,
        best_ask_yes: Option<f64>,
        best_bid_no: Option<f64>,
        best_ask_no: Option<f64>,
        depth_yes: Vec<BookLevel>,
        depth_no: Vec<BookLevel>,
    ) -> BookUpdate {
        let now = now_ms();
        let mut s = self.state.write();
        s.last_message_ms = now;
        let epoch = s.epoch;

        let m = s.markets.entry(market_id.to_string()).or_default();
        m.market_last_update_ms = now;

        let changed = m.last_best_bid_yes != best_bid_yes
            || m.last_best_ask_yes != best_ask_yes
            || m.last_best_bid_no != best_bid_no
            || m.last_best_ask_no != best_ask_no
            || m.last_depth_yes.iter().take(BOOK_LEVELS_REQUIRED).ne(depth_yes
                .iter()
                .take(BOOK_LEVELS_REQUIRED))
            || m.last_depth_no.iter().take(BOOK_LEVELS_REQUIRED).ne(depth_no
                .iter()
                .take(BOOK_LEVELS_REQUIRED));
        if changed {
            m.orderbook_last_change_ms = now;
        }

        m.last_best_bid_yes = best_bid_yes;
        m.last_best_ask_yes = best_ask_yes;
        m.last_best_bid_no = best_bid_no;
        m.last_best_ask_no = best_ask_no;
        m.last_depth_yes = depth_yes.clone();
        m.last_depth_no = depth_no.clone();

        let market_last_update_ms = Some(m.market_last_update_ms);
        let orderbook_last_change_ms = if m.orderbook_last_change_ms > 0 {
            Some(m.orderbook_last_change_ms)
        } else {
            None
        };

        BookUpdate {
            market_id: market_id.to_string(),
            best_bid_yes,
            best_ask_yes,
            best_bid_no,
            best_ask_no,
            depth_yes,
            depth_no,
            ws_last_message_ms: now,
            market_last_update_ms,
            orderbook_last_change_ms,
            snapshot_ws_epoch: epoch,
        }
    }
}

impl Default for WsTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Stream driver
// ---------------------------------------------------------------------------

/// Connect to the CLOB market channel, subscribe to `market_ids`, and feed
/// parsed book updates into `tx`.
///
/// Returns when the stream ends or errors so the caller (main.rs) can handle
/// reconnection with its own backoff.
pub async fn run_market_stream(
    ws_url: &str,
    market_ids: &[String],
    tracker: &Arc<WsTracker>,
    tx: &mpsc::Sender<BookUpdate>,
) -> Result<()> {
    info!(url = %ws_url, markets = market_ids.len(), "connecting to market WebSocket");

    let (ws_stream, _response) = connect_async(ws_url)
        .await
        .context("failed to connect to market WebSocket")?;
    tracker.mark_connected();

    let (mut write, mut read) = ws_stream.split();

    for mid in market_ids {
        let sub = serde_json::json!({
            "channel": "market",
            "market": mid,
            "type": "subscribe",
        });
        write
            .send(tokio_tungstenite::tungstenite::Message::Text(sub.to_string()))
            .await
            .context("failed to send subscription")?;
    }
    info!(count = market_ids.len(), "subscribed to markets");

    loop {
        match read.next().await {
            Some(Ok(tokio_tungstenite::tungstenite::Message::Text(text))) => {
                match parse_book_message(&text) {
                    Ok(Some(parsed)) => {
                        let update = tracker.process_book_message(
                            &parsed.market_id,
                            parsed.best_bid_yes,
                            parsed.best_ask_yes,
                            parsed.best_bid_no,
                            parsed.best_ask_no,
                            parsed.depth_yes,
                            parsed.depth_no,
                        );
                        if tx.send(update).await.is_err() {
                            warn!("book update channel closed — stopping stream");
                            tracker.mark_disconnected();
                            return Ok(());
                        }
                    }
                    Ok(None) => tracker.touch(),
                    Err(e) => warn!(error = %e, "failed to parse book message"),
                }
            }
            Some(Ok(_)) => tracker.touch(),
            Some(Err(e)) => {
                error!(error = %e, "market WebSocket read error");
                tracker.mark_disconnected();
                return Err(e.into());
            }
            None => {
                warn!("market WebSocket stream ended");
                tracker.mark_disconnected();
                return Ok(());
            }
        }
    }
}

struct ParsedBook {
    market_id: String,
    best_bid_yes: Option<f64>,
    best_ask_yes: Option<f64>,
    best_bid_no: Option<f64>,
    best_ask_no: Option<f64>,
    depth_yes: Vec<BookLevel>,
    depth_no: Vec<BookLevel>,
}

/// Parse one CLOB book message. Returns `Ok(None)` for heartbeats and other
/// non-book payloads.
///
/// The NO side of a binary book is the complement of the YES side when the
/// venue publishes only one token's levels.
fn parse_book_message(text: &str) -> Result<Option<ParsedBook>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("book message is not JSON")?;

    let market_id = root
        .get("market")
        .or_else(|| root.get("asset_id"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    if market_id.is_empty() {
        return Ok(None);
    }

    let parse_levels = |key: &str| -> Vec<BookLevel> {
        root.get(key)
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|level| {
                        let price = level
                            .get("price")
                            .and_then(|p| p.as_str())
                            .and_then(|p| p.parse::<f64>().ok())?;
                        let size = level
                            .get("size")
                            .and_then(|s| s.as_str())
                            .and_then(|s| s.parse::<f64>().ok())
                            .unwrap_or(0.0);
                        Some((price, size))
                    })
                    .collect()
            })
            .unwrap_or_default()
    };

    let bids = parse_levels("bids");
    let asks = parse_levels("asks");
    if bids.is_empty() && asks.is_empty() {
        return Ok(None);
    }

    let best_bid_yes = bids.first().map(|(p, _)| *p);
    let best_ask_yes = asks.first().map(|(p, _)| *p);
    let best_bid_no = best_ask_yes.map(|p| ((1.0 - p) * 1e6).round() / 1e6);
    let best_ask_no = best_bid_yes.map(|p| ((1.0 - p) * 1e6).round() / 1e6);

    // Mirror the YES levels onto the NO side at complement prices.
    let depth_no: Vec<BookLevel> = asks
        .iter()
        .map(|(p, s)| (((1.0 - p) * 1e6).round() / 1e6, *s))
        .collect();

    Ok(Some(ParsedBook {
        market_id,
        best_bid_yes,
        best_ask_yes,
        best_bid_no,
        best_ask_no,
        depth_yes: bids,
        depth_no,
    }))
}

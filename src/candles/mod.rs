// =============================================================================
// Candle Tracker (C3) — phase-tagged OHLCV windows per bot
// =============================================================================
//
// Generalizes the teacher's `market_data/candle_buffer.rs` ring buffer (keyed
// per `(symbol, interval)`, with in-progress-candle replace-by-open_time
// semantics) from a single shared market-data feed into a per-bot,
// phase-partitioned window store: `pre_trade`, `during_trade`, `post_trade`.
//
// Each bot has at most one *active* window per phase at a time. Sealed
// windows (pre/post capped at 200 candles, during_trade sealed on exit) are
// hand off to the persistence layer and the active slot is cleared.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ErrorKind, FleetError};
use crate::exchange::{Candle, ExchangeAdapter};
use crate::storage::StateStore;

/// Number of candles a sealed `pre_trade`/`post_trade` window must converge
/// to (spec §3 invariant).
pub const WINDOW_SIZE: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    PreTrade,
    DuringTrade,
    PostTrade,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::PreTrade => "pre_trade",
            Phase::DuringTrade => "during_trade",
            Phase::PostTrade => "post_trade",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Open,
    Closed,
}

/// A phase-tagged OHLCV window for one bot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandleWindow {
    pub bot_id: String,
    pub symbol: String,
    pub timeframe: String,
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buy_trade_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sell_trade_id: Option<String>,
    pub candles: VecDeque<Candle>,
    pub count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position_status: Option<PositionStatus>,
    pub start_ts: i64,
    pub end_ts: i64,
    pub updated_at: i64,
    pub sealed: bool,
}

impl CandleWindow {
    fn new(bot_id: &str, symbol: &str, timeframe: &str, phase: Phase, now: i64) -> Self {
        Self {
            bot_id: bot_id.to_string(),
            symbol: symbol.to_string(),
            timeframe: timeframe.to_string(),
            phase,
            buy_trade_id: None,
            sell_trade_id: None,
            candles: VecDeque::new(),
            count: 0,
            position_status: if phase == Phase::DuringTrade {
                Some(PositionStatus::Open)
            } else {
                None
            },
            start_ts: now,
            end_ts: now,
            updated_at: now,
            sealed: false,
        }
    }

    fn push_closed(&mut self, candle: Candle, now: i64) {
        self.end_ts = candle.close_time;
        self.updated_at = now;
        self.candles.push_back(candle);
        self.count = self.candles.len();
    }

    pub fn closes(&self) -> Vec<f64> {
        self.candles.iter().map(|c| c.close).collect()
    }
}

struct BotWindows {
    pre_trade: Option<CandleWindow>,
    during_trade: Option<CandleWindow>,
    post_trade: Option<CandleWindow>,
}

impl Default for BotWindows {
    fn default() -> Self {
        Self {
            pre_trade: None,
            during_trade: None,
            post_trade: None,
        }
    }
}

/// Phase-partitioned OHLCV window store, one `BotWindows` per bot.
pub struct CandleTracker {
    windows: RwLock<HashMap<String, BotWindows>>,
    exchange: Arc<dyn ExchangeAdapter>,
    store: Arc<StateStore>,
}

impl CandleTracker {
    pub fn new(exchange: Arc<dyn ExchangeAdapter>, store: Arc<StateStore>) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            exchange,
            store,
        }
    }

    /// Fetch the last 200 candles and upsert as the bot's single `pre_trade`
    /// window (spec §4.3). Called every tick; replaces prior content. On
    /// exchange read failure the existing window is left intact.
    pub async fn track_pre_trade(
        &self,
        bot_id: &str,
        symbol: &str,
        timeframe: &str,
    ) -> Result<(), FleetError> {
        let candles = self
            .exchange
            .get_klines(symbol, timeframe, WINDOW_SIZE as u32)
            .await?;

        let now = latest_close_time(&candles);
        let mut window = CandleWindow::new(bot_id, symbol, timeframe, Phase::PreTrade, now);
        for c in candles.into_iter().filter(|c| c.is_closed) {
            window.push_closed(c, now);
        }
        // Converge to exactly WINDOW_SIZE by trimming the oldest.
        while window.candles.len() > WINDOW_SIZE {
            window.candles.pop_front();
        }
        window.count = window.candles.len();

        let mut guard = self.windows.write();
        guard.entry(bot_id.to_string()).or_default().pre_trade = Some(window);
        Ok(())
    }

    /// Create an empty `during_trade` window in state `open`. Idempotent on
    /// `buy_trade_id`.
    pub fn start_position_tracking(
        &self,
        bot_id: &str,
        symbol: &str,
        timeframe: &str,
        buy_trade_id: &str,
        now: i64,
    ) {
        let mut guard = self.windows.write();
        let slot = guard.entry(bot_id.to_string()).or_default();

        if let Some(existing) = &slot.during_trade {
            if existing.buy_trade_id.as_deref() == Some(buy_trade_id) {
                return; // already tracking this trade
            }
        }

        let mut window = CandleWindow::new(bot_id, symbol, timeframe, Phase::DuringTrade, now);
        window.buy_trade_id = Some(buy_trade_id.to_string());
        slot.during_trade = Some(window);
    }

    /// Append candles newer than the window's `end_ts`; no-op if there is no
    /// new closed candle.
    pub fn update_position_tracking(&self, bot_id: &str, fresh_candles: &[Candle], now: i64) {
        let mut guard = self.windows.write();
        let Some(slot) = guard.get_mut(bot_id) else { return };
        let Some(window) = slot.during_trade.as_mut() else { return };
        if window.sealed {
            return;
        }
        for c in fresh_candles.iter().filter(|c| c.is_closed && c.close_time > window.end_ts) {
            window.push_closed(c.clone(), now);
        }
    }

    /// Seal the open `during_trade` window: attach `sell_trade_id`, set
    /// `position_status=closed`, freeze `end_ts`. Returns the sealed window
    /// for hand-off to persistence, if one existed.
    pub fn stop_position_tracking(
        &self,
        bot_id: &str,
        sell_trade_id: &str,
        now: i64,
    ) -> Option<CandleWindow> {
        let mut guard = self.windows.write();
        let slot = guard.get_mut(bot_id)?;
        let mut window = slot.during_trade.take()?;
        window.sell_trade_id = Some(sell_trade_id.to_string());
        window.position_status = Some(PositionStatus::Closed);
        window.sealed = true;
        window.end_ts = now;
        window.updated_at = now;

        if let Err(e) = self.store.persist_candle_window(&window) {
            warn!(bot_id, error = %e, "failed to persist sealed during_trade window");
        }
        Some(window)
    }

    /// Create an empty `post_trade` window. Idempotent on `(bot_id,
    /// sell_trade_id)`.
    pub fn start_post_trade(
        &self,
        bot_id: &str,
        symbol: &str,
        timeframe: &str,
        sell_trade_id: &str,
        now: i64,
    ) {
        let mut guard = self.windows.write();
        let slot = guard.entry(bot_id.to_string()).or_default();

        if let Some(existing) = &slot.post_trade {
            if existing.sell_trade_id.as_deref() == Some(sell_trade_id) {
                return;
            }
        }

        let mut window = CandleWindow::new(bot_id, symbol, timeframe, Phase::PostTrade, now);
        window.sell_trade_id = Some(sell_trade_id.to_string());
        slot.post_trade = Some(window);
    }

    /// Append new candles until `count == 200`, then mark sealed.
    pub fn update_post_trade(&self, bot_id: &str, fresh_candles: &[Candle], now: i64) {
        let mut guard = self.windows.write();
        let Some(slot) = guard.get_mut(bot_id) else { return };
        let Some(window) = slot.post_trade.as_mut() else { return };
        if window.sealed {
            return;
        }
        for c in fresh_candles.iter().filter(|c| c.is_closed && c.close_time > window.end_ts) {
            window.push_closed(c.clone(), now);
            if window.candles.len() >= WINDOW_SIZE {
                break;
            }
        }
        if window.candles.len() >= WINDOW_SIZE {
            window.sealed = true;
            let sealed = window.clone();
            drop(guard);
            if let Err(e) = self.store.persist_candle_window(&sealed) {
                warn!(bot_id, error = %e, "failed to persist sealed post_trade window");
            }
        }
    }

    /// Whether this bot has an unsealed `post_trade` window (drives the
    /// "background task" rule in spec §4.5: keep updating post-trade even
    /// while the bot is flat).
    pub fn has_open_post_trade(&self, bot_id: &str) -> bool {
        self.windows
            .read()
            .get(bot_id)
            .and_then(|s| s.post_trade.as_ref())
            .map(|w| !w.sealed)
            .unwrap_or(false)
    }

    /// Read candles for a bot's given phase, or all three concatenated.
    pub fn get_candles(&self, bot_id: &str, phase: Option<Phase>) -> Vec<CandleWindow> {
        let guard = self.windows.read();
        let Some(slot) = guard.get(bot_id) else { return Vec::new() };
        match phase {
            Some(Phase::PreTrade) => slot.pre_trade.iter().cloned().collect(),
            Some(Phase::DuringTrade) => slot.during_trade.iter().cloned().collect(),
            Some(Phase::PostTrade) => slot.post_trade.iter().cloned().collect(),
            None => [&slot.pre_trade, &slot.during_trade, &slot.post_trade]
                .into_iter()
                .flatten()
                .cloned()
                .collect(),
        }
    }

    /// Delete persisted sealed windows last touched before `cutoff_ms`
    /// (spec §4.3: "windows older than 30 days and sealed are eligible for
    /// deletion"). Only acts on the persistence layer — a bot's *active*
    /// in-memory window is never sealed until exit, so this never disturbs
    /// a running bot's current windows.
    pub fn gc_sealed(&self, cutoff_ms: i64) -> usize {
        match self.store.gc_sealed_candle_windows(cutoff_ms) {
            Ok(removed) => removed,
            Err(e) => {
                warn!(error = %e, "sealed candle window GC failed");
                0
            }
        }
    }

    pub fn pre_trade_closes(&self, bot_id: &str) -> Vec<f64> {
        self.windows
            .read()
            .get(bot_id)
            .and_then(|s| s.pre_trade.as_ref())
            .map(|w| w.closes())
            .unwrap_or_default()
    }
}

fn latest_close_time(candles: &[Candle]) -> i64 {
    candles.iter().map(|c| c.close_time).max().unwrap_or(0)
}

/// `ErrStrategyInput` guard: a strategy needs at least `min_window` closes.
pub fn require_window(closes: &[f64], min_window: usize) -> Result<(), FleetError> {
    if closes.len() < min_window {
        return Err(FleetError::new(
            ErrorKind::StrategyInput,
            format!("need at least {min_window} candles, have {}", closes.len()),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(open_time: i64, close: f64) -> Candle {
        Candle {
            open_time,
            close_time: open_time + 59_999,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 10.0,
            quote_volume: 100.0,
            trades_count: 5,
            taker_buy_volume: 5.0,
            taker_buy_quote_volume: 50.0,
            is_closed: true,
        }
    }

    #[test]
    fn window_closes_returns_close_prices() {
        let mut w = CandleWindow::new("b1", "BTCUSDT", "5m", Phase::PreTrade, 0);
        w.push_closed(sample(0, 100.0), 0);
        w.push_closed(sample(60_000, 101.0), 60_000);
        assert_eq!(w.closes(), vec![100.0, 101.0]);
    }

    #[test]
    fn start_position_tracking_is_idempotent_on_buy_trade_id() {
        // Constructing directly (no exchange round trip needed for this check).
        let mut slot = BotWindows::default();
        let mut w = CandleWindow::new("b1", "ETHUSDT", "5m", Phase::DuringTrade, 0);
        w.buy_trade_id = Some("trade-1".into());
        w.push_closed(sample(0, 10.0), 0);
        slot.during_trade = Some(w);

        // Simulate a second start_position_tracking call with the same id:
        // it must not replace the window (and thus not lose the candle).
        if let Some(existing) = &slot.during_trade {
            assert_eq!(existing.buy_trade_id.as_deref(), Some("trade-1"));
            assert_eq!(existing.candles.len(), 1);
        }
    }

    #[test]
    fn require_window_rejects_short_input() {
        let err = require_window(&[1.0, 2.0], 50).unwrap_err();
        assert_eq!(err.kind, ErrorKind::StrategyInput);
    }

    #[test]
    fn require_window_accepts_sufficient_input() {
        let closes: Vec<f64> = (0..50).map(|i| i as f64).collect();
        assert!(require_window(&closes, 50).is_ok());
    }
}

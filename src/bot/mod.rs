// =============================================================================
// Bot Engine (C5) — per-bot tick loop
// =============================================================================
//
// Grounded on the teacher's `main.rs` per-symbol `tokio::spawn` loop
// (generalized here to per-*bot*) and `execution.rs`'s risk-gate-before-
// execute ordering. One `BotEngine` holds every shared dependency (exchange,
// candle tracker, memory store, event bus, persistence, strategy registry)
// and is cheaply `Arc`-cloned into every bot's task; `Bot` itself carries no
// dependency references, only the data model from `types`.
//
// `tick()` implements spec §4.5's eight-step order exactly: pre-tick
// refresh, risk gate, signal, decision, execute, tracking transitions,
// learn, broadcast. Steps never interleave across bots (each bot's tick
// runs to completion before Bot Manager schedules its next one) but run
// concurrently across bots, per spec §5.

pub mod position;
pub mod types;

pub use types::{Bot, BotState, Direction, ExitReason, Position, Trade, TradeSide};

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::candles::{require_window, CandleTracker, Phase};
use crate::config::FEE_RATE;
use crate::error::{ErrorKind, FleetError};
use crate::events::{EventBus, Topic};
use crate::exchange::{Candle, ExchangeAdapter, OrderSide};
use crate::memory::{outcome_for, MemoryStore};
use crate::storage::StateStore;
use crate::strategy::{self, Signal, StrategyEntry, StrategyOutput};
use position::RiskConfig;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Signed difference between execution and decision price, as a percent of
/// the decision price. Matches spec §8 scenario S1's worked example
/// (decision 2000.00, execution 2001.00 -> +0.05%) literally: this is a
/// plain relative difference, not flipped by order side.
fn slippage_pct(decision_price: f64, execution_price: f64) -> f64 {
    if decision_price == 0.0 {
        return 0.0;
    }
    (execution_price - decision_price) / decision_price * 100.0
}

/// Shared dependencies every bot's tick reads from / writes into. Carries no
/// per-bot state — exactly one `BotEngine` is constructed at startup and
/// `Arc`-shared across every bot task.
pub struct BotEngine {
    exchange: Arc<dyn ExchangeAdapter>,
    candles: Arc<CandleTracker>,
    memory: Arc<MemoryStore>,
    events: Arc<EventBus>,
    store: Arc<StateStore>,
    strategies: HashMap<&'static str, StrategyEntry>,
    risk: RiskConfig,
}

impl BotEngine {
    pub fn new(
        exchange: Arc<dyn ExchangeAdapter>,
        candles: Arc<CandleTracker>,
        memory: Arc<MemoryStore>,
        events: Arc<EventBus>,
        store: Arc<StateStore>,
        risk: RiskConfig,
    ) -> Self {
        Self {
            exchange,
            candles,
            memory,
            events,
            store,
            strategies: strategy::registry(),
            risk,
        }
    }

    pub fn candles(&self) -> &Arc<CandleTracker> {
        &self.candles
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    /// Run one tick for `bot`. Transient exchange/strategy-input errors are
    /// logged and absorbed (the tick simply does less work this cycle); an
    /// `Err` return means an internal invariant was violated and the caller
    /// (Bot Manager) must transition the bot to `Errored` and halt it.
    #[instrument(skip(self, bot), fields(bot_id = %bot.bot_id, symbol = %bot.symbol))]
    pub async fn tick(&self, bot: &mut Bot) -> Result<(), FleetError> {
        let now = now_ms();

        // Step 1 — pre-tick refresh. On failure, skip the remainder of the
        // tick entirely (existing windows are left intact by the tracker).
        if let Err(e) = self
            .candles
            .track_pre_trade(&bot.bot_id, &bot.symbol, &bot.timeframe)
            .await
        {
            warn!(error = %e, "pre-tick candle refresh failed, skipping tick");
            return Ok(());
        }

        self.refresh_incremental_windows(bot, now).await;

        let mark = match self.exchange.get_price(&bot.symbol).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "price fetch failed, skipping tick");
                return Ok(());
            }
        };

        // Step 2 — risk gate (only if a position is open).
        if let Some(position) = bot.position.as_mut() {
            if position.quantity <= 0.0 {
                return Err(FleetError::new(
                    ErrorKind::Invariant,
                    "position quantity must be positive",
                ));
            }
            if position.direction == Direction::Short && !bot.trading_mode.can_short() {
                return Err(FleetError::new(
                    ErrorKind::Invariant,
                    "short position held on a trading mode that forbids shorting",
                ));
            }

            if let Some(reason) = position::evaluate(position, mark, &self.risk) {
                self.close_position(bot, mark, now, reason, 0.0, serde_json::json!({}))
                    .await;
                return Ok(());
            }
        }

        // Step 3 — signal.
        let entry = match self.strategies.get(bot.strategy_name.as_str()) {
            Some(e) => *e,
            None => {
                warn!(strategy = %bot.strategy_name, "unknown strategy name registered on bot");
                return Ok(());
            }
        };

        let pre_window = self
            .candles
            .get_candles(&bot.bot_id, Some(Phase::PreTrade))
            .into_iter()
            .next();
        let Some(pre_window) = pre_window else {
            warn!("no pre_trade window available yet, skipping tick");
            return Ok(());
        };
        if let Err(e) = require_window(&pre_window.closes(), entry.min_window) {
            warn!(error = %e, "strategy input window too short, skipping tick");
            return Ok(());
        }
        let candles: Vec<Candle> = pre_window.candles.iter().cloned().collect();

        let output = match (entry.analyze)(&candles) {
            Ok(o) => o,
            Err(e) => {
                warn!(error = %e, "strategy evaluation failed, skipping tick");
                return Ok(());
            }
        };

        self.events.publish(
            Topic::BotAnalysis,
            now,
            serde_json::json!({
                "bot_id": bot.bot_id,
                "symbol": bot.symbol,
                "strategy": bot.strategy_name,
                "signal": output.signal,
                "confidence": output.confidence,
                "reason": output.reason,
            }),
        );

        // Step 4 — decision, Step 5 — execute.
        self.decide(bot, mark, now, &output).await;

        Ok(())
    }

    /// Force-close any open position at the current mark price, regardless
    /// of signal or risk gate. Spec §3 ("a Stopped bot's position must be
    /// flat") / §8 invariant 1 (`state=Stopped ⇒ Position=null`): the Bot
    /// Manager calls this before the final `Stopped` transition so a stopped
    /// or reaped bot never leaves capital exposed on the venue. No-op if the
    /// bot is already flat.
    pub async fn close_open_position(&self, bot: &mut Bot) {
        if bot.is_flat() {
            return;
        }
        let now = now_ms();
        let mark = match self.exchange.get_price(&bot.symbol).await {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "mark price fetch failed while force-closing position, using entry price");
                bot.position.as_ref().map(|p| p.entry_price).unwrap_or(0.0)
            }
        };
        self.close_position(bot, mark, now, ExitReason::Manual, 0.0, serde_json::json!({}))
            .await;
    }

    async fn decide(&self, bot: &mut Bot, mark: f64, now: i64, output: &StrategyOutput) {
        match output.signal {
            Signal::Hold => {}
            Signal::Buy => {
                if bot.is_flat() {
                    self.open_position(bot, Direction::Long, mark, now, output)
                        .await;
                } else if bot.position.as_ref().map(|p| p.direction) == Some(Direction::Short) {
                    self.close_position(
                        bot,
                        mark,
                        now,
                        ExitReason::Signal,
                        output.confidence,
                        output.indicators.clone(),
                    )
                    .await;
                }
            }
            Signal::Sell => {
                if let Some(direction) = bot.position.as_ref().map(|p| p.direction) {
                    if direction == Direction::Long {
                        let permitted = bot
                            .position
                            .as_ref()
                            .map(|p| position::signal_close_permitted(p, mark, &self.risk))
                            .unwrap_or(false);
                        if permitted {
                            self.close_position(
                                bot,
                                mark,
                                now,
                                ExitReason::Signal,
                                output.confidence,
                                output.indicators.clone(),
                            )
                            .await;
                        } else {
                            let unrealized = bot
                                .position
                                .as_ref()
                                .map(|p| p.unrealized_pnl_pct(mark, FEE_RATE))
                                .unwrap_or(0.0);
                            info!(
                                unrealized,
                                floor = self.risk.tp_min_pct,
                                "SIGNAL-SELL rejected: unrealized P&L below the minimum take-profit floor"
                            );
                        }
                    }
                } else if bot.trading_mode.can_short() {
                    self.open_position(bot, Direction::Short, mark, now, output)
                        .await;
                }
            }
        }
    }

    /// While a `post_trade` window is unsealed, or a `during_trade` window
    /// is open, append any newly closed candles — the spec's "background
    /// (orthogonal) task" that runs even while the bot is flat.
    async fn refresh_incremental_windows(&self, bot: &Bot, now: i64) {
        let during_open = bot.position.is_some();
        let post_open = self.candles.has_open_post_trade(&bot.bot_id);
        if !during_open && !post_open {
            return;
        }
        let fresh = match self.exchange.get_klines(&bot.symbol, &bot.timeframe, 5).await {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "incremental candle fetch failed");
                return;
            }
        };
        if during_open {
            self.candles.update_position_tracking(&bot.bot_id, &fresh, now);
        }
        if post_open {
            self.candles.update_post_trade(&bot.bot_id, &fresh, now);
        }
    }

    async fn open_position(
        &self,
        bot: &mut Bot,
        direction: Direction,
        decision_price: f64,
        decision_ts: i64,
        signal: &StrategyOutput,
    ) {
        if decision_price <= 0.0 {
            return;
        }
        let quantity = bot.allocated_amount / decision_price;
        if quantity <= 0.0 {
            warn!("computed non-positive quantity for new position, skipping");
            return;
        }
        let side = match direction {
            Direction::Long => OrderSide::Buy,
            Direction::Short => OrderSide::Sell,
        };

        let ack = match self
            .exchange
            .place_market_order(&bot.symbol, side, quantity, bot.trading_mode)
            .await
        {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "opening order placement failed");
                return;
            }
        };

        let exec_price = ack.vwap();
        let exec_ts = if ack.ts > 0 { ack.ts } else { now_ms() };
        let trade_id = Uuid::new_v4().to_string();

        let trade = Trade {
            trade_id: trade_id.clone(),
            bot_id: bot.bot_id.clone(),
            symbol: bot.symbol.clone(),
            side: trade_side_of(side),
            quantity: ack.total_qty(),
            decision_price,
            execution_price: exec_price,
            decision_timestamp: decision_ts,
            execution_timestamp: exec_ts,
            execution_delay_seconds: (exec_ts - decision_ts).max(0) as f64 / 1000.0,
            price_slippage_percent: slippage_pct(decision_price, exec_price),
            realized_pnl: None,
            exit_reason: None,
            strategy: bot.strategy_name.clone(),
            confidence: signal.confidence,
            indicators: signal.indicators.clone(),
        };

        bot.position = Some(Position::new(
            direction,
            exec_price,
            ack.total_qty(),
            exec_ts,
            decision_price,
            trade_id.clone(),
        ));

        if let Err(e) = self.store.persist_trade(&trade) {
            warn!(error = %e, "failed to persist opening trade");
        }
        self.candles
            .start_position_tracking(&bot.bot_id, &bot.symbol, &bot.timeframe, &trade_id, exec_ts);

        self.events.publish(
            Topic::TradeOpened,
            exec_ts,
            serde_json::to_value(&trade).unwrap_or_default(),
        );
    }

    async fn close_position(
        &self,
        bot: &mut Bot,
        decision_price: f64,
        decision_ts: i64,
        reason: ExitReason,
        confidence: f64,
        indicators: serde_json::Value,
    ) {
        let Some(position) = bot.position.clone() else { return };
        let side = match position.direction {
            Direction::Long => OrderSide::Sell,
            Direction::Short => OrderSide::Buy,
        };

        let ack = match self
            .exchange
            .place_market_order(&bot.symbol, side, position.quantity, bot.trading_mode)
            .await
        {
            Ok(a) => a,
            Err(e) => {
                warn!(error = %e, "closing order placement failed, position remains open");
                return;
            }
        };

        let exec_price = ack.vwap();
        let exec_ts = if ack.ts > 0 { ack.ts } else { now_ms() };
        let fee_rate = ack.effective_fee_rate().unwrap_or(FEE_RATE);
        let pnl = position.unrealized_pnl_pct(exec_price, fee_rate);
        let trade_id = Uuid::new_v4().to_string();

        let trade = Trade {
            trade_id: trade_id.clone(),
            bot_id: bot.bot_id.clone(),
            symbol: bot.symbol.clone(),
            side: trade_side_of(side),
            quantity: ack.total_qty(),
            decision_price,
            execution_price: exec_price,
            decision_timestamp: decision_ts,
            execution_timestamp: exec_ts,
            execution_delay_seconds: (exec_ts - decision_ts).max(0) as f64 / 1000.0,
            price_slippage_percent: slippage_pct(decision_price, exec_price),
            realized_pnl: Some(pnl),
            exit_reason: Some(reason.as_str().to_string()),
            strategy: bot.strategy_name.clone(),
            confidence,
            indicators,
        };

        bot.position = None;

        if let Err(e) = self.store.persist_trade(&trade) {
            warn!(error = %e, "failed to persist closing trade");
        }

        let sealed_during = self.candles.stop_position_tracking(&bot.bot_id, &trade_id, exec_ts);
        self.candles
            .start_post_trade(&bot.bot_id, &bot.symbol, &bot.timeframe, &trade_id, exec_ts);

        self.events.publish(
            Topic::TradeClosed,
            exec_ts,
            serde_json::to_value(&trade).unwrap_or_default(),
        );

        // Step 7 — learn (fire-and-forget: failures are logged by the
        // memory store itself and never propagate).
        let outcome = outcome_for(Some(reason), pnl);
        let pre_window = self
            .candles
            .get_candles(&bot.bot_id, Some(Phase::PreTrade))
            .into_iter()
            .next();
        let bundle = match (&pre_window, &sealed_during) {
            (Some(pre), Some(during)) => Some((pre, during, None)),
            _ => None,
        };
        self.memory.learn_from_trade(&trade, outcome, pnl, bundle, exec_ts);
    }
}

fn trade_side_of(side: OrderSide) -> TradeSide {
    match side {
        OrderSide::Buy => TradeSide::Buy,
        OrderSide::Sell => TradeSide::Sell,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candles::CandleTracker;
    use crate::exchange::{Fill, OrderAck, Stats24h, TradingMode};
    use crate::memory::MemoryStore;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct FakeExchange {
        klines: Vec<Candle>,
        price: f64,
        fill_price: f64,
        fail_klines: bool,
        order_calls: Mutex<u32>,
    }

    impl FakeExchange {
        fn ok(price: f64, fill_price: f64) -> Self {
            Self {
                klines: sample_candles(250, price),
                price,
                fill_price,
                fail_klines: false,
                order_calls: Mutex::new(0),
            }
        }
    }

    fn sample_candles(n: usize, base: f64) -> Vec<Candle> {
        (0..n)
            .map(|i| Candle {
                open_time: i as i64 * 60_000,
                close_time: i as i64 * 60_000 + 59_999,
                open: base,
                high: base + 1.0,
                low: base - 1.0,
                close: base,
                volume: 1.0,
                quote_volume: base,
                trades_count: 1,
                taker_buy_volume: 0.5,
                taker_buy_quote_volume: 0.5,
                is_closed: true,
            })
            .collect()
    }

    #[async_trait]
    impl ExchangeAdapter for FakeExchange {
        async fn get_price(&self, _symbol: &str) -> Result<f64, FleetError> {
            Ok(self.price)
        }
        async fn get_klines(&self, _symbol: &str, _tf: &str, limit: u32) -> Result<Vec<Candle>, FleetError> {
            if self.fail_klines {
                return Err(FleetError::new(ErrorKind::Network, "simulated outage"));
            }
            let n = self.klines.len();
            let start = n.saturating_sub(limit as usize);
            Ok(self.klines[start..].to_vec())
        }
        async fn get_balance(&self, _asset: &str, _mode: TradingMode) -> Result<f64, FleetError> {
            Ok(10_000.0)
        }
        async fn place_market_order(
            &self,
            _symbol: &str,
            side: OrderSide,
            quantity: f64,
            _mode: TradingMode,
        ) -> Result<OrderAck, FleetError> {
            *self.order_calls.lock() += 1;
            Ok(OrderAck {
                order_id: "order-1".to_string(),
                fills: vec![Fill {
                    qty: quantity,
                    quote_qty: quantity * self.fill_price,
                    price: self.fill_price,
                    fee: None,
                }],
                ts: 1_000,
            })
        }
        async fn get_24h_stats(&self, _symbol: &str) -> Result<Stats24h, FleetError> {
            Ok(Stats24h { volume_quote: 0.0, price_change_pct: 0.0 })
        }
        async fn list_tradable_symbols(&self, _quote: &str) -> Result<Vec<String>, FleetError> {
            Ok(vec![])
        }
    }

    fn engine(exchange: Arc<dyn ExchangeAdapter>) -> (BotEngine, Arc<CandleTracker>) {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let candles = Arc::new(CandleTracker::new(exchange.clone(), store.clone()));
        let memory = Arc::new(MemoryStore::new(store.clone()));
        let events = Arc::new(EventBus::new());
        let risk = RiskConfig {
            stop_loss_pct: -0.05,
            tp_min_pct: 0.02,
            tp_trail_pct: 0.03,
            fee_rate: 0.0,
        };
        (
            BotEngine::new(exchange, candles.clone(), memory, events, store, risk),
            candles,
        )
    }

    fn sample_bot() -> Bot {
        Bot::new(
            "b1".into(),
            "ETHUSDT".into(),
            "rsi".into(),
            "5m".into(),
            TradingMode::Spot,
            100.0,
            false,
            "operator".into(),
            0,
        )
    }

    #[tokio::test]
    async fn open_position_creates_trade_and_sets_position() {
        let exchange: Arc<dyn ExchangeAdapter> = Arc::new(FakeExchange::ok(2000.0, 2001.0));
        let (eng, _candles) = engine(exchange);
        let mut bot = sample_bot();
        let signal = StrategyOutput {
            signal: Signal::Buy,
            confidence: 0.7,
            reason: "test".into(),
            indicators: serde_json::json!({}),
        };
        eng.open_position(&mut bot, Direction::Long, 2000.0, 0, &signal).await;
        assert!(bot.position.is_some());
        let pos = bot.position.unwrap();
        assert_eq!(pos.direction, Direction::Long);
        assert!((pos.entry_price - 2001.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn close_position_computes_realized_pnl_and_exit_reason() {
        let exchange: Arc<dyn ExchangeAdapter> = Arc::new(FakeExchange::ok(2000.0, 2001.0));
        let (eng, _candles) = engine(exchange);
        let mut bot = sample_bot();
        bot.position = Some(Position::new(Direction::Long, 2000.0, 1.0, 0, 2000.0, "buy-1".into()));
        eng.close_position(&mut bot, 2001.0, 1000, ExitReason::TakeProfit, 0.0, serde_json::json!({}))
            .await;
        assert!(bot.position.is_none());
    }

    #[tokio::test]
    async fn tick_skips_remainder_when_pretrade_refresh_fails() {
        let mut fake = FakeExchange::ok(2000.0, 2000.0);
        fake.fail_klines = true;
        let exchange: Arc<dyn ExchangeAdapter> = Arc::new(fake);
        let (eng, _candles) = engine(exchange);
        let mut bot = sample_bot();
        let result = eng.tick(&mut bot).await;
        assert!(result.is_ok());
        assert!(bot.is_flat());
    }

    #[tokio::test]
    async fn tick_logs_and_noops_on_unknown_strategy() {
        let exchange: Arc<dyn ExchangeAdapter> = Arc::new(FakeExchange::ok(2000.0, 2000.0));
        let (eng, _candles) = engine(exchange);
        let mut bot = sample_bot();
        bot.strategy_name = "not_a_real_strategy".into();
        let result = eng.tick(&mut bot).await;
        assert!(result.is_ok());
        assert!(bot.is_flat());
    }

    #[tokio::test]
    async fn tick_detects_invariant_violation_on_short_in_spot_mode() {
        let exchange: Arc<dyn ExchangeAdapter> = Arc::new(FakeExchange::ok(2000.0, 2000.0));
        let (eng, _candles) = engine(exchange);
        let mut bot = sample_bot();
        bot.trading_mode = TradingMode::Spot;
        bot.position = Some(Position::new(Direction::Short, 2000.0, 1.0, 0, 2000.0, "buy-1".into()));
        let result = eng.tick(&mut bot).await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind, ErrorKind::Invariant);
    }

    #[test]
    fn slippage_matches_scenario_s1_worked_example() {
        let s = slippage_pct(2000.00, 2001.00);
        assert!((s - 0.05).abs() < 1e-9);
    }
}

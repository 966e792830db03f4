// =============================================================================
// Bot Manager (C6) — registry + lifecycle of bots
// =============================================================================
//
// Grounded on the teacher's `app_state.rs` (`RwLock`-guarded registry +
// `AtomicU64` version counter + snapshot-builder pattern), generalized from
// one engine's embedded state to a `HashMap<BotId, BotHandle>` registry where
// each bot runs its own tick loop as a `tokio::spawn`ed task. `list()` takes
// the read lock once and clones every entry's current `Bot` snapshot — a
// consistent point-in-time view, per spec §4.6.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::bot::{Bot, BotEngine, BotState};
use crate::error::{ErrorKind, FleetError};
use crate::events::{EventBus, Topic};
use crate::exchange::TradingMode;
use crate::storage::StateStore;

/// How long `stop()` waits for the current tick to finish before giving up
/// on a graceful stop and aborting the task outright (spec §4.6: "waits for
/// the current tick to finish, bounded by a kill deadline").
const STOP_KILL_DEADLINE: Duration = Duration::from_secs(30);

struct BotHandle {
    bot: Arc<RwLock<Bot>>,
    stop_flag: Arc<Notify>,
    stopping: Arc<std::sync::atomic::AtomicBool>,
    task: Option<JoinHandle<()>>,
}

/// Owns the `bot_id -> Bot` mapping and spawns/stops each bot's tick loop.
/// The Autonomous Controller holds only a `BotId` (identity, not a strong
/// reference) to each autonomous bot it watches, per spec §3's ownership
/// model — it calls back into `BotManager` to read status or stop one.
pub struct BotManager {
    engine: Arc<BotEngine>,
    store: Arc<StateStore>,
    events: Arc<EventBus>,
    bots: RwLock<HashMap<String, BotHandle>>,
    version: AtomicU64,
}

impl BotManager {
    pub fn new(engine: Arc<BotEngine>, store: Arc<StateStore>, events: Arc<EventBus>) -> Self {
        Self {
            engine,
            store,
            events,
            bots: RwLock::new(HashMap::new()),
            version: AtomicU64::new(0),
        }
    }

    fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::Relaxed);
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Relaxed)
    }

    /// Create a new, `Idle` bot and register it. Does not start the tick
    /// loop — call `start()` to do that.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        bot_id: String,
        symbol: String,
        strategy_name: String,
        timeframe: String,
        trading_mode: TradingMode,
        allocated_amount: f64,
        autonomous: bool,
        created_by: String,
        now: i64,
    ) -> Result<Bot, FleetError> {
        if self.bots.read().contains_key(&bot_id) {
            return Err(FleetError::new(
                ErrorKind::Invariant,
                format!("bot {bot_id} already exists"),
            ));
        }
        let bot = Bot::new(
            bot_id.clone(),
            symbol,
            strategy_name,
            timeframe,
            trading_mode,
            allocated_amount,
            autonomous,
            created_by,
            now,
        );
        if let Err(e) = self.store.persist_bot(&bot) {
            warn!(bot_id = %bot_id, error = %e, "failed to persist newly created bot");
        }

        let handle = BotHandle {
            bot: Arc::new(RwLock::new(bot.clone())),
            stop_flag: Arc::new(Notify::new()),
            stopping: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            task: None,
        };
        self.bots.write().insert(bot_id, handle);
        self.bump_version();
        Ok(bot)
    }

    /// Transition `Idle -> Running` and spawn the bot's tick loop. The
    /// tick interval is derived from the bot's timeframe string (e.g. "5m"
    /// -> 300s); unrecognized timeframes default to 60s.
    pub fn start(&self, bot_id: &str) -> Result<(), FleetError> {
        let (bot_arc, stop_flag, stopping) = {
            let guard = self.bots.read();
            let handle = guard
                .get(bot_id)
                .ok_or_else(|| FleetError::new(ErrorKind::SymbolUnsupported, "unknown bot_id"))?;
            (handle.bot.clone(), handle.stop_flag.clone(), handle.stopping.clone())
        };

        {
            let mut bot = bot_arc.write();
            if bot.state == BotState::Running {
                return Ok(());
            }
            bot.state = BotState::Running;
        }
        self.publish_state(bot_id);

        let interval_secs = timeframe_seconds(&bot_arc.read().timeframe);
        let engine = self.engine.clone();
        let store = self.store.clone();
        let events = self.events.clone();
        let bot_id_owned = bot_id.to_string();
        let bot_for_task = bot_arc.clone();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = stop_flag.notified() => break,
                }
                if stopping.load(Ordering::Relaxed) {
                    break;
                }

                let mut bot_snapshot = bot_for_task.read().clone();
                if bot_snapshot.state != BotState::Running {
                    break;
                }

                match engine.tick(&mut bot_snapshot).await {
                    Ok(()) => {
                        *bot_for_task.write() = bot_snapshot.clone();
                        if let Err(e) = store.persist_bot(&bot_snapshot) {
                            warn!(bot_id = %bot_id_owned, error = %e, "failed to persist bot after tick");
                        }
                    }
                    Err(e) => {
                        warn!(bot_id = %bot_id_owned, error = %e, "invariant violated, halting bot");
                        let mut locked = bot_for_task.write();
                        locked.state = BotState::Errored;
                        let snap = locked.clone();
                        drop(locked);
                        let _ = store.persist_bot(&snap);
                        events.publish(
                            Topic::BotState,
                            chrono::Utc::now().timestamp_millis(),
                            serde_json::json!({
                                "bot_id": bot_id_owned,
                                "state": "Errored",
                                "error": e.message,
                            }),
                        );
                        break;
                    }
                }
            }
        });

        if let Some(mut guard) = self.bots.try_write() {
            if let Some(handle) = guard.get_mut(bot_id) {
                handle.task = Some(task);
            }
        }
        Ok(())
    }

    /// Transition `Running -> Stopping`, signal the tick loop, wait up to
    /// `STOP_KILL_DEADLINE` for it to finish its current step, then mark
    /// `Stopped`. In-flight exchange writes are not cancelled (spec §5); any
    /// resulting trade is recorded by the tick before the loop observes the
    /// stop signal.
    pub async fn stop(&self, bot_id: &str) -> Result<(), FleetError> {
        let (bot_arc, stop_flag, stopping, task) = {
            let mut guard = self.bots.write();
            let handle = guard
                .get_mut(bot_id)
                .ok_or_else(|| FleetError::new(ErrorKind::SymbolUnsupported, "unknown bot_id"))?;
            (
                handle.bot.clone(),
                handle.stop_flag.clone(),
                handle.stopping.clone(),
                handle.task.take(),
            )
        };

        {
            let mut bot = bot_arc.write();
            if bot.state == BotState::Stopped {
                return Ok(());
            }
            bot.state = BotState::Stopping;
        }
        self.publish_state(bot_id);
        stopping.store(true, Ordering::Relaxed);
        stop_flag.notify_waiters();

        if let Some(task) = task {
            if tokio::time::timeout(STOP_KILL_DEADLINE, task).await.is_err() {
                warn!(bot_id, "stop kill-deadline exceeded, bot task left running");
            }
        }

        // Spec §3 / §8 invariant 1: a Stopped bot's position must be flat.
        // Force-close whatever the tick loop left open before the final
        // transition, so an operator stop or a controller reap never leaves
        // capital exposed on the venue.
        if bot_arc.read().position.is_some() {
            let mut bot_snapshot = bot_arc.read().clone();
            self.engine.close_open_position(&mut bot_snapshot).await;
            if bot_snapshot.position.is_some() {
                warn!(bot_id, "failed to force-close open position while stopping bot");
            }
            *bot_arc.write() = bot_snapshot.clone();
            if let Err(e) = self.store.persist_bot(&bot_snapshot) {
                warn!(bot_id, error = %e, "failed to persist bot after force-close on stop");
            }
        }

        {
            let mut bot = bot_arc.write();
            bot.state = BotState::Stopped;
        }
        self.publish_state(bot_id);
        if let Some(bot) = self.get(bot_id) {
            if let Err(e) = self.store.persist_bot(&bot) {
                warn!(bot_id, error = %e, "failed to persist stopped bot");
            }
        }
        Ok(())
    }

    pub fn get(&self, bot_id: &str) -> Option<Bot> {
        self.bots.read().get(bot_id).map(|h| h.bot.read().clone())
    }

    /// A consistent snapshot of every registered bot.
    pub fn list(&self) -> Vec<Bot> {
        self.bots.read().values().map(|h| h.bot.read().clone()).collect()
    }

    /// Candle windows tracked for a bot, optionally filtered to one phase —
    /// delegates to the shared `CandleTracker` the engine holds (spec §4.8's
    /// `get_bot_candles` tool).
    pub fn candles_for(&self, bot_id: &str, phase: Option<crate::candles::Phase>) -> Vec<crate::candles::CandleWindow> {
        self.engine.candles().get_candles(bot_id, phase)
    }

    /// Most recent closed trades across all bots, newest first, optionally
    /// filtered to one `exit_reason` (spec §6: `GET /trades?limit=&exit_reason=`).
    pub fn trade_history(&self, limit: usize, exit_reason: Option<&str>) -> Vec<crate::bot::Trade> {
        self.engine.store().load_trades(limit, exit_reason)
    }

    pub fn list_autonomous_running(&self) -> Vec<Bot> {
        self.list()
            .into_iter()
            .filter(|b| b.autonomous && b.state == BotState::Running)
            .collect()
    }

    fn publish_state(&self, bot_id: &str) {
        self.bump_version();
        if let Some(bot) = self.get(bot_id) {
            self.events.publish(
                Topic::BotState,
                chrono::Utc::now().timestamp_millis(),
                serde_json::json!({
                    "bot_id": bot.bot_id,
                    "state": bot.state,
                    "symbol": bot.symbol,
                }),
            );
        }
    }
}

/// Parse a timeframe string ("1m", "5m", "1h", "4h", "1d", ...) into tick
/// interval seconds. Unrecognized strings default to 60s rather than erroring
/// -- the tick loop itself still validates candle data each cycle.
fn timeframe_seconds(timeframe: &str) -> u64 {
    let (num_part, unit) = timeframe.split_at(timeframe.len().saturating_sub(1));
    let n: u64 = num_part.parse().unwrap_or(1);
    match unit {
        "m" => n * 60,
        "h" => n * 3600,
        "d" => n * 86_400,
        _ => 60,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::BotEngine;
    use crate::candles::CandleTracker;
    use crate::error::FleetError;
    use crate::bot::{Direction, Position};
    use crate::exchange::{Candle, ExchangeAdapter, Fill, OrderAck, OrderSide, Stats24h};
    use crate::memory::MemoryStore;
    use async_trait::async_trait;

    struct NullExchange;

    #[async_trait]
    impl ExchangeAdapter for NullExchange {
        async fn get_price(&self, _symbol: &str) -> Result<f64, FleetError> {
            Ok(100.0)
        }
        async fn get_klines(&self, _symbol: &str, _tf: &str, _limit: u32) -> Result<Vec<Candle>, FleetError> {
            Ok(Vec::new())
        }
        async fn get_balance(&self, _asset: &str, _mode: TradingMode) -> Result<f64, FleetError> {
            Ok(0.0)
        }
        async fn place_market_order(
            &self,
            _symbol: &str,
            _side: OrderSide,
            _quantity: f64,
            _mode: TradingMode,
        ) -> Result<OrderAck, FleetError> {
            Err(FleetError::new(ErrorKind::Network, "unused in this test"))
        }
        async fn get_24h_stats(&self, _symbol: &str) -> Result<Stats24h, FleetError> {
            Ok(Stats24h { volume_quote: 0.0, price_change_pct: 0.0 })
        }
        async fn list_tradable_symbols(&self, _quote: &str) -> Result<Vec<String>, FleetError> {
            Ok(Vec::new())
        }
    }

    /// Unlike `NullExchange`, fills every order placed against it — used by
    /// tests that need a position to actually close.
    struct ClosableExchange;

    #[async_trait]
    impl ExchangeAdapter for ClosableExchange {
        async fn get_price(&self, _symbol: &str) -> Result<f64, FleetError> {
            Ok(100.0)
        }
        async fn get_klines(&self, _symbol: &str, _tf: &str, _limit: u32) -> Result<Vec<Candle>, FleetError> {
            Ok(Vec::new())
        }
        async fn get_balance(&self, _asset: &str, _mode: TradingMode) -> Result<f64, FleetError> {
            Ok(10_000.0)
        }
        async fn place_market_order(
            &self,
            _symbol: &str,
            _side: OrderSide,
            quantity: f64,
            _mode: TradingMode,
        ) -> Result<OrderAck, FleetError> {
            Ok(OrderAck {
                order_id: "order-1".to_string(),
                fills: vec![Fill {
                    qty: quantity,
                    quote_qty: quantity * 100.0,
                    price: 100.0,
                    fee: None,
                }],
                ts: 1_000,
            })
        }
        async fn get_24h_stats(&self, _symbol: &str) -> Result<Stats24h, FleetError> {
            Ok(Stats24h { volume_quote: 0.0, price_change_pct: 0.0 })
        }
        async fn list_tradable_symbols(&self, _quote: &str) -> Result<Vec<String>, FleetError> {
            Ok(Vec::new())
        }
    }

    fn manager_with(exchange: Arc<dyn ExchangeAdapter>) -> BotManager {
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let candles = Arc::new(CandleTracker::new(exchange.clone(), store.clone()));
        let memory = Arc::new(MemoryStore::new(store.clone()));
        let events = Arc::new(EventBus::new());
        let risk = crate::bot::position::RiskConfig {
            stop_loss_pct: -0.05,
            tp_min_pct: 0.02,
            tp_trail_pct: 0.03,
            fee_rate: 0.0,
        };
        let engine = Arc::new(BotEngine::new(exchange, candles, memory, events.clone(), store.clone(), risk));
        BotManager::new(engine, store, events)
    }

    fn manager() -> BotManager {
        manager_with(Arc::new(NullExchange))
    }

    #[test]
    fn timeframe_parsing() {
        assert_eq!(timeframe_seconds("5m"), 300);
        assert_eq!(timeframe_seconds("1h"), 3600);
        assert_eq!(timeframe_seconds("4h"), 14400);
        assert_eq!(timeframe_seconds("weird"), 60);
    }

    #[test]
    fn create_rejects_duplicate_bot_id() {
        let mgr = manager();
        mgr.create(
            "b1".into(), "ETHUSDT".into(), "rsi".into(), "5m".into(),
            TradingMode::Spot, 100.0, false, "operator".into(), 0,
        ).unwrap();
        let err = mgr.create(
            "b1".into(), "ETHUSDT".into(), "rsi".into(), "5m".into(),
            TradingMode::Spot, 100.0, false, "operator".into(), 0,
        ).unwrap_err();
        assert_eq!(err.kind, ErrorKind::Invariant);
    }

    #[test]
    fn list_returns_a_consistent_snapshot() {
        let mgr = manager();
        mgr.create(
            "b1".into(), "ETHUSDT".into(), "rsi".into(), "5m".into(),
            TradingMode::Spot, 100.0, false, "operator".into(), 0,
        ).unwrap();
        mgr.create(
            "b2".into(), "BTCUSDT".into(), "macd".into(), "1h".into(),
            TradingMode::Spot, 200.0, true, "AutonomousController".into(), 0,
        ).unwrap();
        let snapshot = mgr.list();
        assert_eq!(snapshot.len(), 2);
    }

    #[tokio::test]
    async fn start_then_stop_transitions_through_expected_states() {
        let mgr = manager();
        mgr.create(
            "b1".into(), "ETHUSDT".into(), "rsi".into(), "5m".into(),
            TradingMode::Spot, 100.0, false, "operator".into(), 0,
        ).unwrap();
        mgr.start("b1").unwrap();
        assert_eq!(mgr.get("b1").unwrap().state, BotState::Running);
        mgr.stop("b1").await.unwrap();
        assert_eq!(mgr.get("b1").unwrap().state, BotState::Stopped);
    }

    #[test]
    fn list_autonomous_running_filters_correctly() {
        let mgr = manager();
        mgr.create(
            "b1".into(), "ETHUSDT".into(), "rsi".into(), "5m".into(),
            TradingMode::Spot, 100.0, false, "operator".into(), 0,
        ).unwrap();
        mgr.create(
            "b2".into(), "BTCUSDT".into(), "macd".into(), "1h".into(),
            TradingMode::Spot, 200.0, true, "AutonomousController".into(), 0,
        ).unwrap();
        mgr.start("b2").unwrap();
        let autonomous = mgr.list_autonomous_running();
        assert_eq!(autonomous.len(), 1);
        assert_eq!(autonomous[0].bot_id, "b2");
    }

    #[tokio::test]
    async fn stop_force_closes_an_open_position_before_transitioning_to_stopped() {
        let mgr = manager_with(Arc::new(ClosableExchange));
        mgr.create(
            "b1".into(), "ETHUSDT".into(), "rsi".into(), "5m".into(),
            TradingMode::Spot, 100.0, false, "operator".into(), 0,
        ).unwrap();
        {
            let guard = mgr.bots.read();
            let handle = guard.get("b1").unwrap();
            handle.bot.write().position =
                Some(Position::new(Direction::Long, 100.0, 1.0, 0, 100.0, "buy-1".into()));
        }
        mgr.start("b1").unwrap();
        assert!(mgr.get("b1").unwrap().position.is_some());

        mgr.stop("b1").await.unwrap();

        let bot = mgr.get("b1").unwrap();
        assert_eq!(bot.state, BotState::Stopped);
        assert!(bot.position.is_none());
    }
}

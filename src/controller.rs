// =============================================================================
// Autonomous Controller (C7) — cluster-wide scan / score / spawn / reap loop
// =============================================================================
//
// Grounded on the teacher's `main.rs` reconciliation loop (periodic,
// precondition-skip on account-mode/connectivity) and its regime-detection
// loop (minimum-data precondition before acting). The single-flight guard
// uses `parking_lot::Mutex<()>::try_lock` — the teacher's preferred sync
// primitive throughout `app_state.rs` and `position_engine.rs` — so an
// overrunning cycle is simply skipped by the next tick rather than queued.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::candles::require_window;
use crate::config::Config;
use crate::events::{EventBus, Topic};
use crate::exchange::{Candle, ExchangeAdapter, TradingMode};
use crate::manager::BotManager;
use crate::memory::{MemoryStore, Recommendation};
use crate::strategy;

/// How many top-by-volume candidates the scan step carries into scoring
/// (spec §4.7 step 2, default K = 50).
const SCAN_TOP_K: usize = 50;
/// Evaluation timeframes used when scoring a candidate symbol.
const SCORE_TIMEFRAMES: [&str; 4] = ["5m", "15m", "1h", "4h"];
/// Relaxed floor applied to `MIN_SCORE` when nothing clears it but there is
/// unused autonomous capacity (spec §4.7 step 4).
const MIN_SCORE_FALLBACK: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub symbol: String,
    pub strategy: String,
    pub confidence: f64,
    pub score: f64,
}

pub struct AutonomousController {
    manager: Arc<BotManager>,
    exchange: Arc<dyn ExchangeAdapter>,
    memory: Arc<MemoryStore>,
    events: Arc<EventBus>,
    config: Config,
    single_flight: Mutex<()>,
    cycle_count: AtomicU64,
}

impl AutonomousController {
    pub fn new(
        manager: Arc<BotManager>,
        exchange: Arc<dyn ExchangeAdapter>,
        memory: Arc<MemoryStore>,
        events: Arc<EventBus>,
        config: Config,
    ) -> Self {
        Self {
            manager,
            exchange,
            memory,
            events,
            config,
            single_flight: Mutex::new(()),
            cycle_count: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Spawn the periodic scan/score/spawn/reap loop. Runs until the process
    /// exits; cancellation is cooperative at cycle boundaries (spec §5).
    pub fn spawn_loop(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let interval_secs = self.config.analysis_interval_sec;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(interval_secs));
            loop {
                interval.tick().await;
                self.clone().run_cycle_guarded().await;
            }
        })
    }

    /// Run one cycle if no other cycle is already in flight; otherwise skip
    /// (spec §4.7: "idempotent with respect to concurrent cycles via a
    /// single-flight lock").
    async fn run_cycle_guarded(self: Arc<Self>) {
        let Some(_guard) = self.single_flight.try_lock() else {
            warn!("autonomous controller cycle already in flight, skipping");
            return;
        };
        self.run_cycle().await;
    }

    async fn run_cycle(&self) {
        let now = chrono::Utc::now().timestamp_millis();
        let cycle = self.cycle_count.fetch_add(1, Ordering::Relaxed) + 1;

        // Step 1 — precondition: skip the cycle if the exchange is down.
        let symbols = match self.exchange.list_tradable_symbols("USDT").await {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "autonomous controller: exchange unavailable, skipping cycle");
                return;
            }
        };

        let running_autonomous = self.manager.list_autonomous_running();
        let owned_symbols: std::collections::HashSet<String> =
            running_autonomous.iter().map(|b| b.symbol.clone()).collect();

        // Step 2 — scan: exclude already-owned symbols, rank by 24h volume.
        let mut candidates = Vec::new();
        for symbol in symbols.into_iter().filter(|s| !owned_symbols.contains(s)) {
            match self.exchange.get_24h_stats(&symbol).await {
                Ok(stats) => candidates.push((symbol, stats)),
                Err(e) => {
                    warn!(symbol = %symbol, error = %e, "24h stats fetch failed, skipping candidate");
                }
            }
        }
        candidates.sort_by(|a, b| b.1.volume_quote.partial_cmp(&a.1.volume_quote).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(SCAN_TOP_K);

        // Step 3 — score each candidate.
        let mut scored = Vec::new();
        for (symbol, stats) in &candidates {
            if let Some(candidate) = self.score_candidate(symbol, stats).await {
                scored.push(candidate);
            }
        }
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));

        // Step 4 — filter: MIN_SCORE, falling back to the relaxed floor if
        // nothing passes and there is unused capacity.
        let cap = self.config.max_autonomous;
        let autonomous_running = running_autonomous.len();
        let mut passing: Vec<&ScoredCandidate> =
            scored.iter().filter(|c| c.score >= self.config.min_score).collect();
        if passing.is_empty() && autonomous_running < cap {
            passing = scored.iter().filter(|c| c.score >= MIN_SCORE_FALLBACK).collect();
        }

        // Step 5 — capacity.
        let available_slots = cap.saturating_sub(autonomous_running);

        self.events.publish(
            Topic::ControllerCycle,
            now,
            serde_json::json!({
                "cycle": cycle,
                "candidates_scanned": candidates.len(),
                "candidates_passing": passing.len(),
                "autonomous_running": autonomous_running,
                "cap": cap,
            }),
        );

        if available_slots == 0 {
            info!(cap, "autonomous controller: at capacity, no spawns this cycle");
        } else {
            // Step 6 — budget per new bot.
            let balance = self.exchange.get_balance("USDT", TradingMode::Spot).await.unwrap_or(0.0);
            let avg_running = if running_autonomous.is_empty() {
                self.config.default_amount
            } else {
                running_autonomous.iter().map(|b| b.allocated_amount).sum::<f64>()
                    / running_autonomous.len() as f64
            };
            let cap_pct = 0.4 * balance;
            let budget = self.config.min_budget.max(avg_running.min(cap_pct));

            // Step 7 — spawn the top N candidates that fit available slots.
            for candidate in passing.into_iter().take(available_slots) {
                self.spawn_bot(candidate, budget, balance).await;
            }
        }

        // Step 8 — reap poorly-performing autonomous bots.
        self.reap_cycle(now).await;
    }

    async fn score_candidate(&self, symbol: &str, stats: &crate::exchange::Stats24h) -> Option<ScoredCandidate> {
        let mut best: Option<(&'static str, f64)> = None;
        for timeframe in SCORE_TIMEFRAMES {
            let candles = match self.exchange.get_klines(symbol, timeframe, 250).await {
                Ok(c) => c,
                Err(_) => continue,
            };
            let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
            for (name, entry) in strategy::registry() {
                if require_window(&closes, entry.min_window).is_err() {
                    continue;
                }
                if let Ok(output) = (entry.analyze)(&candles) {
                    if output.signal != strategy::Signal::Hold {
                        let better = best.map(|(_, c)| output.confidence > c).unwrap_or(true);
                        if better {
                            best = Some((name, output.confidence));
                        }
                    }
                }
            }
        }
        let (best_strategy, best_confidence) = best?;

        let volatility_score = (stats.volume_quote.abs().ln().max(0.0) / 25.0).clamp(0.0, 1.0);
        let trend_score = (stats.price_change_pct.abs() / 10.0).clamp(0.0, 1.0);
        // News relevance is an external collaborator (spec §4.7 step 3);
        // default to 0 when unavailable, as no news feed is wired in core.
        let news_score = 0.0;

        let score = 0.4 * best_confidence + 0.2 * trend_score + 0.2 * volatility_score + 0.2 * news_score;

        Some(ScoredCandidate {
            symbol: symbol.to_string(),
            strategy: best_strategy.to_string(),
            confidence: best_confidence,
            score,
        })
    }

    async fn spawn_bot(&self, candidate: &ScoredCandidate, budget: f64, available_capital: f64) {
        let bot_id = format!("auto-{}", Uuid::new_v4());
        let now = chrono::Utc::now().timestamp_millis();
        match self.manager.create(
            bot_id.clone(),
            candidate.symbol.clone(),
            candidate.strategy.clone(),
            "5m".to_string(),
            TradingMode::Spot,
            budget,
            true,
            "AutonomousController".to_string(),
            now,
        ) {
            Ok(_) => {
                if let Err(e) = self.manager.start(&bot_id) {
                    warn!(bot_id, error = %e, "failed to start newly spawned autonomous bot");
                    return;
                }
                self.memory.store(
                    "AutonomousController",
                    "analysis",
                    serde_json::json!({
                        "bot_id": bot_id,
                        "symbol": candidate.symbol,
                        "strategy": candidate.strategy,
                        "score": candidate.score,
                        "budget": budget,
                        "available_capital": available_capital,
                    }),
                    serde_json::json!({}),
                    now,
                );
                info!(
                    bot_id, symbol = %candidate.symbol, strategy = %candidate.strategy,
                    score = candidate.score, budget, "autonomous controller spawned a new bot"
                );
            }
            Err(e) => warn!(symbol = %candidate.symbol, error = %e, "failed to create autonomous bot"),
        }
    }

    async fn reap_cycle(&self, now: i64) {
        let reap_age_ms = self.config.reap_age_hours * 3_600_000;
        for bot in self.manager.list_autonomous_running() {
            if now - bot.created_at < reap_age_ms {
                continue;
            }
            let insight = self.memory.pattern_insights(&bot.symbol, &bot.strategy_name, 90, now);
            if insight.recommendation == Recommendation::Negative {
                info!(
                    bot_id = %bot.bot_id, symbol = %bot.symbol, strategy = %bot.strategy_name,
                    success_rate = insight.success_rate, avg_pnl = insight.avg_pnl,
                    "reaping autonomous bot with persistent negative pattern insight"
                );
                if let Err(e) = self.manager.stop(&bot.bot_id).await {
                    warn!(bot_id = %bot.bot_id, error = %e, "failed to stop reaped bot");
                }
            }
        }
    }

    /// Single-shot scoring invocation used by the `analyze_optimal_coins`
    /// tool (C8) — runs scan + score without the spawn/reap side effects.
    pub async fn analyze_candidates(
        &self,
        max_coins: usize,
        min_score: f64,
        exclude: &[String],
    ) -> Result<Vec<ScoredCandidate>, crate::error::FleetError> {
        let symbols = self.exchange.list_tradable_symbols("USDT").await?;
        let mut with_stats = Vec::new();
        for symbol in symbols.into_iter().filter(|s| !exclude.contains(s)) {
            if let Ok(stats) = self.exchange.get_24h_stats(&symbol).await {
                with_stats.push((symbol, stats));
            }
        }
        with_stats.sort_by(|a, b| b.1.volume_quote.partial_cmp(&a.1.volume_quote).unwrap_or(std::cmp::Ordering::Equal));
        with_stats.truncate(SCAN_TOP_K.max(max_coins));

        let mut scored = Vec::new();
        for (symbol, stats) in with_stats.into_iter().take(max_coins) {
            if let Some(c) = self.score_candidate(&symbol, &stats).await {
                if c.score >= min_score {
                    scored.push(c);
                }
            }
        }
        scored.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        Ok(scored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FleetError;
    use crate::exchange::{Fill, OrderAck, OrderSide, Stats24h};
    use crate::storage::StateStore;
    use async_trait::async_trait;

    struct FakeExchange;

    #[async_trait]
    impl ExchangeAdapter for FakeExchange {
        async fn get_price(&self, _symbol: &str) -> Result<f64, FleetError> {
            Ok(100.0)
        }
        async fn get_klines(&self, _symbol: &str, _tf: &str, _limit: u32) -> Result<Vec<Candle>, FleetError> {
            Ok((0..250)
                .map(|i| Candle {
                    open_time: i * 60_000,
                    close_time: i * 60_000 + 59_999,
                    open: 100.0,
                    high: 101.0,
                    low: 99.0,
                    close: 100.0 + (i as f64 * 0.05).sin() * 3.0,
                    volume: 10.0,
                    quote_volume: 1000.0,
                    trades_count: 5,
                    taker_buy_volume: 5.0,
                    taker_buy_quote_volume: 500.0,
                    is_closed: true,
                })
                .collect())
        }
        async fn get_balance(&self, _asset: &str, _mode: TradingMode) -> Result<f64, FleetError> {
            Ok(1000.0)
        }
        async fn place_market_order(
            &self,
            _symbol: &str,
            _side: OrderSide,
            _quantity: f64,
            _mode: TradingMode,
        ) -> Result<OrderAck, FleetError> {
            Ok(OrderAck { order_id: "1".into(), fills: vec![Fill { qty: 1.0, quote_qty: 100.0, price: 100.0, fee: None }], ts: 0 })
        }
        async fn get_24h_stats(&self, _symbol: &str) -> Result<Stats24h, FleetError> {
            Ok(Stats24h { volume_quote: 1_000_000.0, price_change_pct: 5.0 })
        }
        async fn list_tradable_symbols(&self, _quote: &str) -> Result<Vec<String>, FleetError> {
            Ok(vec!["ETHUSDT".into(), "SOLUSDT".into(), "DOGEUSDT".into()])
        }
    }

    fn controller(config: Config) -> AutonomousController {
        let exchange: Arc<dyn ExchangeAdapter> = Arc::new(FakeExchange);
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let candles = Arc::new(crate::candles::CandleTracker::new(exchange.clone(), store.clone()));
        let memory = Arc::new(MemoryStore::new(store.clone()));
        let events = Arc::new(EventBus::new());
        let risk = crate::bot::position::RiskConfig {
            stop_loss_pct: -0.05, tp_min_pct: 0.02, tp_trail_pct: 0.03, fee_rate: 0.0,
        };
        let engine = Arc::new(crate::bot::BotEngine::new(exchange.clone(), candles, memory.clone(), events.clone(), store.clone(), risk));
        let manager = Arc::new(BotManager::new(engine, store, events.clone()));
        AutonomousController::new(manager, exchange, memory, events, config)
    }

    fn test_config() -> Config {
        Config {
            exchange_api_key: String::new(),
            exchange_api_secret: String::new(),
            exchange_testnet: true,
            storage_url: ":memory:".into(),
            default_strategy: "rsi".into(),
            default_symbol: "BTCUSDT".into(),
            default_amount: 100.0,
            max_position_size: 1000.0,
            stop_loss_pct: -0.05,
            tp_min_pct: 0.02,
            tp_trail_pct: 0.03,
            analysis_interval_sec: 600,
            max_autonomous: 2,
            min_score: 0.3,
            min_budget: 10.0,
            reap_age_hours: 24,
            cors_origins: vec![],
            bind_addr: "0.0.0.0:3001".into(),
            admin_token: "test".into(),
        }
    }

    #[tokio::test]
    async fn analyze_candidates_respects_min_score_and_max_coins() {
        let ctrl = controller(test_config());
        let result = ctrl.analyze_candidates(2, 0.0, &[]).await.unwrap();
        assert!(result.len() <= 2);
    }

    #[tokio::test]
    async fn run_cycle_spawns_up_to_capacity() {
        let ctrl = controller(test_config());
        ctrl.run_cycle().await;
        let running = ctrl.manager.list_autonomous_running();
        assert!(running.len() <= 2);
    }

    #[tokio::test]
    async fn second_cycle_does_not_exceed_cap() {
        let ctrl = controller(test_config());
        ctrl.run_cycle().await;
        ctrl.run_cycle().await;
        let running = ctrl.manager.list_autonomous_running();
        assert!(running.len() <= ctrl.config.max_autonomous);
    }
}

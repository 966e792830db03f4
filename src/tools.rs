// =============================================================================
// Tool Surface (C8) — flat, versioned namespace of named operations
// =============================================================================
//
// A fixed registry of typed functions external LLM agents (and the HTTP
// façade's `/mcp/tools` routes) invoke by stable name. Grounded on
// `decision_envelope.rs`'s two-path `allow()`/`blocked()` constructor idiom,
// generalized here to every tool's `{ok: true, result}` / `{ok: false,
// error_kind, message}` response shape (spec §4.8) — tools never raise to
// callers, they translate the §7 error taxonomy into that envelope.
//
// Dynamic LLM tooling -> static tool surface (spec §9): the source treats
// "agent tools" as named callables loaded into an LLM prompt; here the
// registry is a fixed, compile-time set of names. An unregistered name
// yields `ErrUnknownTool` rather than a lookup into prompt-supplied code.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::candles::Phase;
use crate::controller::AutonomousController;
use crate::error::{ErrorKind, FleetError};
use crate::exchange::{ExchangeAdapter, TradingMode};
use crate::manager::BotManager;
use crate::memory::MemoryStore;

/// `{ok: true, result}` or `{ok: false, error_kind, message}` — the one
/// shape every tool call returns (spec §4.8, §6's tool-surface call
/// protocol).
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ToolResponse {
    Ok { ok: bool, result: Value },
    Err { ok: bool, error_kind: ErrorKind, message: String },
}

impl ToolResponse {
    fn ok(result: Value) -> Self {
        ToolResponse::Ok { ok: true, result }
    }

    fn err(error: FleetError) -> Self {
        ToolResponse::Err { ok: false, error_kind: error.kind, message: error.message }
    }
}

impl From<Result<Value, FleetError>> for ToolResponse {
    fn from(r: Result<Value, FleetError>) -> Self {
        match r {
            Ok(v) => ToolResponse::ok(v),
            Err(e) => ToolResponse::err(e),
        }
    }
}

fn arg_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, FleetError> {
    args.get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| FleetError::new(ErrorKind::ToolArgs, format!("missing or non-string argument '{key}'")))
}

fn arg_f64(args: &Value, key: &str) -> Result<f64, FleetError> {
    args.get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| FleetError::new(ErrorKind::ToolArgs, format!("missing or non-numeric argument '{key}'")))
}

fn arg_f64_opt(args: &Value, key: &str, default: f64) -> f64 {
    args.get(key).and_then(|v| v.as_f64()).unwrap_or(default)
}

fn arg_u64_opt(args: &Value, key: &str, default: u64) -> u64 {
    args.get(key).and_then(|v| v.as_u64()).unwrap_or(default)
}

fn arg_mode(args: &Value, key: &str, default: TradingMode) -> Result<TradingMode, FleetError> {
    match args.get(key).and_then(|v| v.as_str()) {
        None => Ok(default),
        Some("SPOT") | Some("spot") => Ok(TradingMode::Spot),
        Some("MARGIN") | Some("margin") => Ok(TradingMode::Margin),
        Some("FUTURES") | Some("futures") => Ok(TradingMode::Futures),
        Some(other) => Err(FleetError::new(ErrorKind::ToolArgs, format!("unknown trading_mode '{other}'"))),
    }
}

/// Authorization scope required to invoke a mutating tool (spec §4.8:
/// "`execute_order` ... must be gated by an authorization scope"). The HTTP
/// façade supplies this from the validated bearer token; callers without it
/// get `ErrAuth` rather than a silent no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolScope {
    ReadOnly,
    Trade,
}

pub struct ToolSurface {
    exchange: Arc<dyn ExchangeAdapter>,
    manager: Arc<BotManager>,
    memory: Arc<MemoryStore>,
    controller: Arc<AutonomousController>,
}

impl ToolSurface {
    pub fn new(
        exchange: Arc<dyn ExchangeAdapter>,
        manager: Arc<BotManager>,
        memory: Arc<MemoryStore>,
        controller: Arc<AutonomousController>,
    ) -> Self {
        Self { exchange, manager, memory, controller }
    }

    /// Invoke a tool by name with `{parameters: {...}}`-shaped arguments.
    /// Unknown names yield `ErrUnknownTool`; translated argument/internal
    /// errors never panic or propagate past this boundary (spec §4.8).
    pub async fn invoke(&self, name: &str, scope: ToolScope, args: &Value) -> ToolResponse {
        let result = match name {
            "get_current_price" => self.get_current_price(args).await,
            "get_market_data" => self.get_market_data(args).await,
            "get_account_balance" => self.get_account_balance(args).await,
            "execute_order" => self.execute_order(scope, args).await,
            "get_bot_status" => self.get_bot_status(args),
            "list_bots" => self.list_bots(),
            "get_bot_candles" => self.get_bot_candles(args),
            "get_trade_history" => self.get_trade_history(args),
            "analyze_optimal_coins" => self.analyze_optimal_coins(args).await,
            "start_autonomous_bot" => self.start_autonomous_bot(scope, args).await,
            "get_autonomous_bots_status" => self.get_autonomous_bots_status(),
            "pattern_insights" => self.pattern_insights(args),
            _ => Err(FleetError::new(ErrorKind::UnknownTool, format!("no such tool: {name}"))),
        };
        result.into()
    }

    pub fn names() -> &'static [&'static str] {
        &[
            "get_current_price",
            "get_market_data",
            "get_account_balance",
            "execute_order",
            "get_bot_status",
            "list_bots",
            "get_bot_candles",
            "get_trade_history",
            "analyze_optimal_coins",
            "start_autonomous_bot",
            "get_autonomous_bots_status",
            "pattern_insights",
        ]
    }

    async fn get_current_price(&self, args: &Value) -> Result<Value, FleetError> {
        let symbol = arg_str(args, "symbol")?;
        let price = self.exchange.get_price(symbol).await?;
        Ok(serde_json::json!({ "symbol": symbol, "price": price }))
    }

    async fn get_market_data(&self, args: &Value) -> Result<Value, FleetError> {
        let symbol = arg_str(args, "symbol")?;
        let timeframe = args.get("timeframe").and_then(|v| v.as_str()).unwrap_or("5m");
        let limit = arg_u64_opt(args, "limit", 100).min(1000) as u32;
        let candles = self.exchange.get_klines(symbol, timeframe, limit).await?;
        Ok(serde_json::to_value(candles).unwrap_or_default())
    }

    async fn get_account_balance(&self, args: &Value) -> Result<Value, FleetError> {
        let asset = arg_str(args, "asset")?;
        let mode = arg_mode(args, "mode", TradingMode::Spot)?;
        let balance = self.exchange.get_balance(asset, mode).await?;
        Ok(serde_json::json!({ "asset": asset, "mode": mode.to_string(), "balance": balance }))
    }

    /// Placing an order directly (outside a bot's own tick loop) requires
    /// `ToolScope::Trade` — the façade grants this only to an authenticated
    /// caller, per spec §4.8's "gated by an authorization scope".
    async fn execute_order(&self, scope: ToolScope, args: &Value) -> Result<Value, FleetError> {
        if scope != ToolScope::Trade {
            return Err(FleetError::new(ErrorKind::Auth, "execute_order requires trade scope"));
        }
        let symbol = arg_str(args, "symbol")?;
        let side_str = arg_str(args, "side")?;
        let side = match side_str.to_uppercase().as_str() {
            "BUY" => crate::exchange::OrderSide::Buy,
            "SELL" => crate::exchange::OrderSide::Sell,
            _ => return Err(FleetError::new(ErrorKind::ToolArgs, "side must be BUY or SELL")),
        };
        let quantity = arg_f64(args, "quantity")?;
        let mode = arg_mode(args, "mode", TradingMode::Spot)?;
        let ack = self.exchange.place_market_order(symbol, side, quantity, mode).await?;
        Ok(serde_json::to_value(ack).unwrap_or_default())
    }

    fn get_bot_status(&self, args: &Value) -> Result<Value, FleetError> {
        match args.get("bot_id").and_then(|v| v.as_str()) {
            Some(bot_id) => {
                let bot = self.manager.get(bot_id)
                    .ok_or_else(|| FleetError::new(ErrorKind::SymbolUnsupported, "unknown bot_id"))?;
                Ok(serde_json::to_value(bot).unwrap_or_default())
            }
            None => self.list_bots(),
        }
    }

    fn list_bots(&self) -> Result<Value, FleetError> {
        Ok(serde_json::to_value(self.manager.list()).unwrap_or_default())
    }

    fn get_bot_candles(&self, args: &Value) -> Result<Value, FleetError> {
        let bot_id = arg_str(args, "bot_id")?;
        let phase = match args.get("phase").and_then(|v| v.as_str()) {
            None | Some("all") => None,
            Some("pre_trade") => Some(Phase::PreTrade),
            Some("during_trade") => Some(Phase::DuringTrade),
            Some("post_trade") => Some(Phase::PostTrade),
            Some(other) => return Err(FleetError::new(ErrorKind::ToolArgs, format!("unknown phase '{other}'"))),
        };
        let windows = self.manager.candles_for(bot_id, phase);
        Ok(serde_json::to_value(windows).unwrap_or_default())
    }

    fn get_trade_history(&self, args: &Value) -> Result<Value, FleetError> {
        let limit = arg_u64_opt(args, "limit", 50) as usize;
        let exit_reason = args.get("exit_reason").and_then(|v| v.as_str());
        let trades = self.manager.trade_history(limit, exit_reason);
        Ok(serde_json::to_value(trades).unwrap_or_default())
    }

    async fn analyze_optimal_coins(&self, args: &Value) -> Result<Value, FleetError> {
        let max_coins = arg_u64_opt(args, "max_coins", 20) as usize;
        let min_score = arg_f64_opt(args, "min_score", 0.3);
        let exclude: Vec<String> = args
            .get("exclude")
            .and_then(|v| v.as_array())
            .map(|a| a.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default();
        let candidates = self.controller.analyze_candidates(max_coins, min_score, &exclude).await?;
        Ok(serde_json::json!({ "candidates": candidates.iter().map(|c| serde_json::json!({
            "symbol": c.symbol, "strategy": c.strategy, "confidence": c.confidence, "score": c.score,
        })).collect::<Vec<_>>() }))
    }

    async fn start_autonomous_bot(&self, scope: ToolScope, args: &Value) -> Result<Value, FleetError> {
        if scope != ToolScope::Trade {
            return Err(FleetError::new(ErrorKind::Auth, "start_autonomous_bot requires trade scope"));
        }
        let symbol = arg_str(args, "symbol")?.to_string();
        let strategy = arg_str(args, "strategy")?.to_string();
        let timeframe = args.get("timeframe").and_then(|v| v.as_str()).unwrap_or("5m").to_string();
        let mode = arg_mode(args, "mode", TradingMode::Spot)?;

        let running = self.manager.list_autonomous_running();
        let cap = self.controller.config().max_autonomous;
        if running.len() >= cap {
            return Err(FleetError::new(ErrorKind::Invariant, "MAX_AUTONOMOUS capacity reached"));
        }
        let balance = self.exchange.get_balance("USDT", TradingMode::Spot).await.unwrap_or(0.0);
        let avg_running = if running.is_empty() {
            self.controller.config().default_amount
        } else {
            running.iter().map(|b| b.allocated_amount).sum::<f64>() / running.len() as f64
        };
        let budget = self.controller.config().min_budget.max(avg_running.min(0.4 * balance));

        let bot_id = format!("tool-{}", uuid::Uuid::new_v4());
        let now = chrono::Utc::now().timestamp_millis();
        let bot = self.manager.create(bot_id.clone(), symbol, strategy, timeframe, mode, budget, true, "ToolSurface".to_string(), now)?;
        self.manager.start(&bot_id)?;
        Ok(serde_json::to_value(bot).unwrap_or_default())
    }

    fn get_autonomous_bots_status(&self) -> Result<Value, FleetError> {
        Ok(serde_json::to_value(self.manager.list_autonomous_running()).unwrap_or_default())
    }

    fn pattern_insights(&self, args: &Value) -> Result<Value, FleetError> {
        let symbol = arg_str(args, "symbol")?;
        let strategy = arg_str(args, "strategy")?;
        let now = chrono::Utc::now().timestamp_millis();
        let insight = self.memory.pattern_insights(symbol, strategy, 90, now);
        Ok(serde_json::to_value(insight).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::StateStore;
    use crate::error::FleetError as FE;
    use crate::exchange::{Candle, Fill, OrderAck, Stats24h};
    use async_trait::async_trait;

    struct FakeExchange;

    #[async_trait]
    impl ExchangeAdapter for FakeExchange {
        async fn get_price(&self, _symbol: &str) -> Result<f64, FE> { Ok(42.0) }
        async fn get_klines(&self, _s: &str, _t: &str, _l: u32) -> Result<Vec<Candle>, FE> { Ok(vec![]) }
        async fn get_balance(&self, _a: &str, _m: TradingMode) -> Result<f64, FE> { Ok(500.0) }
        async fn place_market_order(&self, _s: &str, _side: crate::exchange::OrderSide, q: f64, _m: TradingMode) -> Result<OrderAck, FE> {
            Ok(OrderAck { order_id: "1".into(), fills: vec![Fill { qty: q, quote_qty: q * 10.0, price: 10.0, fee: None }], ts: 0 })
        }
        async fn get_24h_stats(&self, _s: &str) -> Result<Stats24h, FE> { Ok(Stats24h { volume_quote: 0.0, price_change_pct: 0.0 }) }
        async fn list_tradable_symbols(&self, _q: &str) -> Result<Vec<String>, FE> { Ok(vec![]) }
    }

    fn surface() -> ToolSurface {
        let exchange: Arc<dyn ExchangeAdapter> = Arc::new(FakeExchange);
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let candles = Arc::new(crate::candles::CandleTracker::new(exchange.clone(), store.clone()));
        let memory = Arc::new(MemoryStore::new(store.clone()));
        let events = Arc::new(crate::events::EventBus::new());
        let risk = crate::bot::position::RiskConfig { stop_loss_pct: -0.05, tp_min_pct: 0.02, tp_trail_pct: 0.03, fee_rate: 0.0 };
        let engine = Arc::new(crate::bot::BotEngine::new(exchange.clone(), candles, memory.clone(), events.clone(), store.clone(), risk));
        let manager = Arc::new(BotManager::new(engine, store, events.clone()));
        let config = crate::config::Config {
            exchange_api_key: String::new(), exchange_api_secret: String::new(), exchange_testnet: true,
            storage_url: ":memory:".into(), default_strategy: "rsi".into(), default_symbol: "BTCUSDT".into(),
            default_amount: 100.0, max_position_size: 1000.0, stop_loss_pct: -0.05, tp_min_pct: 0.02,
            tp_trail_pct: 0.03, analysis_interval_sec: 600, max_autonomous: 2, min_score: 0.3, min_budget: 10.0,
            reap_age_hours: 24, cors_origins: vec![], bind_addr: "0.0.0.0:3001".into(), admin_token: "x".into(),
        };
        let controller = Arc::new(AutonomousController::new(manager.clone(), exchange.clone(), memory.clone(), events, config));
        ToolSurface::new(exchange, manager, memory, controller)
    }

    #[tokio::test]
    async fn unknown_tool_yields_unknown_tool_error() {
        let s = surface();
        let resp = s.invoke("not_a_tool", ToolScope::ReadOnly, &serde_json::json!({})).await;
        match resp {
            ToolResponse::Err { error_kind, .. } => assert_eq!(error_kind, ErrorKind::UnknownTool),
            _ => panic!("expected error response"),
        }
    }

    #[tokio::test]
    async fn get_current_price_returns_ok_envelope() {
        let s = surface();
        let resp = s.invoke("get_current_price", ToolScope::ReadOnly, &serde_json::json!({"symbol": "ETHUSDT"})).await;
        match resp {
            ToolResponse::Ok { ok, result } => {
                assert!(ok);
                assert_eq!(result["price"], 42.0);
            }
            _ => panic!("expected ok response"),
        }
    }

    #[tokio::test]
    async fn execute_order_rejected_without_trade_scope() {
        let s = surface();
        let resp = s.invoke("execute_order", ToolScope::ReadOnly, &serde_json::json!({
            "symbol": "ETHUSDT", "side": "BUY", "quantity": 1.0
        })).await;
        match resp {
            ToolResponse::Err { error_kind, .. } => assert_eq!(error_kind, ErrorKind::Auth),
            _ => panic!("expected auth error"),
        }
    }

    #[tokio::test]
    async fn execute_order_succeeds_with_trade_scope() {
        let s = surface();
        let resp = s.invoke("execute_order", ToolScope::Trade, &serde_json::json!({
            "symbol": "ETHUSDT", "side": "BUY", "quantity": 1.0
        })).await;
        matches!(resp, ToolResponse::Ok { .. }).then_some(()).expect("expected ok response");
    }

    #[tokio::test]
    async fn missing_argument_yields_tool_args_error() {
        let s = surface();
        let resp = s.invoke("get_current_price", ToolScope::ReadOnly, &serde_json::json!({})).await;
        match resp {
            ToolResponse::Err { error_kind, .. } => assert_eq!(error_kind, ErrorKind::ToolArgs),
            _ => panic!("expected tool-args error"),
        }
    }
}

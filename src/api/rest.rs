// =============================================================================
// REST façade (spec §6) — read/control surface over the fleet
// =============================================================================
//
// Route shapes and the `AuthBearer`-gated mutation pattern are grounded on
// the teacher's `api/rest.rs` (one `Router` built from a flat list of
// `.route(path, method(handler))` calls, JSON bodies via `axum::Json`,
// `AppState` injected with `State<AppState>`); the endpoint set itself is
// spec §6's, not the teacher's original trading-desk routes.

use axum::extract::{Path, Query, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use crate::api::auth::AuthBearer;
use crate::api::AppState;
use crate::error::{ErrorKind, FleetError};
use crate::exchange::TradingMode;
use crate::strategy;
use crate::tools::ToolScope;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/strategies", get(list_strategies))
        .route("/bots", get(list_bots))
        .route("/bot/status", get(bot_status))
        .route("/bot/start", post(start_bot))
        .route("/bot/stop/{bot_id}", post(stop_bot))
        .route("/trades", get(trade_history))
        .route("/memory/{agent}", get(memory_for_agent))
        .route("/memory/{agent}/lessons", get(memory_lessons))
        .route("/memory/pattern/{symbol}/{strategy}", get(memory_pattern))
        .route("/memory/insights/collective", get(memory_insights_collective))
        .route("/market/volatile", get(market_volatile))
        .route("/mcp/tools", get(list_tools))
        .route("/mcp/tools/{name}", post(call_tool))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok", "service": "fleet-bot" }))
}

async fn list_strategies() -> impl IntoResponse {
    let names: Vec<&'static str> = strategy::registry().into_keys().collect();
    Json(json!({ "strategies": names }))
}

#[derive(Debug, Deserialize)]
struct BotStatusQuery {
    bot_id: Option<String>,
}

async fn bot_status(
    State(state): State<AppState>,
    Query(q): Query<BotStatusQuery>,
) -> Result<impl IntoResponse, FleetError> {
    match q.bot_id {
        Some(bot_id) => {
            let bot = state
                .manager
                .get(&bot_id)
                .ok_or_else(|| FleetError::new(ErrorKind::SymbolUnsupported, "unknown bot_id"))?;
            Ok(Json(json!(bot)))
        }
        None => Ok(Json(json!(state.manager.list()))),
    }
}

async fn list_bots(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!(state.manager.list()))
}

#[derive(Debug, Deserialize)]
struct StartBotRequest {
    bot_id: Option<String>,
    symbol: String,
    strategy: String,
    #[serde(default = "default_timeframe")]
    timeframe: String,
    #[serde(default)]
    mode: Option<String>,
    amount: f64,
}

fn default_timeframe() -> String {
    "5m".to_string()
}

/// Create and start a manually operated bot. Spec §6: mutating routes
/// require a valid bearer token.
async fn start_bot(
    State(state): State<AppState>,
    AuthBearer(_token): AuthBearer,
    Json(req): Json<StartBotRequest>,
) -> Result<impl IntoResponse, FleetError> {
    let mode = match req.mode.as_deref() {
        None | Some("SPOT") | Some("spot") => TradingMode::Spot,
        Some("MARGIN") | Some("margin") => TradingMode::Margin,
        Some("FUTURES") | Some("futures") => TradingMode::Futures,
        Some(other) => {
            return Err(FleetError::new(ErrorKind::ModeUnsupported, format!("unknown mode '{other}'")))
        }
    };
    let bot_id = req.bot_id.unwrap_or_else(|| format!("manual-{}", uuid::Uuid::new_v4()));
    let now = chrono::Utc::now().timestamp_millis();
    let bot = state.manager.create(
        bot_id.clone(),
        req.symbol,
        req.strategy,
        req.timeframe,
        mode,
        req.amount,
        false,
        "operator".to_string(),
        now,
    )?;
    state.manager.start(&bot_id)?;
    Ok(Json(json!(bot)))
}

async fn stop_bot(
    State(state): State<AppState>,
    AuthBearer(_token): AuthBearer,
    Path(bot_id): Path<String>,
) -> Result<impl IntoResponse, FleetError> {
    state.manager.stop(&bot_id).await?;
    let bot = state.manager.get(&bot_id);
    Ok(Json(json!({ "bot_id": bot_id, "bot": bot })))
}

#[derive(Debug, Deserialize)]
struct TradeHistoryQuery {
    #[serde(default = "default_limit")]
    limit: usize,
    exit_reason: Option<String>,
}

fn default_limit() -> usize {
    50
}

async fn trade_history(
    State(state): State<AppState>,
    Query(q): Query<TradeHistoryQuery>,
) -> impl IntoResponse {
    Json(json!(state.manager.trade_history(q.limit, q.exit_reason.as_deref())))
}

#[derive(Debug, Deserialize)]
struct MemoryQuery {
    record_type: Option<String>,
    since: Option<i64>,
    #[serde(default = "default_limit")]
    limit: usize,
}

async fn memory_for_agent(
    State(state): State<AppState>,
    Path(agent): Path<String>,
    Query(q): Query<MemoryQuery>,
) -> impl IntoResponse {
    let records = state.memory.retrieve(&agent, q.record_type.as_deref(), q.since, q.limit);
    Json(json!(records))
}

async fn memory_lessons(
    State(state): State<AppState>,
    Path(agent): Path<String>,
    Query(q): Query<MemoryQuery>,
) -> impl IntoResponse {
    let records = state.memory.retrieve(&agent, Some("trade_learning"), q.since, q.limit);
    Json(json!(records))
}

async fn memory_pattern(
    State(state): State<AppState>,
    Path((symbol, strategy)): Path<(String, String)>,
) -> impl IntoResponse {
    let now = chrono::Utc::now().timestamp_millis();
    let insight = state.memory.pattern_insights(&symbol, &strategy, 90, now);
    Json(json!(insight))
}

async fn memory_insights_collective(State(state): State<AppState>) -> impl IntoResponse {
    let now = chrono::Utc::now().timestamp_millis();
    let bots = state.manager.list();
    let mut seen = std::collections::HashSet::new();
    let mut insights = Vec::new();
    for bot in &bots {
        let key = (bot.symbol.clone(), bot.strategy_name.clone());
        if seen.insert(key) {
            insights.push(json!({
                "symbol": bot.symbol,
                "strategy": bot.strategy_name,
                "insight": state.memory.pattern_insights(&bot.symbol, &bot.strategy_name, 90, now),
            }));
        }
    }
    Json(json!({ "insights": insights }))
}

#[derive(Debug, Deserialize)]
struct VolatileQuery {
    #[serde(default = "default_max_coins")]
    max_coins: usize,
    #[serde(default)]
    min_score: f64,
}

fn default_max_coins() -> usize {
    20
}

async fn market_volatile(
    State(state): State<AppState>,
    Query(q): Query<VolatileQuery>,
) -> Result<impl IntoResponse, FleetError> {
    let candidates = state.controller.analyze_candidates(q.max_coins, q.min_score, &[]).await?;
    Ok(Json(json!({ "candidates": candidates.into_iter().map(|c| json!({
        "symbol": c.symbol, "strategy": c.strategy, "confidence": c.confidence, "score": c.score,
    })).collect::<Vec<_>>() })))
}

async fn list_tools() -> impl IntoResponse {
    Json(json!({ "tools": crate::tools::ToolSurface::names() }))
}

/// Unwrap the `{parameters: {...}}` request envelope spec §6 / §4.8 mandate
/// for tool calls. Falls back to the raw body for callers that post
/// arguments at the top level instead of nesting them under `parameters`.
fn tool_call_args(body: serde_json::Value) -> serde_json::Value {
    body.get("parameters").cloned().unwrap_or(body)
}

async fn call_tool(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: axum::http::HeaderMap,
    Json(body): Json<serde_json::Value>,
) -> impl IntoResponse {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let scope = match token {
        Some(t) if crate::api::auth::validate_token(t) => ToolScope::Trade,
        _ => ToolScope::ReadOnly,
    };
    let args = tool_call_args(body);
    let response = state.tools.invoke(&name, scope, &args).await;
    Json(response)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn strategies_route_lists_every_registered_strategy() {
        let response = list_strategies().await.into_response();
        assert_eq!(response.status(), axum::http::StatusCode::OK);
    }

    #[test]
    fn tool_call_args_unwraps_the_parameters_envelope() {
        let body = json!({ "parameters": { "symbol": "ETHUSDT" } });
        let args = tool_call_args(body);
        assert_eq!(args, json!({ "symbol": "ETHUSDT" }));
    }

    #[test]
    fn tool_call_args_falls_back_to_the_raw_body_when_unwrapped() {
        let body = json!({ "symbol": "ETHUSDT" });
        let args = tool_call_args(body.clone());
        assert_eq!(args, body);
    }
}

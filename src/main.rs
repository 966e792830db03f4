// =============================================================================
// fleet-bot — Main Entry Point
// =============================================================================
//
// Startup sequence follows the teacher's `main.rs` shape (dotenv, tracing
// init, build shared state, spawn background loops, serve the API, wait on
// ctrl_c) generalized from one engine's fixed symbol list to the fleet's
// dynamically created bots. Exit codes follow spec §6: 0 on orderly
// shutdown, 1 on fatal initialization error, 2 if an internal invariant is
// violated before the server can even start serving.
// =============================================================================

mod api;
mod bot;
mod candles;
mod config;
mod controller;
mod error;
mod events;
mod exchange;
mod indicators;
mod manager;
mod memory;
mod storage;
mod strategy;
mod tools;

use std::process::ExitCode;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::bot::BotEngine;
use crate::bot::position::RiskConfig;
use crate::candles::CandleTracker;
use crate::config::Config;
use crate::controller::AutonomousController;
use crate::events::EventBus;
use crate::exchange::binance::BinanceAdapter;
use crate::exchange::ExchangeAdapter;
use crate::manager::BotManager;
use crate::memory::MemoryStore;
use crate::storage::StateStore;
use crate::tools::ToolSurface;

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("fleet-bot starting up");

    let config = Config::load();

    let exchange: Arc<dyn ExchangeAdapter> = Arc::new(BinanceAdapter::new(
        config.exchange_api_key.clone(),
        config.exchange_api_secret.clone(),
        config.exchange_testnet,
    ));

    let store = match StateStore::open(&config.storage_url) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!(error = %e, "failed to open state store, aborting startup");
            return ExitCode::from(1);
        }
    };

    let candles = Arc::new(CandleTracker::new(exchange.clone(), store.clone()));
    let memory = Arc::new(MemoryStore::new(store.clone()));
    let events = Arc::new(EventBus::new());

    let risk = RiskConfig {
        stop_loss_pct: config.stop_loss_pct,
        tp_min_pct: config.tp_min_pct,
        tp_trail_pct: config.tp_trail_pct,
        fee_rate: crate::config::FEE_RATE,
    };
    let engine = Arc::new(BotEngine::new(
        exchange.clone(),
        candles.clone(),
        memory.clone(),
        events.clone(),
        store.clone(),
        risk,
    ));

    let manager = Arc::new(BotManager::new(engine, store.clone(), events.clone()));

    let controller = Arc::new(AutonomousController::new(
        manager.clone(),
        exchange.clone(),
        memory.clone(),
        events.clone(),
        config.clone(),
    ));

    let tools = Arc::new(ToolSurface::new(exchange.clone(), manager.clone(), memory.clone(), controller.clone()));

    // A default bot is started from DEFAULT_SYMBOL/DEFAULT_STRATEGY so the
    // fleet has at least one operating bot even with autonomous spawning
    // disabled (MAX_AUTONOMOUS=0).
    let default_bot_id = "default".to_string();
    let now = chrono::Utc::now().timestamp_millis();
    match manager.create(
        default_bot_id.clone(),
        config.default_symbol.clone(),
        config.default_strategy.clone(),
        "5m".to_string(),
        crate::exchange::TradingMode::Spot,
        config.default_amount,
        false,
        "startup".to_string(),
        now,
    ) {
        Ok(_) => {
            if let Err(e) = manager.start(&default_bot_id) {
                error!(error = %e, "failed to start default bot at startup");
                return ExitCode::from(2);
            }
        }
        Err(e) => {
            error!(error = %e, "failed to create default bot at startup");
            return ExitCode::from(2);
        }
    }

    if config.max_autonomous > 0 {
        controller.clone().spawn_loop();
        info!(max_autonomous = config.max_autonomous, "autonomous controller loop started");
    } else {
        warn!("MAX_AUTONOMOUS is 0, autonomous controller will not spawn bots");
    }

    spawn_compaction_loop(memory.clone(), candles.clone());

    let app_state = AppState {
        manager: manager.clone(),
        controller,
        memory,
        store,
        events,
        tools,
        config: Arc::new(config.clone()),
    };

    let bind_addr = config.bind_addr.clone();
    let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, addr = %bind_addr, "failed to bind API server");
            return ExitCode::from(1);
        }
    };
    info!(addr = %bind_addr, "API server listening");

    let router = api::router(app_state);
    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            error!(error = %e, "API server exited with an error");
        }
    });

    info!("all subsystems running, press Ctrl+C to stop");

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    warn!("shutdown signal received, stopping gracefully");
    server.abort();

    for bot in manager.list() {
        if bot.state == bot::BotState::Running {
            if let Err(e) = manager.stop(&bot.bot_id).await {
                warn!(bot_id = %bot.bot_id, error = %e, "failed to stop bot during shutdown");
            }
        }
    }

    info!("fleet-bot shut down complete");
    ExitCode::SUCCESS
}

/// Background task: periodically drop memory records past their retention
/// window and sealed candle windows past their GC age (spec §3, §4.3).
/// Independent of and much lower-frequency than any bot's own tick loop.
fn spawn_compaction_loop(memory: Arc<MemoryStore>, candles: Arc<CandleTracker>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(
            crate::config::COMPACTION_INTERVAL_SEC,
        ));
        loop {
            interval.tick().await;
            let now = chrono::Utc::now().timestamp_millis();
            let memory_removed = memory.compact(crate::config::MEMORY_RETENTION_DAYS, now);
            let candle_cutoff = now - crate::config::CANDLE_WINDOW_GC_DAYS * 86_400_000;
            let candles_removed = candles.gc_sealed(candle_cutoff);
            if memory_removed > 0 || candles_removed > 0 {
                info!(memory_removed, candles_removed, "compaction sweep complete");
            }
        }
    })
}

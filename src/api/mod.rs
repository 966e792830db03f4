// =============================================================================
// HTTP + WebSocket Façade (spec §6)
// =============================================================================

pub mod auth;
pub mod rest;
pub mod ws;

use std::sync::Arc;

use axum::Router;
use tower_http::cors::CorsLayer;

use crate::config::Config;
use crate::controller::AutonomousController;
use crate::events::EventBus;
use crate::manager::BotManager;
use crate::memory::MemoryStore;
use crate::storage::StateStore;
use crate::tools::ToolSurface;

/// Everything a route handler needs, shared behind `Arc` — the teacher's
/// `app_state.rs` single-struct-of-arcs pattern, generalized from one
/// engine's state to the fleet's shared components.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<BotManager>,
    pub controller: Arc<AutonomousController>,
    pub memory: Arc<MemoryStore>,
    pub store: Arc<StateStore>,
    pub events: Arc<EventBus>,
    pub tools: Arc<ToolSurface>,
    pub config: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
    let cors = if state.config.cors_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<axum::http::HeaderValue> = state
            .config
            .cors_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(origins).allow_methods(tower_http::cors::Any)
    };

    Router::new().nest("/api", rest::routes()).merge(ws::routes()).layer(cors).with_state(state)
}

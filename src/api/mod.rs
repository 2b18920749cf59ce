pub mod error;
mod handlers;

use axum::{routing::get, Router};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::config::ConsoleConfig;
use crate::session::SessionRegistry;

use handlers::*;

/// WebSocket endpoint for console sessions.
pub const CONSOLE_WS_PATH: &str = "/console/ws";
pub const HEALTH_PATH: &str = "/health";

#[derive(Clone)]
pub struct AppState {
    pub registry: SessionRegistry,
    pub config: Arc<ConsoleConfig>,
    /// Cancelled once when the server begins shutting down.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Build state with a fresh registry sized from `config`.
    pub fn new(config: ConsoleConfig) -> Self {
        let registry = SessionRegistry::new(config.max_sessions, config.idle_timeout);
        Self {
            registry,
            config: Arc::new(config),
            shutdown: CancellationToken::new(),
        }
    }
}

/// The console router.
///
/// Handlers read the peer address from `ConnectInfo`, so serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(CONSOLE_WS_PATH, get(console_ws))
        .route(HEALTH_PATH, get(health))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, WebSocketUpgrade},
        ConnectInfo, Query, State,
    },
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::bridge;
use crate::session::SpawnMode;

use super::error::ApiError;
use super::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct HealthResponse {
    status: &'static str,
    session_count: usize,
    max_sessions: usize,
}

pub(super) async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        session_count: state.registry.len(),
        max_sessions: state.registry.max_sessions(),
    })
}

#[derive(Deserialize)]
pub(super) struct ConsoleParams {
    mode: Option<String>,
}

/// `GET /console/ws[?mode=shell]`
///
/// The capacity check runs before the upgrade is validated so a full server
/// answers 503 without spawning anything.
pub(super) async fn console_ws(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Query(params): Query<ConsoleParams>,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if !state.registry.can_accept() {
        tracing::warn!(%peer, max = state.registry.max_sessions(), "console refused, at capacity");
        return ApiError::CapacityExceeded {
            max_sessions: state.registry.max_sessions(),
        }
        .into_response();
    }

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => return rejection.into_response(),
    };

    let mode = SpawnMode::from_param(params.mode.as_deref());
    ws.on_upgrade(move |socket| bridge::serve(socket, peer, mode, state))
}

pub(super) async fn not_found() -> ApiError {
    ApiError::NotFound
}

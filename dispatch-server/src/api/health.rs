//! Health routes
//!
//! | Path | Method | Meaning |
//! |------|--------|---------|
//! | /health | GET | Liveness plus server epoch |
//! | /health/detailed | GET | Storage counters and hub sessions |
//! | /api/sessions | GET | Connected hub clients |

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;
use shared::error::AppResult;

use super::blocking;
use crate::core::ServerState;
use crate::dispatch::StorageStats;
use crate::hub::SessionInfo;

pub fn router() -> Router<ServerState> {
    Router::new()
        .route("/health", get(health))
        .route("/health/detailed", get(detailed_health))
        .route("/api/sessions", get(sessions))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    status: &'static str,
    version: &'static str,
    /// Changes on every restart; clients compare it to decide on a full resync
    epoch: String,
}

#[derive(Debug, Serialize)]
pub struct DetailedHealthResponse {
    status: &'static str,
    version: &'static str,
    epoch: String,
    uptime_seconds: u64,
    provider: &'static str,
    hub_sessions: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    storage: Option<StorageStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    storage_error: Option<String>,
}

pub async fn health(State(state): State<ServerState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        epoch: state.manager.epoch().to_string(),
    })
}

pub async fn detailed_health(State(state): State<ServerState>) -> Json<DetailedHealthResponse> {
    let manager = state.manager.clone();
    let stats = blocking(move || {
        manager
            .storage()
            .get_stats()
            .map_err(|e| shared::error::AppError::database(e.to_string()))
    })
    .await;

    let (storage, storage_error) = match stats {
        Ok(stats) => (Some(stats), None),
        Err(e) => (None, Some(e.message)),
    };

    Json(DetailedHealthResponse {
        status: if storage.is_some() { "healthy" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        epoch: state.manager.epoch().to_string(),
        uptime_seconds: state.uptime_seconds(),
        provider: state.provider.name(),
        hub_sessions: state.hub.session_count(),
        storage,
        storage_error,
    })
}

pub async fn sessions(State(state): State<ServerState>) -> AppResult<Json<Vec<SessionInfo>>> {
    Ok(Json(state.hub.connected_sessions()))
}

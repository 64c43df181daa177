//! Admin HTTP API
//!
//! - [`health`] - liveness, storage counters, connected hub sessions
//! - [`plan`] - planning runs
//! - [`routes`] - route listing, cancel, manual override, stop reassignment
//! - [`orders`] - order intake and urgent insertion
//! - [`vehicles`] - fleet upkeep
//!
//! Every mutation goes through the dispatch manager as a command; errors are
//! `AppError`s rendered with their code's HTTP status.

pub mod health;
pub mod orders;
pub mod plan;
pub mod routes;
pub mod vehicles;

use axum::{Router, middleware};
use shared::error::{AppError, AppResult};
use shared::route::{CommandResponse, DispatchCommand};
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;

use crate::core::ServerState;

/// Access log
async fn log_request(
    request: http::Request<axum::body::Body>,
    next: middleware::Next,
) -> http::Response<axum::body::Body> {
    let method = request.method().clone();
    let uri = request.uri().clone();

    let response = next.run(request).await;

    tracing::info!(target: "http_access", "{} {} {}", method, uri, response.status());
    response
}

/// Routes without state
pub fn routes() -> Router<ServerState> {
    Router::<ServerState>::new()
        .merge(health::router())
        .merge(plan::router())
        .merge(routes::router())
        .merge(orders::router())
        .merge(vehicles::router())
}

/// Full application with state and middleware
pub fn build_app(state: ServerState) -> Router {
    routes()
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
        .layer(middleware::from_fn(log_request))
}

/// Run a command on the blocking pool, turning a rejection into an error
pub(crate) async fn execute(state: &ServerState, cmd: DispatchCommand) -> AppResult<CommandResponse> {
    let manager = state.manager.clone();
    let resp = tokio::task::spawn_blocking(move || manager.execute_command(cmd))
        .await
        .map_err(|e| AppError::internal(e.to_string()))?;
    match resp.error {
        Some(err) => Err(err),
        None => Ok(resp),
    }
}

/// Run storage work on the blocking pool
pub(crate) async fn blocking<T, F>(f: F) -> AppResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> AppResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| AppError::internal(e.to_string()))?
}

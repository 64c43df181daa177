//! Fleet upkeep
//!
//! | Path | Method | Meaning |
//! |------|--------|---------|
//! | /api/vehicles | PUT | Create or update a vehicle |
//! | /api/vehicles | GET | All vehicles |
//! | /api/vehicles/{id} | GET | One vehicle |
//! | /api/vehicles/{id} | DELETE | Remove a vehicle |

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::get,
};
use shared::error::{AppError, AppResult};
use shared::models::Vehicle;

use super::blocking;
use crate::core::ServerState;

pub fn router() -> Router<ServerState> {
    Router::new()
        .route("/api/vehicles", get(list).put(upsert))
        .route("/api/vehicles/{id}", get(get_by_id).delete(remove))
}

pub async fn upsert(
    State(state): State<ServerState>,
    Json(vehicle): Json<Vehicle>,
) -> AppResult<Json<Vehicle>> {
    let repo = state.repo.clone();
    let vehicle = blocking(move || {
        repo.save_vehicle(&vehicle)?;
        Ok(vehicle)
    })
    .await?;
    Ok(Json(vehicle))
}

pub async fn list(State(state): State<ServerState>) -> AppResult<Json<Vec<Vehicle>>> {
    let repo = state.repo.clone();
    let vehicles = blocking(move || Ok(repo.find_vehicles()?)).await?;
    Ok(Json(vehicles))
}

pub async fn get_by_id(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> AppResult<Json<Vehicle>> {
    let repo = state.repo.clone();
    let vehicle = blocking(move || {
        repo.find_vehicle(&id)?
            .ok_or_else(|| AppError::not_found(format!("Vehicle {id}")))
    })
    .await?;
    Ok(Json(vehicle))
}

pub async fn remove(State(state): State<ServerState>, Path(id): Path<String>) -> AppResult<Json<bool>> {
    let repo = state.repo.clone();
    let removed = blocking(move || Ok(repo.remove_vehicle(&id)?)).await?;
    Ok(Json(removed))
}

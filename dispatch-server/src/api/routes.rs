//! Route routes
//!
//! | Path | Method | Meaning |
//! |------|--------|---------|
//! | /api/routes | GET | Routes, filtered by date / vehicle / liveness |
//! | /api/routes/{id} | GET | One route (live or archived) |
//! | /api/routes/{id}/events | GET | Event log after a sequence |
//! | /api/routes/{id}/assign | POST | Assign or swap the vehicle |
//! | /api/routes/{id}/cancel | POST | Cancel the route |
//! | /api/routes/{id}/override | POST | Force a route or stop state once |
//! | /api/stops/reassign | POST | Move a pending stop to another route |
//!
//! Mutations accept an optional `command_id` so a console can retry safely,
//! and `observed_sequence` so a stale console loses against newer driver
//! updates.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use chrono::NaiveDate;
use serde::Deserialize;
use shared::error::{AppError, AppResult};
use shared::route::{
    CommandPayload, CommandResponse, DispatchCommand, EventOrigin, OverrideTarget, RouteSnapshot,
    SyncEvent,
};

use super::{blocking, execute};
use crate::core::ServerState;

pub fn router() -> Router<ServerState> {
    Router::new()
        .route("/api/routes", get(list))
        .route("/api/routes/{id}", get(get_by_id))
        .route("/api/routes/{id}/events", get(events))
        .route("/api/routes/{id}/assign", post(assign))
        .route("/api/routes/{id}/cancel", post(cancel))
        .route("/api/routes/{id}/override", post(force_state))
        .route("/api/stops/reassign", post(reassign_stop))
}

/// Who issued a console mutation
#[derive(Debug, Default, Deserialize)]
pub struct Issuer {
    #[serde(default)]
    pub command_id: Option<String>,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default)]
    pub observed_sequence: Option<u64>,
}

impl Issuer {
    fn command(self, payload: CommandPayload) -> DispatchCommand {
        let mut cmd = DispatchCommand::new(EventOrigin::Dispatcher, payload);
        if let Some(id) = self.command_id {
            cmd = cmd.with_command_id(id);
        }
        if let Some(actor) = self.actor {
            cmd = cmd.with_actor(actor);
        }
        if let Some(seq) = self.observed_sequence {
            cmd = cmd.with_observed_sequence(seq);
        }
        cmd
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub planning_date: Option<NaiveDate>,
    pub vehicle_id: Option<String>,
    #[serde(default)]
    pub active_only: bool,
}

pub async fn list(
    State(state): State<ServerState>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<RouteSnapshot>>> {
    let repo = state.repo.clone();
    let routes = blocking(move || {
        let routes = repo.find_routes(query.planning_date)?;
        Ok(routes
            .into_iter()
            .filter(|r| query.vehicle_id.as_ref().is_none_or(|v| &r.vehicle_id == v))
            .filter(|r| !query.active_only || r.is_active())
            .collect())
    })
    .await?;
    Ok(Json(routes))
}

pub async fn get_by_id(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> AppResult<Json<RouteSnapshot>> {
    let repo = state.repo.clone();
    let route = blocking(move || {
        repo.find_route(&id)?
            .ok_or_else(|| AppError::route_not_found(&id))
    })
    .await?;
    Ok(Json(route))
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default)]
    pub since: u64,
}

pub async fn events(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Query(query): Query<EventsQuery>,
) -> AppResult<Json<Vec<SyncEvent>>> {
    let manager = state.manager.clone();
    let events = blocking(move || Ok(manager.get_events_since(&id, query.since)?)).await?;
    Ok(Json(events))
}

#[derive(Debug, Deserialize)]
pub struct AssignRequest {
    pub vehicle_id: String,
    #[serde(flatten)]
    pub issuer: Issuer,
}

pub async fn assign(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Json(req): Json<AssignRequest>,
) -> AppResult<Json<CommandResponse>> {
    let repo = state.repo.clone();
    let vehicle_id = req.vehicle_id.clone();
    let vehicle = blocking(move || {
        repo.find_vehicle(&vehicle_id)?
            .ok_or_else(|| AppError::not_found(format!("Vehicle {vehicle_id}")))
    })
    .await?;
    if !vehicle.available {
        return Err(AppError::validation(format!("vehicle {} is not available", vehicle.id)));
    }

    let cmd = req.issuer.command(CommandPayload::AssignVehicle {
        route_id: id,
        vehicle_id: vehicle.id,
        capacity: vehicle.capacity,
    });
    Ok(Json(execute(&state, cmd).await?))
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelRequest {
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(flatten)]
    pub issuer: Issuer,
}

pub async fn cancel(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Json(req): Json<CancelRequest>,
) -> AppResult<Json<CommandResponse>> {
    let cmd = req.issuer.command(CommandPayload::CancelRoute {
        route_id: id,
        reason: req.reason,
    });
    Ok(Json(execute(&state, cmd).await?))
}

#[derive(Debug, Deserialize)]
pub struct OverrideRequest {
    pub target: OverrideTarget,
    pub reason: String,
    #[serde(flatten)]
    pub issuer: Issuer,
}

pub async fn force_state(
    State(state): State<ServerState>,
    Path(id): Path<String>,
    Json(req): Json<OverrideRequest>,
) -> AppResult<Json<CommandResponse>> {
    if req.issuer.actor.is_none() {
        return Err(AppError::validation("manual override needs an actor"));
    }
    let cmd = req.issuer.command(CommandPayload::ForceState {
        route_id: id,
        target: req.target,
        reason: req.reason,
    });
    Ok(Json(execute(&state, cmd).await?))
}

#[derive(Debug, Deserialize)]
pub struct ReassignRequest {
    pub from_route_id: String,
    pub to_route_id: String,
    pub order_id: String,
    #[serde(default)]
    pub position: Option<u32>,
    #[serde(flatten)]
    pub issuer: Issuer,
}

pub async fn reassign_stop(
    State(state): State<ServerState>,
    Json(req): Json<ReassignRequest>,
) -> AppResult<Json<CommandResponse>> {
    let cmd = req.issuer.command(CommandPayload::ReassignStop {
        from_route_id: req.from_route_id,
        to_route_id: req.to_route_id,
        order_id: req.order_id,
        position: req.position,
    });
    Ok(Json(execute(&state, cmd).await?))
}

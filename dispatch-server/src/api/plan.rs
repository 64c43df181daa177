//! Planning runs
//!
//! `POST /api/plan` clusters and sequences every unassigned order of a date
//! and creates the routes. Running it again only plans what is still
//! unassigned, on vehicles without a live route that day.

use axum::{Json, Router, extract::State, routing::post};
use chrono::NaiveDate;
use serde::Deserialize;
use shared::error::{AppError, AppResult};

use crate::core::ServerState;
use crate::planning::PlanReport;

pub fn router() -> Router<ServerState> {
    Router::new().route("/api/plan", post(plan))
}

#[derive(Debug, Deserialize)]
pub struct PlanRequest {
    pub planning_date: NaiveDate,
}

pub async fn plan(
    State(state): State<ServerState>,
    Json(req): Json<PlanRequest>,
) -> AppResult<Json<PlanReport>> {
    let report = state.planner.plan(req.planning_date).await.map_err(AppError::from)?;
    Ok(Json(report))
}

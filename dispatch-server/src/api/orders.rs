//! Order intake
//!
//! | Path | Method | Meaning |
//! |------|--------|---------|
//! | /api/orders | POST | Create or update an order |
//! | /api/orders | GET | Orders, filtered by date / status |
//! | /api/orders/{id} | GET | One order |
//! | /api/orders/{id} | DELETE | Remove an order that is not on a route |
//! | /api/orders/{id}/urgent | POST | Insert into the best live route now |

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    routing::{get, post},
};
use chrono::NaiveDate;
use serde::Deserialize;
use shared::error::{AppError, AppResult};
use shared::models::{Order, OrderStatus};

use super::blocking;
use crate::core::ServerState;
use crate::dispatch::OrderFilter;
use crate::planning::UrgentPlacement;

pub fn router() -> Router<ServerState> {
    Router::new()
        .route("/api/orders", post(upsert).get(list))
        .route("/api/orders/{id}", get(get_by_id).delete(remove))
        .route("/api/orders/{id}/urgent", post(urgent))
}

/// Intake upsert
///
/// Status and creation time belong to the server: a new order starts
/// unassigned, an existing one keeps what dispatch has made of it.
pub async fn upsert(
    State(state): State<ServerState>,
    Json(mut order): Json<Order>,
) -> AppResult<Json<Order>> {
    let repo = state.repo.clone();
    let order = blocking(move || {
        match repo.find_order(&order.id)? {
            Some(existing) => {
                order.status = existing.status;
                order.created_at = existing.created_at;
            }
            None => {
                order.status = OrderStatus::Unassigned;
                order.created_at = shared::util::now_millis();
            }
        }
        repo.save_order(&order)?;
        Ok(order)
    })
    .await?;
    tracing::debug!(order_id = %order.id, date = %order.planning_date, "Order saved");
    Ok(Json(order))
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub planning_date: Option<NaiveDate>,
    pub status: Option<OrderStatus>,
}

pub async fn list(
    State(state): State<ServerState>,
    Query(query): Query<ListQuery>,
) -> AppResult<Json<Vec<Order>>> {
    let repo = state.repo.clone();
    let orders = blocking(move || {
        Ok(repo.find_orders(OrderFilter {
            planning_date: query.planning_date,
            status: query.status,
        })?)
    })
    .await?;
    Ok(Json(orders))
}

pub async fn get_by_id(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> AppResult<Json<Order>> {
    let repo = state.repo.clone();
    let order = blocking(move || {
        repo.find_order(&id)?
            .ok_or_else(|| AppError::not_found(format!("Order {id}")))
    })
    .await?;
    Ok(Json(order))
}

pub async fn remove(State(state): State<ServerState>, Path(id): Path<String>) -> AppResult<Json<bool>> {
    let repo = state.repo.clone();
    let removed = blocking(move || Ok(repo.remove_order(&id)?)).await?;
    Ok(Json(removed))
}

/// Urgent insertion
///
/// An order no live route can take comes back as `unassignable` with a
/// reason; routes are left untouched in that case.
pub async fn urgent(
    State(state): State<ServerState>,
    Path(id): Path<String>,
) -> AppResult<Json<UrgentPlacement>> {
    let placement = state
        .reoptimizer
        .insert_urgent(&id)
        .await
        .map_err(AppError::from)?;
    match &placement {
        UrgentPlacement::Inserted { route_id, position, .. } => {
            tracing::info!(order_id = %id, route_id = %route_id, position, "Urgent order inserted");
        }
        UrgentPlacement::Unassignable(u) => {
            tracing::warn!(order_id = %id, reason = ?u.reason, "Urgent order could not be placed");
        }
    }
    Ok(Json(placement))
}

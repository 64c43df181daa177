//! Persistence interface
//!
//! CRUD for orders and vehicles, read/list/archive for routes and stops.
//! The planner and the HTTP API go through this trait; the dispatch manager
//! writes routes through its own transactions.

use chrono::NaiveDate;
use shared::error::{AppError, ErrorCode};
use shared::models::{Order, OrderStatus, Vehicle};
use shared::route::{RouteSnapshot, StopSnapshot};
use thiserror::Error;

use super::storage::{DispatchStorage, StorageError};

/// Repository error types
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl From<StorageError> for RepoError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::RouteNotFound(id) => RepoError::NotFound(format!("route {id}")),
            other => RepoError::Database(other.to_string()),
        }
    }
}

impl From<RepoError> for AppError {
    fn from(err: RepoError) -> Self {
        match err {
            RepoError::NotFound(what) => AppError::not_found(what),
            RepoError::Duplicate(what) => AppError::with_message(ErrorCode::AlreadyExists, what),
            RepoError::Database(msg) => AppError::database(msg),
            RepoError::Validation(msg) => AppError::validation(msg),
        }
    }
}

/// Result type for repository operations
pub type RepoResult<T> = Result<T, RepoError>;

/// Order listing filter, all fields optional
#[derive(Debug, Clone, Copy, Default)]
pub struct OrderFilter {
    pub planning_date: Option<NaiveDate>,
    pub status: Option<OrderStatus>,
}

impl OrderFilter {
    pub fn unassigned_on(date: NaiveDate) -> Self {
        Self {
            planning_date: Some(date),
            status: Some(OrderStatus::Unassigned),
        }
    }

    fn matches(&self, order: &Order) -> bool {
        self.planning_date.is_none_or(|d| order.planning_date == d)
            && self.status.is_none_or(|s| order.status == s)
    }
}

pub trait Repository: Send + Sync {
    // Orders
    fn save_order(&self, order: &Order) -> RepoResult<()>;
    fn find_order(&self, id: &str) -> RepoResult<Option<Order>>;
    fn find_orders(&self, filter: OrderFilter) -> RepoResult<Vec<Order>>;
    fn remove_order(&self, id: &str) -> RepoResult<bool>;

    // Vehicles
    fn save_vehicle(&self, vehicle: &Vehicle) -> RepoResult<()>;
    fn find_vehicle(&self, id: &str) -> RepoResult<Option<Vehicle>>;
    fn find_vehicles(&self) -> RepoResult<Vec<Vehicle>>;
    fn remove_vehicle(&self, id: &str) -> RepoResult<bool>;

    // Routes and stops
    /// Live or archived route
    fn find_route(&self, id: &str) -> RepoResult<Option<RouteSnapshot>>;
    /// Live routes, optionally for one planning date
    fn find_routes(&self, date: Option<NaiveDate>) -> RepoResult<Vec<RouteSnapshot>>;
    fn find_stop(&self, route_id: &str, order_id: &str) -> RepoResult<Option<StopSnapshot>>;
    fn archive(&self, route_id: &str) -> RepoResult<RouteSnapshot>;
}

impl Repository for DispatchStorage {
    fn save_order(&self, order: &Order) -> RepoResult<()> {
        order.validate().map_err(RepoError::Validation)?;
        if let Some(route_id) = self.route_for_order(&order.id)?
            && let Some(existing) = self.get_order(&order.id)?
            && (existing.demand != order.demand || existing.location != order.location)
        {
            return Err(RepoError::Validation(format!(
                "order {} is on route {route_id}; cancel or reassign it first",
                order.id
            )));
        }
        self.upsert_order(order)?;
        Ok(())
    }

    fn find_order(&self, id: &str) -> RepoResult<Option<Order>> {
        Ok(self.get_order(id)?)
    }

    fn find_orders(&self, filter: OrderFilter) -> RepoResult<Vec<Order>> {
        let mut orders: Vec<Order> = self
            .get_all_orders()?
            .into_iter()
            .filter(|o| filter.matches(o))
            .collect();
        orders.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(orders)
    }

    fn remove_order(&self, id: &str) -> RepoResult<bool> {
        if let Some(route_id) = self.route_for_order(id)? {
            return Err(RepoError::Validation(format!(
                "order {id} is on route {route_id}"
            )));
        }
        Ok(self.delete_order(id)?)
    }

    fn save_vehicle(&self, vehicle: &Vehicle) -> RepoResult<()> {
        vehicle.validate().map_err(RepoError::Validation)?;
        Ok(self.upsert_vehicle(vehicle)?)
    }

    fn find_vehicle(&self, id: &str) -> RepoResult<Option<Vehicle>> {
        Ok(self.get_vehicle(id)?)
    }

    fn find_vehicles(&self) -> RepoResult<Vec<Vehicle>> {
        let mut vehicles = self.get_all_vehicles()?;
        vehicles.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(vehicles)
    }

    fn remove_vehicle(&self, id: &str) -> RepoResult<bool> {
        Ok(self.delete_vehicle(id)?)
    }

    fn find_route(&self, id: &str) -> RepoResult<Option<RouteSnapshot>> {
        match self.get_snapshot(id)? {
            Some(snapshot) => Ok(Some(snapshot)),
            None => Ok(self.get_archived(id)?),
        }
    }

    fn find_routes(&self, date: Option<NaiveDate>) -> RepoResult<Vec<RouteSnapshot>> {
        let mut routes: Vec<RouteSnapshot> = self
            .get_all_snapshots()?
            .into_iter()
            .filter(|r| date.is_none_or(|d| r.planning_date == d))
            .collect();
        routes.sort_by(|a, b| a.route_id.cmp(&b.route_id));
        Ok(routes)
    }

    fn find_stop(&self, route_id: &str, order_id: &str) -> RepoResult<Option<StopSnapshot>> {
        let route = self
            .find_route(route_id)?
            .ok_or_else(|| RepoError::NotFound(format!("route {route_id}")))?;
        Ok(route.stop(order_id).cloned())
    }

    fn archive(&self, route_id: &str) -> RepoResult<RouteSnapshot> {
        Ok(self.archive_route(route_id)?)
    }
}

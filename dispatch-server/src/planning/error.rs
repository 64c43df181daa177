use serde::{Deserialize, Serialize};
use shared::error::{AppError, ErrorCode};
use thiserror::Error;

use super::distance::ProviderError;
use crate::dispatch::{ManagerError, RepoError, StorageError};

/// Why an order could not be placed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnassignableReason {
    /// Demand larger than any vehicle
    ExceedsVehicleCapacity,
    /// Every group/route is full
    NoCapacityLeft,
    /// Capacity fits but no position respects windows and shift
    NoFeasibleSlot,
    /// Planning ran without vehicles
    NoVehicles,
    /// No planned/assigned/in-progress route to insert into
    NoActiveRoute,
    /// Re-optimization budget ran out before the order was placed
    TimedOut,
    /// Order failed validation
    InvalidOrder,
}

/// Order flagged unassignable; the batch continues without it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unassignable {
    pub order_id: String,
    pub reason: UnassignableReason,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Unassignable {
    pub fn new(order_id: impl Into<String>, reason: UnassignableReason) -> Self {
        Self {
            order_id: order_id.into(),
            reason,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Planning errors
#[derive(Debug, Error)]
pub enum PlanningError {
    /// Fatal to the planning run; every order is reported unassignable
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        unassignable: Vec<Unassignable>,
    },

    #[error("Order {0} is already on a route")]
    AlreadyRouted(String),

    #[error("Order not found: {0}")]
    OrderNotFound(String),

    #[error("Re-optimization of {0} was superseded by a newer request")]
    Superseded(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Repository error: {0}")]
    Repository(#[from] RepoError),

    #[error("Dispatch rejected the plan: {0}")]
    Dispatch(AppError),

    #[error("Planning task failed: {0}")]
    Task(String),
}

impl PlanningError {
    pub fn no_vehicles(order_ids: impl IntoIterator<Item = String>) -> Self {
        Self::Configuration {
            message: "no vehicles available for planning".to_string(),
            unassignable: order_ids
                .into_iter()
                .map(|id| Unassignable::new(id, UnassignableReason::NoVehicles))
                .collect(),
        }
    }
}

impl From<ManagerError> for PlanningError {
    fn from(err: ManagerError) -> Self {
        match err {
            ManagerError::Storage(e) => Self::Storage(e),
            other => Self::Dispatch(other.into()),
        }
    }
}

impl From<tokio::task::JoinError> for PlanningError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::Task(err.to_string())
    }
}

impl From<PlanningError> for AppError {
    fn from(err: PlanningError) -> Self {
        match err {
            PlanningError::Configuration {
                message,
                unassignable,
            } => {
                let ids: Vec<String> = unassignable.into_iter().map(|u| u.order_id).collect();
                AppError::with_message(ErrorCode::ConfigurationError, message)
                    .with_detail("unassignable", ids)
            }
            PlanningError::AlreadyRouted(id) => {
                AppError::with_message(ErrorCode::OrderAlreadyRouted, format!("Order {id} is already on a route"))
                    .with_detail("order_id", id)
            }
            PlanningError::OrderNotFound(id) => {
                AppError::with_message(ErrorCode::OrderNotFound, format!("Order not found: {id}"))
            }
            PlanningError::Superseded(route_id) => AppError::with_message(
                ErrorCode::ReoptimizationSuperseded,
                format!("Re-optimization of {route_id} was superseded"),
            )
            .with_detail("route_id", route_id),
            PlanningError::Provider(e) => e.into(),
            PlanningError::Storage(e) => AppError::database(e.to_string()),
            PlanningError::Repository(e) => e.into(),
            PlanningError::Dispatch(e) => e,
            PlanningError::Task(msg) => AppError::internal(msg),
        }
    }
}

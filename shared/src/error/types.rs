//! `AppError` and the HTTP response envelope
//!
//! The same error value travels in HTTP bodies, in hub acknowledgements
//! and in a driver's rejected list, so a device and a console always agree
//! on the code.

use std::collections::HashMap;

use http::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::category::ErrorCategory;
use super::codes::ErrorCode;

#[derive(Debug, Clone, Error, Serialize, Deserialize, PartialEq)]
#[error("{message}")]
pub struct AppError {
    pub code: ErrorCode,
    pub message: String,
    /// Route id, order id, conflicting sequence...
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, Value>>,
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    /// Error with the code's default message
    pub fn new(code: ErrorCode) -> Self {
        Self::with_message(code, code.message())
    }

    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.details.as_ref()?.get(key)
    }

    pub fn category(&self) -> ErrorCategory {
        self.code.category()
    }

    /// Server-side fault: the same request may succeed later
    ///
    /// Business rejections (illegal transition, conflict, unknown stop) are
    /// final and must not be retried.
    pub fn is_retryable(&self) -> bool {
        self.category() == ErrorCategory::System
    }

    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    // General

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::ValidationFailed, msg)
    }

    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::InvalidRequest, msg)
    }

    pub fn not_found(resource: impl Into<String>) -> Self {
        let resource = resource.into();
        Self::with_message(ErrorCode::NotFound, format!("{resource} not found"))
            .with_detail("resource", resource)
    }

    // Dispatch

    pub fn illegal_transition(msg: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::IllegalTransition, msg)
    }

    pub fn route_not_found(route_id: impl Into<String>) -> Self {
        let route_id = route_id.into();
        Self::with_message(ErrorCode::RouteNotFound, format!("Route {route_id} not found"))
            .with_detail("route_id", route_id)
    }

    pub fn stop_not_found(route_id: impl Into<String>, order_id: impl Into<String>) -> Self {
        let (route_id, order_id) = (route_id.into(), order_id.into());
        Self::with_message(
            ErrorCode::StopNotFound,
            format!("Stop {order_id} is not on route {route_id}"),
        )
        .with_detail("route_id", route_id)
        .with_detail("order_id", order_id)
    }

    // Sync

    pub fn sync_conflict(msg: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::SyncConflict, msg)
    }

    pub fn not_subscribed(route_id: impl Into<String>) -> Self {
        let route_id = route_id.into();
        Self::with_message(
            ErrorCode::NotSubscribed,
            format!("Not subscribed to route {route_id}"),
        )
        .with_detail("route_id", route_id)
    }

    // System

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::InternalError, msg)
    }

    pub fn database(msg: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::DatabaseError, msg)
    }

    pub fn client_disconnected() -> Self {
        Self::new(ErrorCode::ClientDisconnected)
    }
}

/// Body of every admin API response
///
/// `code` is 0 on success, otherwise the numeric [`ErrorCode`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<HashMap<String, Value>>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            code: 0,
            message: "OK".to_string(),
            data: Some(data),
            details: None,
        }
    }

    pub fn error(err: &AppError) -> Self {
        Self {
            code: err.code.code(),
            message: err.message.clone(),
            data: None,
            details: err.details.clone(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }

    fn status(&self) -> StatusCode {
        if self.is_success() {
            return StatusCode::OK;
        }
        ErrorCode::try_from(self.code)
            .map(|c| c.http_status())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        if self.category() == ErrorCategory::System {
            tracing::error!(code = %self.code, message = %self.message, "Request failed");
        }
        ApiResponse::<()>::error(&self).into_response()
    }
}

impl<T: Serialize> axum::response::IntoResponse for ApiResponse<T> {
    fn into_response(self) -> axum::response::Response {
        (self.status(), axum::Json(self)).into_response()
    }
}

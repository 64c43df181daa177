//! HTTP status code mapping for error codes

use super::codes::ErrorCode;
use http::StatusCode;

impl ErrorCode {
    /// Get the appropriate HTTP status code for this error code
    pub fn http_status(&self) -> StatusCode {
        match self {
            Self::Success => StatusCode::OK,

            // 404 Not Found
            Self::NotFound
            | Self::RouteNotFound
            | Self::StopNotFound
            | Self::VehicleNotFound
            | Self::OrderNotFound
            | Self::QueueItemNotFound => StatusCode::NOT_FOUND,

            // 409 Conflict
            Self::AlreadyExists
            | Self::SyncConflict
            | Self::OrderAlreadyRouted
            | Self::ReoptimizationSuperseded => StatusCode::CONFLICT,

            // 410 Gone
            Self::RouteArchived => StatusCode::GONE,

            // 422 Unprocessable (state machine and feasibility rules)
            Self::IllegalTransition
            | Self::CapacityExceeded
            | Self::InfeasibleAssignment
            | Self::ConfigurationError => StatusCode::UNPROCESSABLE_ENTITY,

            // 502 Bad Gateway (upstream provider)
            Self::ProviderUnavailable | Self::ProviderBadResponse => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable (transient errors, client can retry)
            Self::NetworkError | Self::TimeoutError | Self::ReoptimizationTimedOut => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            // 500 Internal Server Error
            Self::InternalError
            | Self::DatabaseError
            | Self::ConfigError
            | Self::StorageCorrupted
            | Self::ClientDisconnected => StatusCode::INTERNAL_SERVER_ERROR,

            // 400 Bad Request (default for validation/protocol errors)
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

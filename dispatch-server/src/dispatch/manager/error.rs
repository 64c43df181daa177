use super::super::storage::StorageError;
use super::super::traits::DispatchError;
use shared::error::{AppError, ErrorCode};
use thiserror::Error;

/// Manager errors
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Rejected by an action; state unchanged
    #[error(transparent)]
    Rejected(DispatchError),

    #[error("Route not found: {0}")]
    RouteNotFound(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<DispatchError> for ManagerError {
    fn from(err: DispatchError) -> Self {
        match err {
            DispatchError::Storage(e) => ManagerError::Storage(e),
            other => ManagerError::Rejected(other),
        }
    }
}

/// Map a storage failure to an error code clients can act on
fn classify_storage_error(e: &StorageError) -> ErrorCode {
    match e {
        StorageError::Serialization(_) => return ErrorCode::InternalError,
        StorageError::RouteNotFound(_) => return ErrorCode::RouteNotFound,
        _ => {}
    }

    // redb errors carry no structured kind
    let err_str = e.to_string().to_lowercase();

    if err_str.contains("corrupt") || err_str.contains("invalid database") {
        return ErrorCode::StorageCorrupted;
    }

    // Disk full, out of memory, busy: all retryable from the client's view
    ErrorCode::DatabaseError
}

impl From<ManagerError> for AppError {
    fn from(err: ManagerError) -> Self {
        match err {
            ManagerError::Storage(e) => {
                let code = classify_storage_error(&e);
                tracing::error!(error = %e, error_code = ?code, "Storage error occurred");
                AppError::with_message(code, e.to_string())
            }
            ManagerError::Rejected(e) => e.into(),
            ManagerError::RouteNotFound(id) => AppError::route_not_found(id),
            ManagerError::Internal(msg) => AppError::internal(msg),
        }
    }
}

pub type ManagerResult<T> = Result<T, ManagerError>;

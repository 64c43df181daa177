//! Client error types

use shared::error::{AppError, ErrorCode};
use thiserror::Error;

pub use crate::message::MessageError;

/// Offline queue errors
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("Transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("Table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("Storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("Commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Queue item not found: {0}")]
    NotFound(String),

    /// Retry / discard only apply to items that gave up syncing
    #[error("Queue item {0} is not failed_to_sync")]
    NotFailed(String),
}

pub type QueueResult<T> = Result<T, QueueError>;

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::NotFound(id) => {
                AppError::with_message(ErrorCode::QueueItemNotFound, format!("queue item {id}"))
                    .with_detail("id", id)
            }
            QueueError::NotFailed(id) => AppError::validation(format!(
                "queue item {id} is still syncing"
            ))
            .with_detail("id", id),
            other => AppError::database(other.to_string()),
        }
    }
}

/// Client error type
#[derive(Debug, Error)]
pub enum ClientError {
    /// Link to the hub failed
    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    /// Local queue failed
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// Refused before anything was queued
    #[error("Rejected: {0}")]
    Rejected(AppError),

    /// Route not known on this device
    #[error("Unknown route: {0}")]
    UnknownRoute(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;

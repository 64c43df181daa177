use thiserror::Error;

use crate::dispatch::ManagerError;
use crate::planning::ProviderError;

/// Startup and serving failures
#[derive(Error, Debug)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] ManagerError),

    #[error("Distance provider setup failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, ServerError>;

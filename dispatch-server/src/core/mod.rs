//! Core module - configuration, state, server and background tasks
//!
//! - [`Config`] - environment configuration
//! - [`ServerState`] - services shared by the API, hub and workers
//! - [`Server`] - HTTP API plus sync hub listener
//! - [`ServerError`] - startup errors

pub mod config;
pub mod error;
pub mod event_router;
pub mod server;
pub mod state;
pub mod tasks;

pub use config::Config;
pub use error::{Result, ServerError};
pub use server::Server;
pub use state::ServerState;

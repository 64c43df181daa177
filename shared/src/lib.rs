//! Shared types for the dispatch stack
//!
//! Domain models, route commands/events/snapshots, the hub wire protocol and
//! the unified error system, used by dispatch-server and driver-client.

pub mod error;
pub mod message;
pub mod models;
pub mod route;
pub mod util;

// Re-exports
pub use axum::Json;
pub use http;
pub use serde::{Deserialize, Serialize};

pub use message::{BusMessage, EventType};

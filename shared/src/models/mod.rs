//! Data models
//!
//! Shared between dispatch-server, driver devices and consoles.

pub mod geo;
pub mod order;
pub mod vehicle;

// Re-exports
pub use geo::*;
pub use order::*;
pub use vehicle::*;

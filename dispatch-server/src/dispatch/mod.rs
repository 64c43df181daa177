//! Dispatch state machine
//!
//! Route and stop lifecycles, event sourced:
//!
//! - **actions**: one handler per command, validates and emits events
//! - **manager**: DispatchManager, per-route locking, persistence, broadcast
//! - **storage**: redb tables for events, snapshots, indices, orders, vehicles
//! - **repository**: persistence interface used by the planner and the API
//! - **sync**: reconnection catch-up (incremental events or full snapshot)
//! - **archive**: background archiving of finished routes
//!
//! # Architecture
//!
//! ```text
//! DispatchCommand → DispatchManager → SyncEvent(s) → Storage (redb)
//!                        ↓                               ↓
//!                    Broadcast                    Snapshot Update
//!                        ↓
//!                  Hub sessions
//! ```

pub mod actions;
pub mod archive;
pub mod manager;
pub mod repository;
pub mod storage;
pub mod sync;
pub mod traits;

// Re-exports
pub use archive::ArchiveWorker;
pub use manager::{DispatchManager, ManagerError, ManagerResult};
pub use repository::{OrderFilter, RepoError, RepoResult, Repository};
pub use storage::{DispatchStorage, StorageError, StorageResult, StorageStats};
pub use sync::{RouteSync, SyncResponse, SyncService};
pub use traits::{CommandMetadata, DispatchError, DispatchResult};

//! Command handling seams
//!
//! - [`CommandContext`]: transaction-scoped view actions read from; caches
//!   snapshots and hands out per-route sequence numbers
//! - [`CommandHandler`]: implemented by every action; validates a command
//!   against current state and returns the events it produces
//! - [`DispatchError`]: action-level rejections

use std::collections::{BTreeMap, HashMap};

use redb::WriteTransaction;
use shared::error::{AppError, ErrorCode};
use shared::route::{EventOrigin, RouteSnapshot, SyncEvent};
use thiserror::Error;

use super::storage::{DispatchStorage, StorageError};

/// Who issued the command, copied into every event it produces
#[derive(Debug, Clone)]
pub struct CommandMetadata {
    pub command_id: String,
    pub origin: EventOrigin,
    pub actor: Option<String>,
    pub timestamp: i64,
    /// Last route sequence the issuer had seen
    pub observed_sequence: Option<u64>,
}

impl CommandMetadata {
    pub fn from_command(cmd: &shared::route::DispatchCommand) -> Self {
        Self {
            command_id: cmd.command_id.clone(),
            origin: cmd.origin,
            actor: cmd.actor.clone(),
            timestamp: cmd.timestamp,
            observed_sequence: cmd.observed_sequence,
        }
    }
}

/// Action-level errors; none of them leave partial state behind
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Route not found: {0}")]
    RouteNotFound(String),

    #[error("Route is archived: {0}")]
    RouteArchived(String),

    #[error("Stop {order_id} not found on route {route_id}")]
    StopNotFound { route_id: String, order_id: String },

    #[error("Illegal transition: {0}")]
    IllegalTransition(String),

    #[error("Capacity exceeded on route {route_id}: demand {demand} > capacity {capacity}")]
    CapacityExceeded {
        route_id: String,
        demand: u32,
        capacity: u32,
    },

    #[error("Order {order_id} already has an active stop on route {route_id}")]
    OrderAlreadyRouted { order_id: String, route_id: String },

    #[error("Sync conflict: {0}")]
    SyncConflict(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

impl DispatchError {
    pub fn illegal(entity: &str, from: impl std::fmt::Display, to: impl std::fmt::Display) -> Self {
        Self::IllegalTransition(format!("{entity} cannot go from {from} to {to}"))
    }
}

impl From<DispatchError> for AppError {
    fn from(err: DispatchError) -> Self {
        let message = err.to_string();
        match err {
            DispatchError::RouteNotFound(id) => AppError::route_not_found(id),
            DispatchError::RouteArchived(id) => {
                AppError::with_message(ErrorCode::RouteArchived, message).with_detail("route_id", id)
            }
            DispatchError::StopNotFound { route_id, order_id } => {
                AppError::stop_not_found(route_id, order_id)
            }
            DispatchError::IllegalTransition(_) => AppError::illegal_transition(message),
            DispatchError::CapacityExceeded {
                route_id,
                demand,
                capacity,
            } => AppError::with_message(ErrorCode::CapacityExceeded, message)
                .with_detail("route_id", route_id)
                .with_detail("demand", demand)
                .with_detail("capacity", capacity),
            DispatchError::OrderAlreadyRouted { order_id, route_id } => {
                AppError::with_message(ErrorCode::OrderAlreadyRouted, message)
                    .with_detail("order_id", order_id)
                    .with_detail("route_id", route_id)
            }
            DispatchError::SyncConflict(_) => AppError::sync_conflict(message),
            DispatchError::InvalidOperation(_) => AppError::invalid_request(message),
            DispatchError::Storage(e) => AppError::database(e.to_string()),
        }
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;

/// Transaction-scoped state for one command
///
/// Snapshots are loaded lazily and cached; actions and the manager write
/// modified copies back with [`CommandContext::save_snapshot`].
pub struct CommandContext<'a> {
    txn: &'a WriteTransaction,
    storage: &'a DispatchStorage,
    snapshots: BTreeMap<String, RouteSnapshot>,
    modified: Vec<String>,
    sequences: HashMap<String, u64>,
}

impl<'a> CommandContext<'a> {
    pub fn new(txn: &'a WriteTransaction, storage: &'a DispatchStorage) -> Self {
        Self {
            txn,
            storage,
            snapshots: BTreeMap::new(),
            modified: Vec::new(),
            sequences: HashMap::new(),
        }
    }

    pub fn storage(&self) -> &DispatchStorage {
        self.storage
    }

    pub fn txn(&self) -> &WriteTransaction {
        self.txn
    }

    /// Current state of a route
    pub fn load_snapshot(&mut self, route_id: &str) -> DispatchResult<RouteSnapshot> {
        if let Some(snapshot) = self.snapshots.get(route_id) {
            return Ok(snapshot.clone());
        }
        match self.storage.get_snapshot_txn(self.txn, route_id)? {
            Some(snapshot) => {
                self.snapshots.insert(route_id.to_string(), snapshot.clone());
                Ok(snapshot)
            }
            None if self.storage.is_archived_txn(self.txn, route_id)? => {
                Err(DispatchError::RouteArchived(route_id.to_string()))
            }
            None => Err(DispatchError::RouteNotFound(route_id.to_string())),
        }
    }

    /// Whether the route id is taken (live or archived)
    pub fn route_exists(&mut self, route_id: &str) -> DispatchResult<bool> {
        match self.load_snapshot(route_id) {
            Ok(_) | Err(DispatchError::RouteArchived(_)) => Ok(true),
            Err(DispatchError::RouteNotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn save_snapshot(&mut self, snapshot: RouteSnapshot) {
        if !self.modified.contains(&snapshot.route_id) {
            self.modified.push(snapshot.route_id.clone());
        }
        self.snapshots.insert(snapshot.route_id.clone(), snapshot);
    }

    /// Allocate the next sequence number of a route
    pub fn next_sequence(&mut self, route_id: &str) -> DispatchResult<u64> {
        let current = match self.sequences.get(route_id) {
            Some(seq) => *seq,
            None => self.storage.route_sequence_txn(self.txn, route_id)?,
        };
        let next = current + 1;
        self.sequences.insert(route_id.to_string(), next);
        Ok(next)
    }

    /// Build an event with the next sequence of `route_id`
    pub fn event(
        &mut self,
        route_id: &str,
        origin: EventOrigin,
        metadata: &CommandMetadata,
        payload: shared::route::EventPayload,
    ) -> DispatchResult<SyncEvent> {
        let sequence = self.next_sequence(route_id)?;
        Ok(SyncEvent::new(
            route_id.to_string(),
            sequence,
            origin,
            metadata.actor.clone(),
            metadata.command_id.clone(),
            payload,
        ))
    }

    /// Route currently holding the order's stop
    pub fn route_for_order(&self, order_id: &str) -> DispatchResult<Option<String>> {
        Ok(self.storage.route_for_order_txn(self.txn, order_id)?)
    }

    /// Snapshots changed by this command, in first-modified order
    pub fn modified_snapshots(&self) -> impl Iterator<Item = &RouteSnapshot> {
        self.modified.iter().filter_map(|id| self.snapshots.get(id))
    }

    /// Sequences issued by this command
    pub fn issued_sequences(&self) -> &HashMap<String, u64> {
        &self.sequences
    }
}

/// Implemented by every dispatch action
///
/// Handlers only read through the context and return events; applying and
/// persisting them is the manager's job.
pub trait CommandHandler {
    fn execute(
        &self,
        ctx: &mut CommandContext<'_>,
        metadata: &CommandMetadata,
    ) -> DispatchResult<Vec<SyncEvent>>;
}

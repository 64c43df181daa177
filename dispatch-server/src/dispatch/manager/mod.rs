//! DispatchManager - Core command processing and event generation
//!
//! This module handles:
//! - Per-route serialization of commands
//! - Command validation through actions
//! - Per-route sequence numbers
//! - Persistence to redb (transactional)
//! - Snapshot and projection updates (order status, order index, vehicle position)
//! - Event broadcasting
//!
//! # Command Flow
//!
//! ```text
//! execute_command(cmd)
//!     ├─ 1. Idempotency check (command_id)
//!     ├─ 2. Lock touched routes (sorted)
//!     ├─ 3. Begin write transaction
//!     ├─ 4. Convert command to action and execute
//!     ├─ 5. Apply events to snapshots via EventApplier
//!     ├─ 6. Auto-complete finished routes
//!     ├─ 7. Update projections
//!     ├─ 8. Persist events, snapshots and sequences
//!     ├─ 9. Mark command processed and commit
//!     ├─ 10. Broadcast event(s), still under the route locks
//!     └─ 11. Return response
//! ```

mod error;
pub use error::*;

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use redb::WriteTransaction;
use shared::models::OrderStatus;
use shared::route::{
    AppliedSequence, CommandPayload, CommandResponse, DispatchCommand, EventOrigin, EventPayload,
    OverrideTarget, RouteSnapshot, RouteStatus, StopStatus, SyncEvent, apply_event,
};
use tokio::sync::broadcast;

use super::actions::CommandAction;
use super::storage::{DispatchStorage, StorageError};
use super::traits::{CommandContext, CommandHandler, CommandMetadata};

/// Event broadcast channel capacity
const EVENT_CHANNEL_CAPACITY: usize = 65536;

/// Attempts to lock the right route set when a stop moves concurrently
const LOCK_ATTEMPTS: usize = 3;

enum Outcome {
    Done(CommandResponse, Vec<SyncEvent>),
    /// The order index moved outside the locked set; lock again
    Relock,
}

/// DispatchManager for command processing
///
/// The `epoch` field is a unique identifier generated on each startup.
/// Clients use it to detect server restarts and trigger full resync.
pub struct DispatchManager {
    storage: DispatchStorage,
    event_tx: broadcast::Sender<SyncEvent>,
    /// Server instance epoch - unique ID generated on startup
    epoch: String,
    route_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for DispatchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchManager")
            .field("storage", &"<DispatchStorage>")
            .field("event_tx", &"<broadcast::Sender>")
            .field("epoch", &self.epoch)
            .finish()
    }
}

impl DispatchManager {
    /// Create a new DispatchManager with the given database path
    pub fn new(db_path: impl AsRef<Path>) -> ManagerResult<Self> {
        let storage = DispatchStorage::open(db_path)?;
        let manager = Self::with_storage(storage);
        tracing::info!(epoch = %manager.epoch, "DispatchManager started with new epoch");
        Ok(manager)
    }

    /// Create a DispatchManager over existing storage
    pub fn with_storage(storage: DispatchStorage) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            storage,
            event_tx,
            epoch: uuid::Uuid::new_v4().to_string(),
            route_locks: Arc::new(DashMap::new()),
        }
    }

    /// Get the server epoch (unique instance ID)
    pub fn epoch(&self) -> &str {
        &self.epoch
    }

    /// Subscribe to committed events, in per-route sequence order
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    /// Get the underlying storage
    pub fn storage(&self) -> &DispatchStorage {
        &self.storage
    }

    /// Execute a command and return the response
    pub fn execute_command(&self, cmd: DispatchCommand) -> CommandResponse {
        self.execute_command_with_events(cmd).0
    }

    /// Execute a command and return both the response and the committed events
    pub fn execute_command_with_events(
        &self,
        cmd: DispatchCommand,
    ) -> (CommandResponse, Vec<SyncEvent>) {
        match self.process_command(&cmd) {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(
                    command_id = %cmd.command_id,
                    command = cmd.payload.name(),
                    error = %err,
                    "Command rejected"
                );
                (CommandResponse::error(cmd.command_id, err.into()), vec![])
            }
        }
    }

    fn route_lock(&self, route_id: &str) -> Arc<Mutex<()>> {
        self.route_locks
            .entry(route_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Routes a command may touch, sorted
    ///
    /// A driver stop update may reclaim its stop from the route the stop was
    /// reassigned to, so that route is locked as well.
    fn lock_set(&self, cmd: &DispatchCommand) -> ManagerResult<BTreeSet<String>> {
        let mut ids: BTreeSet<String> = cmd.route_ids().into_iter().collect();
        if let CommandPayload::UpdateStopStatus { order_id, .. } = &cmd.payload
            && let Some(holder) = self.storage.route_for_order(order_id)?
        {
            ids.insert(holder);
        }
        Ok(ids)
    }

    fn process_command(
        &self,
        cmd: &DispatchCommand,
    ) -> ManagerResult<(CommandResponse, Vec<SyncEvent>)> {
        tracing::debug!(command_id = %cmd.command_id, payload = ?cmd.payload, "Processing command");

        // 1. Idempotency check (before locking)
        if self.storage.is_command_processed(&cmd.command_id)? {
            tracing::warn!(command_id = %cmd.command_id, "Duplicate command");
            return Ok((CommandResponse::duplicate(cmd.command_id.clone()), vec![]));
        }

        for _ in 0..LOCK_ATTEMPTS {
            // 2. Lock in sorted order
            let route_ids = self.lock_set(cmd)?;
            let locks: Vec<Arc<Mutex<()>>> = route_ids.iter().map(|id| self.route_lock(id)).collect();
            let _guards: Vec<_> = locks.iter().map(|lock| lock.lock()).collect();

            match self.process_locked(cmd, &route_ids)? {
                Outcome::Done(response, events) => return Ok((response, events)),
                Outcome::Relock => {
                    tracing::debug!(command_id = %cmd.command_id, "Order moved while locking, retrying");
                }
            }
        }

        Err(ManagerError::Internal(format!(
            "could not lock routes for command {}",
            cmd.command_id
        )))
    }

    fn process_locked(
        &self,
        cmd: &DispatchCommand,
        locked: &BTreeSet<String>,
    ) -> ManagerResult<Outcome> {
        // 3. Begin write transaction
        let txn = self.storage.begin_write()?;

        // Double-check idempotency within transaction
        if self.storage.is_command_processed_txn(&txn, &cmd.command_id)? {
            return Ok(Outcome::Done(
                CommandResponse::duplicate(cmd.command_id.clone()),
                vec![],
            ));
        }

        if let CommandPayload::UpdateStopStatus { order_id, .. } = &cmd.payload
            && let Some(holder) = self.storage.route_for_order_txn(&txn, order_id)?
            && !locked.contains(&holder)
        {
            return Ok(Outcome::Relock);
        }

        // 4. Convert to action and execute
        let mut ctx = CommandContext::new(&txn, &self.storage);
        let metadata = CommandMetadata::from_command(cmd);
        let action = CommandAction::from(cmd);
        let mut events = action.execute(&mut ctx, &metadata)?;

        // 5. Apply events to snapshots
        for event in &events {
            apply_to_context(&mut ctx, event)?;
        }

        // 6. Routes whose last stop just finished complete themselves
        let finished: Vec<RouteSnapshot> = ctx
            .modified_snapshots()
            .filter(|s| s.status == RouteStatus::InProgress && s.all_stops_terminal())
            .cloned()
            .collect();
        for snapshot in finished {
            let event = ctx.event(
                &snapshot.route_id,
                EventOrigin::System,
                &metadata,
                EventPayload::RouteStatusChanged {
                    from: RouteStatus::InProgress,
                    to: RouteStatus::Completed,
                    vehicle_id: None,
                    capacity: None,
                    reason: Some("all stops finished".to_string()),
                },
            )?;
            apply_to_context(&mut ctx, &event)?;
            events.push(event);
        }

        // 7. Projections
        for event in &events {
            self.project(&txn, &ctx, event)?;
        }

        // 8. Persist events, snapshots, sequences
        for event in &events {
            self.storage.store_event(&txn, event)?;
        }
        for snapshot in ctx.modified_snapshots() {
            self.storage.store_snapshot(&txn, snapshot)?;
        }
        for (route_id, sequence) in ctx.issued_sequences() {
            self.storage.set_route_sequence(&txn, route_id, *sequence)?;
        }

        // 9. Mark command processed and commit
        self.storage.mark_command_processed(&txn, &cmd.command_id)?;
        drop(ctx);
        txn.commit().map_err(StorageError::from)?;

        // 10. Broadcast under the route locks so delivery order matches sequence order
        for event in &events {
            if self.event_tx.send(event.clone()).is_err() {
                tracing::trace!("Event broadcast skipped: no active receivers");
                break;
            }
        }

        if let CommandPayload::ForceState {
            route_id,
            target,
            reason,
        } = &cmd.payload
        {
            tracing::warn!(
                target: "dispatch::override",
                command_id = %cmd.command_id,
                route_id = %route_id,
                target_state = ?target,
                actor = ?cmd.actor,
                reason = %reason,
                "Manual override applied"
            );
        }

        // 11. Return response
        let sequences = events
            .iter()
            .map(|e| AppliedSequence {
                route_id: e.route_id.clone(),
                sequence: e.sequence,
            })
            .collect();
        tracing::info!(
            command_id = %cmd.command_id,
            command = cmd.payload.name(),
            event_count = events.len(),
            "Command processed successfully"
        );
        Ok(Outcome::Done(
            CommandResponse::success(cmd.command_id.clone(), sequences),
            events,
        ))
    }

    /// Keep order status, order index and vehicle position in step with
    /// route events
    fn project(
        &self,
        txn: &WriteTransaction,
        ctx: &CommandContext<'_>,
        event: &SyncEvent,
    ) -> ManagerResult<()> {
        match &event.payload {
            EventPayload::RouteCreated { stops, .. } => {
                for stop in stops {
                    self.storage.index_order(txn, &stop.order_id, &event.route_id)?;
                    self.set_order_status(txn, &stop.order_id, OrderStatus::Assigned)?;
                }
            }
            EventPayload::OrderAdded { stop, .. } => {
                self.storage.index_order(txn, &stop.order_id, &event.route_id)?;
                self.set_order_status(txn, &stop.order_id, OrderStatus::Assigned)?;
            }
            EventPayload::RouteReassigned {
                order_id,
                to_route_id,
                ..
            } if *to_route_id == event.route_id => {
                self.storage.index_order(txn, order_id, to_route_id)?;
            }
            EventPayload::StopStatusChanged { order_id, to, .. } => {
                if let Some(status) = order_status_for(*to) {
                    self.set_order_status(txn, order_id, status)?;
                }
            }
            EventPayload::OverrideApplied {
                target: OverrideTarget::Stop { order_id, status },
                ..
            } => {
                let status = order_status_for(*status).unwrap_or(OrderStatus::Assigned);
                self.set_order_status(txn, order_id, status)?;
            }
            EventPayload::RouteStatusChanged {
                to: RouteStatus::Cancelled,
                ..
            }
            | EventPayload::OverrideApplied {
                target: OverrideTarget::Route {
                    status: RouteStatus::Cancelled,
                },
                ..
            } => {
                let Some(snapshot) = ctx
                    .modified_snapshots()
                    .find(|s| s.route_id == event.route_id)
                else {
                    return Ok(());
                };
                for stop in snapshot.stops.iter().filter(|s| !s.is_terminal()) {
                    self.storage.unindex_order(txn, &stop.order_id, &event.route_id)?;
                    self.set_order_status(txn, &stop.order_id, OrderStatus::Unassigned)?;
                }
            }
            EventPayload::LocationUpdate {
                location,
                recorded_at,
            } => {
                let Some(snapshot) = ctx
                    .modified_snapshots()
                    .find(|s| s.route_id == event.route_id)
                else {
                    return Ok(());
                };
                if let Some(mut vehicle) = self.storage.get_vehicle_txn(txn, &snapshot.vehicle_id)?
                    && vehicle.location_updated_at.is_none_or(|at| *recorded_at >= at)
                {
                    vehicle.current_location = Some(*location);
                    vehicle.location_updated_at = Some(*recorded_at);
                    self.storage.store_vehicle(txn, &vehicle)?;
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Orders created outside intake have no record; nothing to update then
    fn set_order_status(
        &self,
        txn: &WriteTransaction,
        order_id: &str,
        status: OrderStatus,
    ) -> ManagerResult<()> {
        if let Some(mut order) = self.storage.get_order_txn(txn, order_id)?
            && order.status != status
        {
            order.status = status;
            self.storage.store_order(txn, &order)?;
        }
        Ok(())
    }

    // ========== Public Query Methods ==========

    /// Live snapshot, falling back to the archive
    pub fn get_snapshot(&self, route_id: &str) -> ManagerResult<Option<RouteSnapshot>> {
        match self.storage.get_snapshot(route_id)? {
            Some(snapshot) => Ok(Some(snapshot)),
            None => Ok(self.storage.get_archived(route_id)?),
        }
    }

    /// All routes that are not completed or cancelled
    pub fn get_active_routes(&self) -> ManagerResult<Vec<RouteSnapshot>> {
        let mut routes: Vec<RouteSnapshot> = self
            .storage
            .get_all_snapshots()?
            .into_iter()
            .filter(RouteSnapshot::is_active)
            .collect();
        routes.sort_by(|a, b| a.route_id.cmp(&b.route_id));
        Ok(routes)
    }

    /// Live routes driven by one vehicle
    pub fn get_routes_for_vehicle(&self, vehicle_id: &str) -> ManagerResult<Vec<RouteSnapshot>> {
        Ok(self
            .get_active_routes()?
            .into_iter()
            .filter(|r| r.vehicle_id == vehicle_id)
            .collect())
    }

    /// Last issued sequence of a route
    pub fn route_sequence(&self, route_id: &str) -> ManagerResult<u64> {
        Ok(self.storage.route_sequence(route_id)?)
    }

    /// Events of a route after `since`
    pub fn get_events_since(&self, route_id: &str, since: u64) -> ManagerResult<Vec<SyncEvent>> {
        Ok(self.storage.get_route_events_since(route_id, since)?)
    }

    pub fn count_events_since(&self, route_id: &str, since: u64) -> ManagerResult<u64> {
        Ok(self.storage.count_route_events_since(route_id, since)?)
    }

    /// Rebuild a snapshot from events (for verification)
    pub fn rebuild_snapshot(&self, route_id: &str) -> ManagerResult<RouteSnapshot> {
        let events = self.storage.get_events_for_route(route_id)?;
        if events.is_empty() {
            return Err(ManagerError::RouteNotFound(route_id.to_string()));
        }

        let mut snapshot = RouteSnapshot::new(route_id.to_string());
        for event in &events {
            apply_event(&mut snapshot, event);
        }
        Ok(snapshot)
    }

    /// Compare the stored snapshot with a replay of the event log
    pub fn verify_route(&self, route_id: &str) -> ManagerResult<bool> {
        let stored = self
            .storage
            .get_snapshot(route_id)?
            .ok_or_else(|| ManagerError::RouteNotFound(route_id.to_string()))?;
        let rebuilt = self.rebuild_snapshot(route_id)?;
        let consistent = stored.verify_checksum() && stored.state_checksum == rebuilt.state_checksum;
        if !consistent {
            tracing::error!(
                route_id = %route_id,
                stored = %stored.state_checksum,
                rebuilt = %rebuilt.state_checksum,
                "Route snapshot drifted from its event log"
            );
        }
        Ok(consistent)
    }

    /// Archive a finished route, holding its lock
    pub fn archive_route(&self, route_id: &str) -> ManagerResult<RouteSnapshot> {
        let lock = self.route_lock(route_id);
        let _guard = lock.lock();

        let snapshot = self
            .storage
            .get_snapshot(route_id)?
            .ok_or_else(|| ManagerError::RouteNotFound(route_id.to_string()))?;
        if snapshot.is_active() {
            return Err(ManagerError::Rejected(
                super::traits::DispatchError::IllegalTransition(format!(
                    "route {route_id} is still {}",
                    snapshot.status
                )),
            ));
        }

        let archived = self.storage.archive_route(route_id)?;
        self.route_locks.remove(route_id);
        Ok(archived)
    }
}

/// Apply an event to its route's snapshot within the command
fn apply_to_context(ctx: &mut CommandContext<'_>, event: &SyncEvent) -> ManagerResult<()> {
    let mut snapshot = match &event.payload {
        EventPayload::RouteCreated { .. } => RouteSnapshot::new(event.route_id.clone()),
        _ => ctx.load_snapshot(&event.route_id)?,
    };
    apply_event(&mut snapshot, event);
    ctx.save_snapshot(snapshot);
    Ok(())
}

fn order_status_for(stop: StopStatus) -> Option<OrderStatus> {
    match stop {
        StopStatus::Completed => Some(OrderStatus::Delivered),
        StopStatus::Failed => Some(OrderStatus::Failed),
        _ => None,
    }
}

// Make DispatchManager Clone-able via Arc
impl Clone for DispatchManager {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
            event_tx: self.event_tx.clone(),
            epoch: self.epoch.clone(),
            route_locks: self.route_locks.clone(),
        }
    }
}

#[cfg(test)]
mod tests;

//! redb-based storage layer for route event sourcing
//!
//! # Tables
//!
//! | Table | Key | Value | Purpose |
//! |-------|-----|-------|---------|
//! | `events` | `(route_id, sequence)` | `SyncEvent` | Per-route event stream (append-only) |
//! | `snapshots` | `route_id` | `RouteSnapshot` | Snapshot cache |
//! | `processed_commands` | `command_id` | `()` | Idempotency check |
//! | `route_sequences` | `route_id` | `u64` | Last issued sequence per route |
//! | `order_index` | `order_id` | `route_id` | Route currently holding the order's stop |
//! | `orders` | `order_id` | `Order` | Order intake records |
//! | `vehicles` | `vehicle_id` | `Vehicle` | Fleet |
//! | `archived_routes` | `route_id` | `RouteSnapshot` | Final state of archived routes |
//!
//! Values are JSON. redb commits with `Durability::Immediate`, so a command
//! is durable once `commit()` returns.

use redb::{
    Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition,
    WriteTransaction,
};
use shared::models::{Order, Vehicle};
use shared::route::{RouteSnapshot, SyncEvent};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

const EVENTS_TABLE: TableDefinition<(&str, u64), &[u8]> = TableDefinition::new("events");

const SNAPSHOTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshots");

const PROCESSED_COMMANDS_TABLE: TableDefinition<&str, ()> =
    TableDefinition::new("processed_commands");

const ROUTE_SEQUENCES_TABLE: TableDefinition<&str, u64> = TableDefinition::new("route_sequences");

const ORDER_INDEX_TABLE: TableDefinition<&str, &str> = TableDefinition::new("order_index");

const ORDERS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("orders");

const VEHICLES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("vehicles");

const ARCHIVED_ROUTES_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("archived_routes");

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
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

    #[error("Route not found: {0}")]
    RouteNotFound(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Counts for the health endpoint
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct StorageStats {
    pub event_count: u64,
    pub route_count: u64,
    pub order_count: u64,
    pub vehicle_count: u64,
    pub archived_count: u64,
}

/// Dispatch storage backed by redb
#[derive(Clone)]
pub struct DispatchStorage {
    db: Arc<Database>,
}

impl std::fmt::Debug for DispatchStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DispatchStorage").finish_non_exhaustive()
    }
}

impl DispatchStorage {
    /// Open or create the database at the given path
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let db = Database::create(path)?;
        Self::init(db)
    }

    /// Open an in-memory database (for testing)
    #[cfg(test)]
    pub fn open_in_memory() -> StorageResult<Self> {
        let db = Database::builder().create_with_backend(redb::backends::InMemoryBackend::new())?;
        Self::init(db)
    }

    fn init(db: Database) -> StorageResult<Self> {
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(EVENTS_TABLE)?;
            let _ = write_txn.open_table(SNAPSHOTS_TABLE)?;
            let _ = write_txn.open_table(PROCESSED_COMMANDS_TABLE)?;
            let _ = write_txn.open_table(ROUTE_SEQUENCES_TABLE)?;
            let _ = write_txn.open_table(ORDER_INDEX_TABLE)?;
            let _ = write_txn.open_table(ORDERS_TABLE)?;
            let _ = write_txn.open_table(VEHICLES_TABLE)?;
            let _ = write_txn.open_table(ARCHIVED_ROUTES_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Begin a write transaction
    pub fn begin_write(&self) -> StorageResult<WriteTransaction> {
        Ok(self.db.begin_write()?)
    }

    // ========== Sequence Operations ==========

    /// Last issued sequence of a route (within transaction)
    pub fn route_sequence_txn(&self, txn: &WriteTransaction, route_id: &str) -> StorageResult<u64> {
        let table = txn.open_table(ROUTE_SEQUENCES_TABLE)?;
        Ok(table.get(route_id)?.map(|g| g.value()).unwrap_or(0))
    }

    /// Last issued sequence of a route (read-only)
    pub fn route_sequence(&self, route_id: &str) -> StorageResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ROUTE_SEQUENCES_TABLE)?;
        Ok(table.get(route_id)?.map(|g| g.value()).unwrap_or(0))
    }

    pub fn set_route_sequence(
        &self,
        txn: &WriteTransaction,
        route_id: &str,
        sequence: u64,
    ) -> StorageResult<()> {
        let mut table = txn.open_table(ROUTE_SEQUENCES_TABLE)?;
        table.insert(route_id, sequence)?;
        Ok(())
    }

    // ========== Command Idempotency ==========

    /// Check if a command has been processed
    pub fn is_command_processed(&self, command_id: &str) -> StorageResult<bool> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(PROCESSED_COMMANDS_TABLE)?;
        Ok(table.get(command_id)?.is_some())
    }

    /// Check if a command has been processed (within transaction)
    pub fn is_command_processed_txn(
        &self,
        txn: &WriteTransaction,
        command_id: &str,
    ) -> StorageResult<bool> {
        let table = txn.open_table(PROCESSED_COMMANDS_TABLE)?;
        Ok(table.get(command_id)?.is_some())
    }

    /// Mark a command as processed
    pub fn mark_command_processed(
        &self,
        txn: &WriteTransaction,
        command_id: &str,
    ) -> StorageResult<()> {
        let mut table = txn.open_table(PROCESSED_COMMANDS_TABLE)?;
        table.insert(command_id, ())?;
        Ok(())
    }

    // ========== Event Operations ==========

    /// Store an event
    pub fn store_event(&self, txn: &WriteTransaction, event: &SyncEvent) -> StorageResult<()> {
        let mut table = txn.open_table(EVENTS_TABLE)?;
        let key = (event.route_id.as_str(), event.sequence);
        let value = serde_json::to_vec(event)?;
        table.insert(key, value.as_slice())?;
        Ok(())
    }

    /// All events of a route, by sequence
    pub fn get_events_for_route(&self, route_id: &str) -> StorageResult<Vec<SyncEvent>> {
        self.get_route_events_since(route_id, 0)
    }

    /// Events of a route with sequence greater than `since`
    pub fn get_route_events_since(&self, route_id: &str, since: u64) -> StorageResult<Vec<SyncEvent>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(EVENTS_TABLE)?;

        let mut events = Vec::new();
        let Some(start) = since.checked_add(1) else {
            return Ok(events);
        };
        for result in table.range((route_id, start)..=(route_id, u64::MAX))? {
            let (_key, value) = result?;
            let event: SyncEvent = serde_json::from_slice(value.value())?;
            events.push(event);
        }

        events.sort_by_key(|e| e.sequence);
        Ok(events)
    }

    /// Number of events after `since` without decoding them
    pub fn count_route_events_since(&self, route_id: &str, since: u64) -> StorageResult<u64> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(EVENTS_TABLE)?;
        let Some(start) = since.checked_add(1) else {
            return Ok(0);
        };
        let mut count = 0;
        for result in table.range((route_id, start)..=(route_id, u64::MAX))? {
            result?;
            count += 1;
        }
        Ok(count)
    }

    fn remove_events_for_route(&self, txn: &WriteTransaction, route_id: &str) -> StorageResult<usize> {
        let mut table = txn.open_table(EVENTS_TABLE)?;
        let mut keys_to_remove: Vec<u64> = Vec::new();
        for result in table.range((route_id, 0u64)..=(route_id, u64::MAX))? {
            let (key, _) = result?;
            keys_to_remove.push(key.value().1);
        }
        for seq in &keys_to_remove {
            table.remove((route_id, *seq))?;
        }
        Ok(keys_to_remove.len())
    }

    // ========== Snapshot Operations ==========

    /// Store a snapshot
    pub fn store_snapshot(&self, txn: &WriteTransaction, snapshot: &RouteSnapshot) -> StorageResult<()> {
        let mut table = txn.open_table(SNAPSHOTS_TABLE)?;
        let value = serde_json::to_vec(snapshot)?;
        table.insert(snapshot.route_id.as_str(), value.as_slice())?;
        Ok(())
    }

    /// Get a snapshot by route ID
    pub fn get_snapshot(&self, route_id: &str) -> StorageResult<Option<RouteSnapshot>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SNAPSHOTS_TABLE)?;
        match table.get(route_id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Get a snapshot by route ID (within transaction)
    pub fn get_snapshot_txn(
        &self,
        txn: &WriteTransaction,
        route_id: &str,
    ) -> StorageResult<Option<RouteSnapshot>> {
        let table = txn.open_table(SNAPSHOTS_TABLE)?;
        match table.get(route_id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// All live (not archived) snapshots
    pub fn get_all_snapshots(&self) -> StorageResult<Vec<RouteSnapshot>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(SNAPSHOTS_TABLE)?;

        let mut snapshots = Vec::new();
        for result in table.iter()? {
            let (_key, value) = result?;
            snapshots.push(serde_json::from_slice(value.value())?);
        }
        Ok(snapshots)
    }

    // ========== Order Index ==========

    /// Route currently holding the order's stop (within transaction)
    pub fn route_for_order_txn(
        &self,
        txn: &WriteTransaction,
        order_id: &str,
    ) -> StorageResult<Option<String>> {
        let table = txn.open_table(ORDER_INDEX_TABLE)?;
        Ok(table.get(order_id)?.map(|g| g.value().to_string()))
    }

    pub fn route_for_order(&self, order_id: &str) -> StorageResult<Option<String>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ORDER_INDEX_TABLE)?;
        Ok(table.get(order_id)?.map(|g| g.value().to_string()))
    }

    pub fn index_order(&self, txn: &WriteTransaction, order_id: &str, route_id: &str) -> StorageResult<()> {
        let mut table = txn.open_table(ORDER_INDEX_TABLE)?;
        table.insert(order_id, route_id)?;
        Ok(())
    }

    /// Drop the index entry if it still points at `route_id`
    pub fn unindex_order(&self, txn: &WriteTransaction, order_id: &str, route_id: &str) -> StorageResult<()> {
        let mut table = txn.open_table(ORDER_INDEX_TABLE)?;
        let points_here = table
            .get(order_id)?
            .is_some_and(|g| g.value() == route_id);
        if points_here {
            table.remove(order_id)?;
        }
        Ok(())
    }

    // ========== Orders ==========

    pub fn store_order(&self, txn: &WriteTransaction, order: &Order) -> StorageResult<()> {
        let mut table = txn.open_table(ORDERS_TABLE)?;
        let value = serde_json::to_vec(order)?;
        table.insert(order.id.as_str(), value.as_slice())?;
        Ok(())
    }

    pub fn get_order_txn(&self, txn: &WriteTransaction, order_id: &str) -> StorageResult<Option<Order>> {
        let table = txn.open_table(ORDERS_TABLE)?;
        match table.get(order_id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    pub fn get_order(&self, order_id: &str) -> StorageResult<Option<Order>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ORDERS_TABLE)?;
        match table.get(order_id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    pub fn get_all_orders(&self) -> StorageResult<Vec<Order>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ORDERS_TABLE)?;
        let mut orders = Vec::new();
        for result in table.iter()? {
            let (_key, value) = result?;
            orders.push(serde_json::from_slice(value.value())?);
        }
        Ok(orders)
    }

    /// Insert or replace an order in its own transaction
    pub fn upsert_order(&self, order: &Order) -> StorageResult<()> {
        let txn = self.begin_write()?;
        self.store_order(&txn, order)?;
        txn.commit()?;
        Ok(())
    }

    pub fn delete_order(&self, order_id: &str) -> StorageResult<bool> {
        let txn = self.begin_write()?;
        let removed = {
            let mut table = txn.open_table(ORDERS_TABLE)?;
            table.remove(order_id)?.is_some()
        };
        txn.commit()?;
        Ok(removed)
    }

    // ========== Vehicles ==========

    pub fn store_vehicle(&self, txn: &WriteTransaction, vehicle: &Vehicle) -> StorageResult<()> {
        let mut table = txn.open_table(VEHICLES_TABLE)?;
        let value = serde_json::to_vec(vehicle)?;
        table.insert(vehicle.id.as_str(), value.as_slice())?;
        Ok(())
    }

    pub fn get_vehicle_txn(
        &self,
        txn: &WriteTransaction,
        vehicle_id: &str,
    ) -> StorageResult<Option<Vehicle>> {
        let table = txn.open_table(VEHICLES_TABLE)?;
        match table.get(vehicle_id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    pub fn upsert_vehicle(&self, vehicle: &Vehicle) -> StorageResult<()> {
        let txn = self.begin_write()?;
        self.store_vehicle(&txn, vehicle)?;
        txn.commit()?;
        Ok(())
    }

    pub fn get_vehicle(&self, vehicle_id: &str) -> StorageResult<Option<Vehicle>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(VEHICLES_TABLE)?;
        match table.get(vehicle_id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    pub fn get_all_vehicles(&self) -> StorageResult<Vec<Vehicle>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(VEHICLES_TABLE)?;
        let mut vehicles = Vec::new();
        for result in table.iter()? {
            let (_key, value) = result?;
            vehicles.push(serde_json::from_slice(value.value())?);
        }
        Ok(vehicles)
    }

    pub fn delete_vehicle(&self, vehicle_id: &str) -> StorageResult<bool> {
        let txn = self.begin_write()?;
        let removed = {
            let mut table = txn.open_table(VEHICLES_TABLE)?;
            table.remove(vehicle_id)?.is_some()
        };
        txn.commit()?;
        Ok(removed)
    }

    // ========== Archive ==========

    pub fn is_archived_txn(&self, txn: &WriteTransaction, route_id: &str) -> StorageResult<bool> {
        let table = txn.open_table(ARCHIVED_ROUTES_TABLE)?;
        Ok(table.get(route_id)?.is_some())
    }

    pub fn get_archived(&self, route_id: &str) -> StorageResult<Option<RouteSnapshot>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(ARCHIVED_ROUTES_TABLE)?;
        match table.get(route_id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Move a route out of the live tables
    ///
    /// Stores the final snapshot in `archived_routes`, then drops the live
    /// snapshot, the event log, the sequence counter and any order index
    /// entries still pointing at the route. The sequence counter goes too:
    /// archived routes reject further commands.
    pub fn archive_route(&self, route_id: &str) -> StorageResult<RouteSnapshot> {
        let txn = self.begin_write()?;
        let snapshot = self
            .get_snapshot_txn(&txn, route_id)?
            .ok_or_else(|| StorageError::RouteNotFound(route_id.to_string()))?;

        {
            let mut table = txn.open_table(ARCHIVED_ROUTES_TABLE)?;
            let value = serde_json::to_vec(&snapshot)?;
            table.insert(route_id, value.as_slice())?;
        }
        {
            let mut table = txn.open_table(SNAPSHOTS_TABLE)?;
            table.remove(route_id)?;
        }
        {
            let mut table = txn.open_table(ROUTE_SEQUENCES_TABLE)?;
            table.remove(route_id)?;
        }
        let removed_events = self.remove_events_for_route(&txn, route_id)?;
        for stop in &snapshot.stops {
            self.unindex_order(&txn, &stop.order_id, route_id)?;
        }

        txn.commit()?;
        tracing::debug!(route_id = %route_id, removed_events, "Route archived");
        Ok(snapshot)
    }

    // ========== Stats ==========

    pub fn get_stats(&self) -> StorageResult<StorageStats> {
        let read_txn = self.db.begin_read()?;
        Ok(StorageStats {
            event_count: read_txn.open_table(EVENTS_TABLE)?.len()?,
            route_count: read_txn.open_table(SNAPSHOTS_TABLE)?.len()?,
            order_count: read_txn.open_table(ORDERS_TABLE)?.len()?,
            vehicle_count: read_txn.open_table(VEHICLES_TABLE)?.len()?,
            archived_count: read_txn.open_table(ARCHIVED_ROUTES_TABLE)?.len()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use shared::models::{GeoPoint, OrderStatus, PriorityTier, ShiftWindow};
    use shared::route::{EventOrigin, EventPayload};

    fn create_test_event(route_id: &str, sequence: u64) -> SyncEvent {
        SyncEvent::new(
            route_id.to_string(),
            sequence,
            EventOrigin::Driver,
            None,
            format!("cmd-{sequence}"),
            EventPayload::LocationUpdate {
                location: GeoPoint::new(40.0, -3.0),
                recorded_at: sequence as i64,
            },
        )
    }

    fn create_test_order(id: &str) -> Order {
        Order {
            id: id.to_string(),
            location: GeoPoint::new(40.0, -3.0),
            demand: 1,
            priority: PriorityTier::Normal,
            time_window: None,
            status: OrderStatus::Unassigned,
            planning_date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            created_at: 0,
        }
    }

    #[test]
    fn test_route_sequence() {
        let storage = DispatchStorage::open_in_memory().unwrap();
        let txn = storage.begin_write().unwrap();
        assert_eq!(storage.route_sequence_txn(&txn, "r-1").unwrap(), 0);
        storage.set_route_sequence(&txn, "r-1", 5).unwrap();
        txn.commit().unwrap();

        assert_eq!(storage.route_sequence("r-1").unwrap(), 5);
        assert_eq!(storage.route_sequence("r-2").unwrap(), 0);
    }

    #[test]
    fn test_command_idempotency() {
        let storage = DispatchStorage::open_in_memory().unwrap();
        assert!(!storage.is_command_processed("cmd-1").unwrap());

        let txn = storage.begin_write().unwrap();
        storage.mark_command_processed(&txn, "cmd-1").unwrap();
        txn.commit().unwrap();

        assert!(storage.is_command_processed("cmd-1").unwrap());
    }

    #[test]
    fn test_events_are_per_route() {
        let storage = DispatchStorage::open_in_memory().unwrap();
        let txn = storage.begin_write().unwrap();
        for seq in 1..=3 {
            storage.store_event(&txn, &create_test_event("r-1", seq)).unwrap();
        }
        storage.store_event(&txn, &create_test_event("r-2", 1)).unwrap();
        txn.commit().unwrap();

        let events = storage.get_events_for_route("r-1").unwrap();
        assert_eq!(events.iter().map(|e| e.sequence).collect::<Vec<_>>(), [1, 2, 3]);

        let since = storage.get_route_events_since("r-1", 1).unwrap();
        assert_eq!(since.len(), 2);
        assert_eq!(storage.count_route_events_since("r-1", 1).unwrap(), 2);
        assert_eq!(storage.count_route_events_since("r-2", 0).unwrap(), 1);
        assert!(storage.get_route_events_since("r-1", u64::MAX).unwrap().is_empty());
    }

    #[test]
    fn test_snapshot_storage() {
        let storage = DispatchStorage::open_in_memory().unwrap();
        let snapshot = RouteSnapshot::new("r-1".into());

        let txn = storage.begin_write().unwrap();
        storage.store_snapshot(&txn, &snapshot).unwrap();
        txn.commit().unwrap();

        let loaded = storage.get_snapshot("r-1").unwrap().unwrap();
        assert_eq!(loaded.route_id, "r-1");
        assert_eq!(storage.get_all_snapshots().unwrap().len(), 1);
    }

    #[test]
    fn test_order_index_only_drops_matching_route() {
        let storage = DispatchStorage::open_in_memory().unwrap();
        let txn = storage.begin_write().unwrap();
        storage.index_order(&txn, "o-1", "r-2").unwrap();
        storage.unindex_order(&txn, "o-1", "r-1").unwrap();
        txn.commit().unwrap();
        assert_eq!(storage.route_for_order("o-1").unwrap().as_deref(), Some("r-2"));
    }

    #[test]
    fn test_orders_and_vehicles() {
        let storage = DispatchStorage::open_in_memory().unwrap();
        storage.upsert_order(&create_test_order("o-1")).unwrap();
        storage
            .upsert_vehicle(&Vehicle {
                id: "v-1".into(),
                capacity: 6,
                shift: ShiftWindow::new(0, 1),
                depot: GeoPoint::new(40.0, -3.0),
                current_location: None,
                location_updated_at: None,
                available: true,
            })
            .unwrap();

        assert!(storage.get_order("o-1").unwrap().is_some());
        assert_eq!(storage.get_all_vehicles().unwrap().len(), 1);
        assert!(storage.delete_order("o-1").unwrap());
        assert!(!storage.delete_order("o-1").unwrap());

        let stats = storage.get_stats().unwrap();
        assert_eq!(stats.order_count, 0);
        assert_eq!(stats.vehicle_count, 1);
    }

    #[test]
    fn test_archive_route_cleans_live_tables() {
        let storage = DispatchStorage::open_in_memory().unwrap();
        let mut snapshot = RouteSnapshot::new("r-1".into());
        snapshot.stops.push(shared::route::StopSnapshot::from_planned(
            &shared::route::PlannedStop {
                order_id: "o-1".into(),
                location: GeoPoint::new(40.0, -3.0),
                demand: 1,
                priority: PriorityTier::Normal,
                time_window: None,
                planned_arrival: None,
            },
        ));

        let txn = storage.begin_write().unwrap();
        storage.store_snapshot(&txn, &snapshot).unwrap();
        storage.store_event(&txn, &create_test_event("r-1", 1)).unwrap();
        storage.set_route_sequence(&txn, "r-1", 1).unwrap();
        storage.index_order(&txn, "o-1", "r-1").unwrap();
        txn.commit().unwrap();

        storage.archive_route("r-1").unwrap();

        assert!(storage.get_snapshot("r-1").unwrap().is_none());
        assert!(storage.get_events_for_route("r-1").unwrap().is_empty());
        assert!(storage.route_for_order("o-1").unwrap().is_none());
        assert!(storage.get_archived("r-1").unwrap().is_some());
        assert!(matches!(
            storage.archive_route("r-1"),
            Err(StorageError::RouteNotFound(_))
        ));
    }
}

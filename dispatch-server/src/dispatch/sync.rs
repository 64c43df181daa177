//! Synchronization API for reconnecting clients
//!
//! Clients present one cursor per route (last applied sequence). For each
//! route the hub answers either with the missed events or, when the gap is
//! too large or the route left the live tables, with a full snapshot.
//!
//! # Guarantees
//!
//! - Events are ordered by sequence
//! - No gaps in sequence (can be validated)
//! - Full snapshot is always available as fallback

use serde::{Deserialize, Serialize};
use shared::message::{ResyncRequest, RouteCursor};
use shared::route::{RouteSnapshot, SyncEvent};

use super::manager::{DispatchManager, ManagerResult};

/// Maximum events to return in incremental sync
/// If gap exceeds this, a full snapshot is sent instead
pub const MAX_INCREMENTAL_EVENTS: usize = 1000;

/// Catch-up for one route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSync {
    pub route_id: String,
    /// Events after the cursor, empty on full sync
    pub events: Vec<SyncEvent>,
    /// Replacement state on full sync; `None` with `requires_full_sync`
    /// means the route is unknown and the client should drop it
    pub snapshot: Option<RouteSnapshot>,
    /// Route's current sequence
    pub server_sequence: u64,
    pub requires_full_sync: bool,
}

impl RouteSync {
    /// Create a full sync response
    pub fn full_sync(route_id: String, snapshot: Option<RouteSnapshot>) -> Self {
        let server_sequence = snapshot.as_ref().map(|s| s.last_sequence).unwrap_or(0);
        Self {
            route_id,
            events: vec![],
            snapshot,
            server_sequence,
            requires_full_sync: true,
        }
    }

    /// Create an incremental sync response
    pub fn incremental(route_id: String, events: Vec<SyncEvent>, server_sequence: u64) -> Self {
        Self {
            route_id,
            events,
            snapshot: None,
            server_sequence,
            requires_full_sync: false,
        }
    }
}

/// Sync response to client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    pub routes: Vec<RouteSync>,
    /// Server instance epoch (UUID generated on startup)
    /// Used to detect server restarts - if epoch changes, client must full sync
    pub server_epoch: String,
}

/// Sync service for handling reconnection
#[derive(Debug, Clone)]
pub struct SyncService {
    manager: DispatchManager,
}

impl SyncService {
    pub fn new(manager: DispatchManager) -> Self {
        Self { manager }
    }

    /// Handle a resync request
    ///
    /// A client that synced against another epoch gets full snapshots for
    /// every route regardless of its cursors.
    pub fn sync(
        &self,
        request: &ResyncRequest,
        client_epoch: Option<&str>,
    ) -> ManagerResult<SyncResponse> {
        let epoch = self.manager.epoch().to_string();
        let stale_epoch = client_epoch.is_some_and(|e| e != epoch);

        let mut routes = Vec::with_capacity(request.cursors.len());
        for cursor in &request.cursors {
            let sync = if stale_epoch {
                self.full(&cursor.route_id)?
            } else {
                self.sync_route(cursor)?
            };
            routes.push(sync);
        }

        Ok(SyncResponse {
            routes,
            server_epoch: epoch,
        })
    }

    /// Catch one route up from its cursor
    pub fn sync_route(&self, cursor: &RouteCursor) -> ManagerResult<RouteSync> {
        let route_id = &cursor.route_id;
        let server_sequence = self.manager.route_sequence(route_id)?;

        // Archived or never existed: the event log is gone
        if server_sequence == 0 {
            return self.full(route_id);
        }

        // If client is up to date, return empty response
        if cursor.last_sequence >= server_sequence {
            return Ok(RouteSync::incremental(route_id.clone(), vec![], server_sequence));
        }

        let gap = server_sequence - cursor.last_sequence;
        if gap > MAX_INCREMENTAL_EVENTS as u64 {
            tracing::debug!(route_id = %route_id, gap, "Gap too large, sending full snapshot");
            return self.full(route_id);
        }

        let events = self.manager.get_events_since(route_id, cursor.last_sequence)?;

        // Double-check: if we got too many events, fall back to full sync
        if events.len() > MAX_INCREMENTAL_EVENTS {
            return self.full(route_id);
        }

        Ok(RouteSync::incremental(route_id.clone(), events, server_sequence))
    }

    fn full(&self, route_id: &str) -> ManagerResult<RouteSync> {
        let snapshot = self.manager.get_snapshot(route_id)?;
        Ok(RouteSync::full_sync(route_id.to_string(), snapshot))
    }

    /// Verify all active route snapshots against their event logs
    pub fn verify_all_routes(&self) -> ManagerResult<Vec<(String, bool)>> {
        let mut results = Vec::new();
        for route in self.manager.get_active_routes()? {
            let is_valid = self.manager.verify_route(&route.route_id)?;
            results.push((route.route_id, is_valid));
        }
        Ok(results)
    }
}

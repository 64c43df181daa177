//! Route snapshot - computed state from the route's event stream
//!
//! The snapshot includes a `state_checksum` field for drift detection.
//! Clients compare their locally computed checksum with the server's to
//! detect a diverged reducer and request a full resync.

use super::command::{PlannedArrival, PlannedStop};
use super::{RouteStatus, StopStatus};
use crate::models::{GeoPoint, PriorityTier, TimeWindow};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::hash::Hash;

/// Where a stop came from when it was moved between routes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReassignOrigin {
    pub route_id: String,
    /// Sequence number of the outgoing event on the source route
    pub sequence: u64,
}

/// One delivery within a route
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopSnapshot {
    pub order_id: String,
    /// 0-based, contiguous within the route
    pub sequence_index: u32,
    pub location: GeoPoint,
    pub demand: u32,
    #[serde(default)]
    pub priority: PriorityTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<TimeWindow>,
    pub status: StopStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planned_arrival: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_arrival: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
    /// Signature/photo handle in external storage
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    /// Route sequence of the event that last changed `status`
    #[serde(default)]
    pub status_sequence: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reassigned_from: Option<ReassignOrigin>,
}

impl StopSnapshot {
    pub fn from_planned(planned: &PlannedStop) -> Self {
        Self {
            order_id: planned.order_id.clone(),
            sequence_index: 0,
            location: planned.location,
            demand: planned.demand,
            priority: planned.priority,
            time_window: planned.time_window,
            status: StopStatus::Pending,
            planned_arrival: planned.planned_arrival,
            actual_arrival: None,
            finished_at: None,
            evidence_ref: None,
            failure_reason: None,
            status_sequence: 0,
            reassigned_from: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Route snapshot - computed from event stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteSnapshot {
    pub route_id: String,
    pub vehicle_id: String,
    pub planning_date: NaiveDate,
    pub status: RouteStatus,
    /// Ordered by `sequence_index`
    pub stops: Vec<StopSnapshot>,
    /// Capacity of the assigned vehicle
    pub capacity: u32,
    pub estimated_distance_m: f64,
    pub estimated_duration_s: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_location: Option<GeoPoint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_location_at: Option<i64>,
    /// Last applied event sequence
    pub last_sequence: u64,
    pub created_at: i64,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<i64>,
    /// Computed from: stop ids/indices/statuses, status, vehicle, last_sequence
    #[serde(default)]
    pub state_checksum: String,
}

impl RouteSnapshot {
    /// Create an empty planned route
    pub fn new(route_id: String) -> Self {
        let now = crate::util::now_millis();
        let mut snapshot = Self {
            route_id,
            vehicle_id: String::new(),
            planning_date: NaiveDate::default(),
            status: RouteStatus::Planned,
            stops: Vec::new(),
            capacity: 0,
            estimated_distance_m: 0.0,
            estimated_duration_s: 0.0,
            last_location: None,
            last_location_at: None,
            last_sequence: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            state_checksum: String::new(),
        };
        snapshot.update_checksum();
        snapshot
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn stop(&self, order_id: &str) -> Option<&StopSnapshot> {
        self.stops.iter().find(|s| s.order_id == order_id)
    }

    pub fn stop_mut(&mut self, order_id: &str) -> Option<&mut StopSnapshot> {
        self.stops.iter_mut().find(|s| s.order_id == order_id)
    }

    pub fn position(&self, order_id: &str) -> Option<usize> {
        self.stops.iter().position(|s| s.order_id == order_id)
    }

    /// Demand carried by the route
    ///
    /// Stops leave the route when reassigned or when the route is cancelled,
    /// so every stop present counts against capacity (failed deliveries stay
    /// on the truck).
    pub fn total_demand(&self) -> u32 {
        self.stops.iter().map(|s| s.demand).sum()
    }

    pub fn remaining_capacity(&self) -> u32 {
        self.capacity.saturating_sub(self.total_demand())
    }

    pub fn pending_count(&self) -> usize {
        self.stops
            .iter()
            .filter(|s| s.status == StopStatus::Pending)
            .count()
    }

    pub fn all_stops_terminal(&self) -> bool {
        !self.stops.is_empty() && self.stops.iter().all(StopSnapshot::is_terminal)
    }

    /// Number of leading stops a re-plan must keep in place
    ///
    /// Everything up to and including the last stop the driver has touched
    /// (any non-pending status) is locked.
    pub fn locked_prefix_len(&self) -> usize {
        self.stops
            .iter()
            .rposition(|s| s.status != StopStatus::Pending)
            .map(|i| i + 1)
            .unwrap_or(0)
    }

    /// Rewrite `sequence_index` as `0..len`
    pub fn reindex(&mut self) {
        for (i, stop) in self.stops.iter_mut().enumerate() {
            stop.sequence_index = i as u32;
        }
    }

    /// Check that indices are exactly `0..len` in order
    pub fn has_contiguous_indices(&self) -> bool {
        self.stops
            .iter()
            .enumerate()
            .all(|(i, s)| s.sequence_index as usize == i)
    }

    /// Insert a stop at `position` (clamped to the end) and reindex
    pub fn insert_stop(&mut self, mut stop: StopSnapshot, position: usize) {
        let at = position.min(self.stops.len());
        stop.sequence_index = at as u32;
        self.stops.insert(at, stop);
        self.reindex();
    }

    /// Remove a stop by order id and reindex
    pub fn remove_stop(&mut self, order_id: &str) -> Option<StopSnapshot> {
        let idx = self.position(order_id)?;
        let removed = self.stops.remove(idx);
        self.reindex();
        Some(removed)
    }

    /// Reorder stops to follow `order`, updating planned arrivals
    ///
    /// `order` must be a permutation of the current stop ids; otherwise the
    /// route is left untouched.
    pub fn apply_sequence(&mut self, order: &[PlannedArrival]) -> Result<(), String> {
        if order.len() != self.stops.len() {
            return Err(format!(
                "sequence has {} entries, route has {} stops",
                order.len(),
                self.stops.len()
            ));
        }
        let mut remaining = std::mem::take(&mut self.stops);
        let mut reordered = Vec::with_capacity(remaining.len());
        for entry in order {
            match remaining.iter().position(|s| s.order_id == entry.order_id) {
                Some(idx) => {
                    let mut stop = remaining.swap_remove(idx);
                    if entry.planned_arrival.is_some() {
                        stop.planned_arrival = entry.planned_arrival;
                    }
                    reordered.push(stop);
                }
                None => {
                    // Put things back before reporting
                    reordered.append(&mut remaining);
                    reordered.sort_by_key(|s| s.sequence_index);
                    self.stops = reordered;
                    return Err(format!("unknown or repeated stop {}", entry.order_id));
                }
            }
        }
        self.stops = reordered;
        self.reindex();
        Ok(())
    }

    /// Refresh planned arrivals without touching order
    pub fn apply_planned_arrivals(&mut self, arrivals: &[PlannedArrival]) {
        for entry in arrivals {
            if let Some(stop) = self.stop_mut(&entry.order_id) {
                stop.planned_arrival = entry.planned_arrival;
            }
        }
    }

    /// Compute state checksum for drift detection
    ///
    /// Returns a 16-character hex string over stop ids, indices and
    /// statuses, the route status, the vehicle and the last sequence.
    pub fn compute_checksum(&self) -> String {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::Hasher as _;

        let mut hasher = DefaultHasher::new();

        self.stops.len().hash(&mut hasher);
        for stop in &self.stops {
            stop.order_id.hash(&mut hasher);
            stop.sequence_index.hash(&mut hasher);
            (stop.status as u8).hash(&mut hasher);
        }
        (self.status as u8).hash(&mut hasher);
        self.vehicle_id.hash(&mut hasher);
        self.last_sequence.hash(&mut hasher);

        format!("{:016x}", hasher.finish())
    }

    pub fn update_checksum(&mut self) {
        self.state_checksum = self.compute_checksum();
    }

    /// Returns false if drift detected
    pub fn verify_checksum(&self) -> bool {
        self.state_checksum == self.compute_checksum()
    }
}

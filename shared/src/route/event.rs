//! Sync events - immutable, sequenced facts about a route
//!
//! The dispatch manager is the only issuer of sequence numbers. Sequences are
//! per route, start at 1 and never repeat.

use super::command::{OverrideTarget, PlannedArrival};
use super::snapshot::StopSnapshot;
use super::{RouteStatus, StopStatus};
use crate::models::GeoPoint;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Who caused a change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOrigin {
    Dispatcher,
    Driver,
    System,
}

impl fmt::Display for EventOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dispatcher => write!(f, "dispatcher"),
            Self::Driver => write!(f, "driver"),
            Self::System => write!(f, "system"),
        }
    }
}

/// Event type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncEventType {
    RouteCreated,
    RouteStatusChanged,
    StopStatusChanged,
    LocationUpdate,
    RouteReassigned,
    OrderAdded,
    StopsResequenced,
    OverrideApplied,
}

impl SyncEventType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::RouteCreated => "route_created",
            Self::RouteStatusChanged => "route_status_changed",
            Self::StopStatusChanged => "stop_status_changed",
            Self::LocationUpdate => "location_update",
            Self::RouteReassigned => "route_reassigned",
            Self::OrderAdded => "order_added",
            Self::StopsResequenced => "stops_resequenced",
            Self::OverrideApplied => "override_applied",
        }
    }
}

impl fmt::Display for SyncEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sync event - immutable audit record and replication unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub event_id: String,
    pub route_id: String,
    /// Per-route sequence, authoritative ordering for state evolution
    pub sequence: u64,
    pub event_type: SyncEventType,
    pub origin: EventOrigin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Server timestamp (Unix milliseconds)
    pub timestamp: i64,
    /// Command that produced this event (idempotency key)
    pub command_id: String,
    pub payload: EventPayload,
}

impl SyncEvent {
    pub fn new(
        route_id: String,
        sequence: u64,
        origin: EventOrigin,
        actor: Option<String>,
        command_id: String,
        payload: EventPayload,
    ) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            route_id,
            sequence,
            event_type: payload.event_type(),
            origin,
            actor,
            timestamp: crate::util::now_millis(),
            command_id,
            payload,
        }
    }
}

/// Event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    RouteCreated {
        vehicle_id: String,
        planning_date: NaiveDate,
        capacity: u32,
        stops: Vec<StopSnapshot>,
        estimated_distance_m: f64,
        estimated_duration_s: f64,
    },
    RouteStatusChanged {
        from: RouteStatus,
        to: RouteStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        vehicle_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        capacity: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    StopStatusChanged {
        order_id: String,
        from: StopStatus,
        to: StopStatus,
        occurred_at: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        evidence_ref: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure_reason: Option<String>,
    },
    LocationUpdate {
        location: GeoPoint,
        recorded_at: i64,
    },
    /// Emitted on both routes. The receiving route's event carries the stop.
    RouteReassigned {
        order_id: String,
        from_route_id: String,
        to_route_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stop: Option<StopSnapshot>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    OrderAdded {
        stop: StopSnapshot,
        position: u32,
        #[serde(default)]
        planned_arrivals: Vec<PlannedArrival>,
    },
    StopsResequenced {
        sequence: Vec<PlannedArrival>,
        estimated_distance_m: f64,
        estimated_duration_s: f64,
    },
    OverrideApplied {
        target: OverrideTarget,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_route_status: Option<RouteStatus>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        previous_stop_status: Option<StopStatus>,
        reason: String,
    },
}

impl EventPayload {
    pub fn event_type(&self) -> SyncEventType {
        match self {
            Self::RouteCreated { .. } => SyncEventType::RouteCreated,
            Self::RouteStatusChanged { .. } => SyncEventType::RouteStatusChanged,
            Self::StopStatusChanged { .. } => SyncEventType::StopStatusChanged,
            Self::LocationUpdate { .. } => SyncEventType::LocationUpdate,
            Self::RouteReassigned { .. } => SyncEventType::RouteReassigned,
            Self::OrderAdded { .. } => SyncEventType::OrderAdded,
            Self::StopsResequenced { .. } => SyncEventType::StopsResequenced,
            Self::OverrideApplied { .. } => SyncEventType::OverrideApplied,
        }
    }
}

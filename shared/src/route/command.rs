//! Dispatch commands - requests that may change route state
//!
//! Every command carries a `command_id` which doubles as its idempotency
//! key: the dispatch manager applies a given id at most once.

use super::event::EventOrigin;
use super::{RouteStatus, StopStatus};
use crate::error::AppError;
use crate::models::{GeoPoint, PriorityTier, TimeWindow};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// A stop as produced by the route builder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedStop {
    pub order_id: String,
    pub location: GeoPoint,
    pub demand: u32,
    #[serde(default)]
    pub priority: PriorityTier,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_window: Option<TimeWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planned_arrival: Option<i64>,
}

/// Position of a stop in a new sequence with its refreshed ETA
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedArrival {
    pub order_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planned_arrival: Option<i64>,
}

/// What a manual override forces
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OverrideTarget {
    Route { status: RouteStatus },
    Stop { order_id: String, status: StopStatus },
}

/// Dispatch command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchCommand {
    /// Idempotency key
    pub command_id: String,
    pub origin: EventOrigin,
    /// Dispatcher/driver/service identity, for audit
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    /// Client timestamp (Unix milliseconds)
    pub timestamp: i64,
    /// Last route sequence the issuer had seen
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_sequence: Option<u64>,
    pub payload: CommandPayload,
}

impl DispatchCommand {
    pub fn new(origin: EventOrigin, payload: CommandPayload) -> Self {
        Self {
            command_id: uuid::Uuid::new_v4().to_string(),
            origin,
            actor: None,
            timestamp: crate::util::now_millis(),
            observed_sequence: None,
            payload,
        }
    }

    pub fn with_command_id(mut self, command_id: impl Into<String>) -> Self {
        self.command_id = command_id.into();
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    pub fn with_observed_sequence(mut self, sequence: u64) -> Self {
        self.observed_sequence = Some(sequence);
        self
    }

    /// Routes this command touches, sorted so locks are taken in one order
    pub fn route_ids(&self) -> Vec<String> {
        let mut ids = match &self.payload {
            CommandPayload::ReassignStop {
                from_route_id,
                to_route_id,
                ..
            } => vec![from_route_id.clone(), to_route_id.clone()],
            other => vec![other.primary_route_id().to_string()],
        };
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Command payload
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandPayload {
    CreateRoute {
        route_id: String,
        vehicle_id: String,
        planning_date: NaiveDate,
        capacity: u32,
        stops: Vec<PlannedStop>,
        estimated_distance_m: f64,
        estimated_duration_s: f64,
    },
    AssignVehicle {
        route_id: String,
        vehicle_id: String,
        capacity: u32,
    },
    StartRoute {
        route_id: String,
    },
    UpdateStopStatus {
        route_id: String,
        order_id: String,
        status: StopStatus,
        /// When it happened on the device
        #[serde(default, skip_serializing_if = "Option::is_none")]
        occurred_at: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        evidence_ref: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure_reason: Option<String>,
    },
    RecordLocation {
        route_id: String,
        location: GeoPoint,
        recorded_at: i64,
    },
    /// Insert new stops at the given positions and refresh ETAs
    InsertStops {
        route_id: String,
        insertions: Vec<StopInsertion>,
        #[serde(default)]
        planned_arrivals: Vec<PlannedArrival>,
    },
    ResequenceStops {
        route_id: String,
        sequence: Vec<PlannedArrival>,
        estimated_distance_m: f64,
        estimated_duration_s: f64,
    },
    ReassignStop {
        from_route_id: String,
        to_route_id: String,
        order_id: String,
        /// Target index on the receiving route, appended when absent
        #[serde(default, skip_serializing_if = "Option::is_none")]
        position: Option<u32>,
    },
    CancelRoute {
        route_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    /// Manual override, bypasses the transition table once
    ForceState {
        route_id: String,
        target: OverrideTarget,
        reason: String,
    },
}

/// One stop to insert
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StopInsertion {
    pub stop: PlannedStop,
    pub position: u32,
}

impl CommandPayload {
    /// Route the command is about (source route for reassignment)
    pub fn primary_route_id(&self) -> &str {
        match self {
            Self::CreateRoute { route_id, .. }
            | Self::AssignVehicle { route_id, .. }
            | Self::StartRoute { route_id }
            | Self::UpdateStopStatus { route_id, .. }
            | Self::RecordLocation { route_id, .. }
            | Self::InsertStops { route_id, .. }
            | Self::ResequenceStops { route_id, .. }
            | Self::CancelRoute { route_id, .. }
            | Self::ForceState { route_id, .. } => route_id,
            Self::ReassignStop { from_route_id, .. } => from_route_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::CreateRoute { .. } => "create_route",
            Self::AssignVehicle { .. } => "assign_vehicle",
            Self::StartRoute { .. } => "start_route",
            Self::UpdateStopStatus { .. } => "update_stop_status",
            Self::RecordLocation { .. } => "record_location",
            Self::InsertStops { .. } => "insert_stops",
            Self::ResequenceStops { .. } => "resequence_stops",
            Self::ReassignStop { .. } => "reassign_stop",
            Self::CancelRoute { .. } => "cancel_route",
            Self::ForceState { .. } => "force_state",
        }
    }
}

/// Sequence assigned to an event produced by a command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedSequence {
    pub route_id: String,
    pub sequence: u64,
}

/// Command response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub command_id: String,
    pub success: bool,
    /// Command id was already processed; nothing changed
    #[serde(default)]
    pub duplicate: bool,
    /// Sequences issued for this command
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sequences: Vec<AppliedSequence>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AppError>,
}

impl CommandResponse {
    pub fn success(command_id: String, sequences: Vec<AppliedSequence>) -> Self {
        Self {
            command_id,
            success: true,
            duplicate: false,
            sequences,
            error: None,
        }
    }

    pub fn error(command_id: String, error: AppError) -> Self {
        Self {
            command_id,
            success: false,
            duplicate: false,
            sequences: Vec::new(),
            error: Some(error),
        }
    }

    pub fn duplicate(command_id: String) -> Self {
        Self {
            command_id,
            success: true,
            duplicate: true,
            sequences: Vec::new(),
            error: None,
        }
    }

    /// Highest sequence issued on `route_id`
    pub fn last_sequence_for(&self, route_id: &str) -> Option<u64> {
        self.sequences
            .iter()
            .filter(|s| s.route_id == route_id)
            .map(|s| s.sequence)
            .max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reassign_route_ids_sorted_and_deduped() {
        let cmd = DispatchCommand::new(
            EventOrigin::Dispatcher,
            CommandPayload::ReassignStop {
                from_route_id: "r-b".into(),
                to_route_id: "r-a".into(),
                order_id: "o-5".into(),
                position: None,
            },
        );
        assert_eq!(cmd.route_ids(), vec!["r-a".to_string(), "r-b".to_string()]);

        let same = DispatchCommand::new(
            EventOrigin::Dispatcher,
            CommandPayload::ReassignStop {
                from_route_id: "r-a".into(),
                to_route_id: "r-a".into(),
                order_id: "o-5".into(),
                position: Some(0),
            },
        );
        assert_eq!(same.route_ids(), vec!["r-a".to_string()]);
    }

    #[test]
    fn test_payload_tagged_serialization() {
        let payload = CommandPayload::StartRoute {
            route_id: "r-1".into(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["type"], "start_route");
        assert_eq!(json["route_id"], "r-1");
    }

    #[test]
    fn test_last_sequence_for() {
        let resp = CommandResponse::success(
            "c-1".into(),
            vec![
                AppliedSequence {
                    route_id: "r-1".into(),
                    sequence: 4,
                },
                AppliedSequence {
                    route_id: "r-1".into(),
                    sequence: 5,
                },
                AppliedSequence {
                    route_id: "r-2".into(),
                    sequence: 9,
                },
            ],
        );
        assert_eq!(resp.last_sequence_for("r-1"), Some(5));
        assert_eq!(resp.last_sequence_for("r-3"), None);
    }
}

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::AppError;
use crate::models::GeoPoint;
use crate::route::{RouteSnapshot, StopStatus, SyncEvent, SyncEventType};

// ==================== Envelope ====================

/// Envelope message type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    Snapshot,
    RouteCreated,
    RouteStatusChanged,
    StopStatusChanged,
    LocationUpdate,
    RouteReassigned,
    OrderAdded,
    StopsResequenced,
    OverrideApplied,
    Heartbeat,
}

impl From<SyncEventType> for EnvelopeType {
    fn from(value: SyncEventType) -> Self {
        match value {
            SyncEventType::RouteCreated => Self::RouteCreated,
            SyncEventType::RouteStatusChanged => Self::RouteStatusChanged,
            SyncEventType::StopStatusChanged => Self::StopStatusChanged,
            SyncEventType::LocationUpdate => Self::LocationUpdate,
            SyncEventType::RouteReassigned => Self::RouteReassigned,
            SyncEventType::OrderAdded => Self::OrderAdded,
            SyncEventType::StopsResequenced => Self::StopsResequenced,
            SyncEventType::OverrideApplied => Self::OverrideApplied,
        }
    }
}

/// Sync envelope `{type, route_id, sequence_number?, payload, idempotency_key?}`
///
/// - snapshot: `sequence_number` is the next sequence the client should expect
/// - route events: `sequence_number` is the event's sequence
/// - driver submissions: no sequence, `idempotency_key` is the queue item id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    pub route_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

impl Envelope {
    pub fn heartbeat() -> Self {
        Self {
            kind: EnvelopeType::Heartbeat,
            route_id: String::new(),
            sequence_number: None,
            payload: serde_json::Value::Null,
            idempotency_key: None,
        }
    }

    /// Full route state; `sequence_number` is the next sequence to expect
    pub fn snapshot(snapshot: &RouteSnapshot) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: EnvelopeType::Snapshot,
            route_id: snapshot.route_id.clone(),
            sequence_number: Some(snapshot.last_sequence + 1),
            payload: serde_json::to_value(snapshot)?,
            idempotency_key: None,
        })
    }

    /// Wrap a sequenced route event
    pub fn from_event(event: &SyncEvent) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: event.event_type.into(),
            route_id: event.route_id.clone(),
            sequence_number: Some(event.sequence),
            payload: serde_json::to_value(event)?,
            idempotency_key: Some(event.command_id.clone()),
        })
    }

    /// Wrap a driver submission
    pub fn submission(route_id: String, key: String, submit: &SubmitPayload) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: submit.action.envelope_type(),
            route_id,
            sequence_number: None,
            payload: serde_json::to_value(submit)?,
            idempotency_key: Some(key),
        })
    }

    pub fn parse<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

// ==================== Handshake ====================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientRole {
    Dispatcher,
    Driver,
}

impl fmt::Display for ClientRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dispatcher => write!(f, "dispatcher"),
            Self::Driver => write!(f, "driver"),
        }
    }
}

/// Handshake payload (client -> hub)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakePayload {
    pub version: u16,
    pub role: ClientRole,
    /// Stable device/console id
    pub client_id: String,
    /// Drivers: vehicle whose routes to follow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vehicle_id: Option<String>,
    /// Explicit route subscriptions, added to the role defaults
    #[serde(default)]
    pub routes: Vec<String>,
    /// Epoch the client last synced against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epoch: Option<String>,
}

/// Handshake reply (hub -> client), sent before the snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeAck {
    pub session_id: String,
    /// Changes on every server start
    pub epoch: String,
    /// Routes whose snapshots follow
    pub routes: Vec<String>,
    pub heartbeat_timeout_ms: u64,
}

// ==================== Resync ====================

/// Last sequence a client has applied for a route
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteCursor {
    pub route_id: String,
    pub last_sequence: u64,
}

/// Client -> hub
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResyncRequest {
    pub cursors: Vec<RouteCursor>,
}

/// Hub -> client, correlated to the resync request once every missed event
/// and snapshot has been written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResyncComplete {
    /// Server cursors after catch-up
    pub cursors: Vec<RouteCursor>,
    /// Routes the client should drop (archived or unknown)
    #[serde(default)]
    pub dropped: Vec<String>,
    pub epoch: String,
}

/// Hub -> client: local state can no longer be trusted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResyncNotice {
    pub reason: String,
}

// ==================== Driver submissions ====================

/// Action recorded on a driver device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DriverAction {
    StopStatus {
        order_id: String,
        status: StopStatus,
        occurred_at: i64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        evidence_ref: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        failure_reason: Option<String>,
    },
    Location {
        location: GeoPoint,
        recorded_at: i64,
    },
}

impl DriverAction {
    pub fn envelope_type(&self) -> EnvelopeType {
        match self {
            Self::StopStatus { .. } => EnvelopeType::StopStatusChanged,
            Self::Location { .. } => EnvelopeType::LocationUpdate,
        }
    }
}

/// Submission payload inside the envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitPayload {
    pub action: DriverAction,
    /// Last route sequence the device had applied when recording
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_sequence: Option<u64>,
    /// Device creation time
    pub created_at: i64,
}

/// Outcome of a submission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    Applied,
    /// Same idempotency key already applied, nothing changed
    Duplicate,
    /// Terminal rejection, retrying will not help
    Rejected,
}

/// Acknowledgement (hub -> driver), correlated to the submit frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    pub idempotency_key: String,
    pub status: AckStatus,
    /// Last sequence issued on the route by this submission
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AppError>,
}

impl AckPayload {
    pub fn applied(key: String, sequence_number: Option<u64>) -> Self {
        Self {
            idempotency_key: key,
            status: AckStatus::Applied,
            sequence_number,
            error: None,
        }
    }

    pub fn duplicate(key: String) -> Self {
        Self {
            idempotency_key: key,
            status: AckStatus::Duplicate,
            sequence_number: None,
            error: None,
        }
    }

    pub fn rejected(key: String, error: AppError) -> Self {
        Self {
            idempotency_key: key,
            status: AckStatus::Rejected,
            sequence_number: None,
            error: Some(error),
        }
    }

    /// Applied and duplicate both mean the server holds the change
    pub fn is_settled(&self) -> bool {
        matches!(self.status, AckStatus::Applied | AckStatus::Duplicate)
    }

    /// Rejected for a server-side fault; the same submission may succeed later
    pub fn is_retryable(&self) -> bool {
        self.status == AckStatus::Rejected && self.error.as_ref().is_some_and(AppError::is_retryable)
    }
}

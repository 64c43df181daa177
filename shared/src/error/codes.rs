//! Unified error codes for the dispatch stack
//!
//! Error codes are shared by dispatch-server, driver-client and consoles.
//! They are organized by category:
//! - 0xxx: General errors
//! - 1xxx: Planning errors
//! - 2xxx: Dispatch (state machine) errors
//! - 3xxx: Synchronization errors
//! - 4xxx: Distance provider errors
//! - 5xxx: Offline queue errors
//! - 9xxx: System errors

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unified error code enum
///
/// All error codes are represented as u16 values so they survive the wire
/// unchanged between server, driver devices and dispatcher consoles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u16", try_from = "u16")]
#[repr(u16)]
pub enum ErrorCode {
    // ==================== 0xxx: General ====================
    /// Operation completed successfully
    Success = 0,
    /// Unknown error
    Unknown = 1,
    /// Validation failed
    ValidationFailed = 2,
    /// Resource not found
    NotFound = 3,
    /// Resource already exists
    AlreadyExists = 4,
    /// Invalid request
    InvalidRequest = 5,
    /// Invalid format
    InvalidFormat = 6,

    // ==================== 1xxx: Planning ====================
    /// Planning run misconfigured (no vehicles, invalid constraints)
    ConfigurationError = 1001,
    /// Order cannot fit any route
    InfeasibleAssignment = 1002,
    /// Re-optimization superseded by a newer request
    ReoptimizationSuperseded = 1003,
    /// Re-optimization exceeded its time budget
    ReoptimizationTimedOut = 1004,

    // ==================== 2xxx: Dispatch ====================
    /// State machine rule violation
    IllegalTransition = 2001,
    /// Route not found
    RouteNotFound = 2002,
    /// Stop not found on route
    StopNotFound = 2003,
    /// Vehicle capacity would be exceeded
    CapacityExceeded = 2004,
    /// Order already has an active stop
    OrderAlreadyRouted = 2005,
    /// Vehicle not found
    VehicleNotFound = 2006,
    /// Order not found
    OrderNotFound = 2007,
    /// Route is archived
    RouteArchived = 2008,

    // ==================== 3xxx: Sync ====================
    /// Concurrent conflicting update lost precedence
    SyncConflict = 3001,
    /// Client cursor is behind the retained event window
    SequenceGap = 3002,
    /// Client protocol version mismatch
    ProtocolMismatch = 3003,
    /// Client is not subscribed to the route
    NotSubscribed = 3004,
    /// Handshake required before this message
    HandshakeRequired = 3005,

    // ==================== 4xxx: Provider ====================
    /// Distance provider failed after retries
    ProviderUnavailable = 4001,
    /// Distance provider returned an unusable response
    ProviderBadResponse = 4002,

    // ==================== 5xxx: Offline queue ====================
    /// Queue item exhausted its retry budget
    OfflineReplayExhausted = 5001,
    /// Queue item not found
    QueueItemNotFound = 5002,
    /// Queue is blocked behind an unsynced item
    QueueBlocked = 5003,

    // ==================== 9xxx: System ====================
    /// Internal server error
    InternalError = 9001,
    /// Database error
    DatabaseError = 9002,
    /// Network error
    NetworkError = 9003,
    /// Operation timed out
    TimeoutError = 9004,
    /// Server configuration error
    ConfigError = 9005,
    /// Client disconnected
    ClientDisconnected = 9006,
    /// Storage corrupted
    StorageCorrupted = 9403,
}

impl ErrorCode {
    /// Get the numeric code value
    #[inline]
    pub const fn code(&self) -> u16 {
        *self as u16
    }

    /// Check if this code represents success
    #[inline]
    pub const fn is_success(&self) -> bool {
        matches!(self, ErrorCode::Success)
    }

    /// Get the default message for this error code
    pub const fn message(&self) -> &'static str {
        match self {
            // General
            ErrorCode::Success => "Operation completed successfully",
            ErrorCode::Unknown => "An unknown error occurred",
            ErrorCode::ValidationFailed => "Validation failed",
            ErrorCode::NotFound => "Resource not found",
            ErrorCode::AlreadyExists => "Resource already exists",
            ErrorCode::InvalidRequest => "Invalid request",
            ErrorCode::InvalidFormat => "Invalid format",

            // Planning
            ErrorCode::ConfigurationError => "Planning configuration is invalid",
            ErrorCode::InfeasibleAssignment => "Order cannot be assigned to any route",
            ErrorCode::ReoptimizationSuperseded => "Re-optimization superseded by a newer request",
            ErrorCode::ReoptimizationTimedOut => "Re-optimization exceeded its time budget",

            // Dispatch
            ErrorCode::IllegalTransition => "Illegal state transition",
            ErrorCode::RouteNotFound => "Route not found",
            ErrorCode::StopNotFound => "Stop not found",
            ErrorCode::CapacityExceeded => "Vehicle capacity exceeded",
            ErrorCode::OrderAlreadyRouted => "Order already has an active stop",
            ErrorCode::VehicleNotFound => "Vehicle not found",
            ErrorCode::OrderNotFound => "Order not found",
            ErrorCode::RouteArchived => "Route is archived",

            // Sync
            ErrorCode::SyncConflict => "Update conflicts with a concurrent change",
            ErrorCode::SequenceGap => "Event sequence gap detected",
            ErrorCode::ProtocolMismatch => "Protocol version mismatch",
            ErrorCode::NotSubscribed => "Client is not subscribed to this route",
            ErrorCode::HandshakeRequired => "Handshake required",

            // Provider
            ErrorCode::ProviderUnavailable => "Distance provider unavailable",
            ErrorCode::ProviderBadResponse => "Distance provider returned an invalid response",

            // Offline queue
            ErrorCode::OfflineReplayExhausted => "Item could not be synchronized",
            ErrorCode::QueueItemNotFound => "Queue item not found",
            ErrorCode::QueueBlocked => "Queue is blocked by an unsynced item",

            // System
            ErrorCode::InternalError => "Internal server error",
            ErrorCode::DatabaseError => "Database error",
            ErrorCode::NetworkError => "Network error",
            ErrorCode::TimeoutError => "Operation timed out",
            ErrorCode::ConfigError => "Configuration error",
            ErrorCode::ClientDisconnected => "Client disconnected",
            ErrorCode::StorageCorrupted => "Storage corrupted",
        }
    }
}

impl From<ErrorCode> for u16 {
    #[inline]
    fn from(code: ErrorCode) -> Self {
        code.code()
    }
}

/// Error when converting from an invalid u16 to ErrorCode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidErrorCode(pub u16);

impl fmt::Display for InvalidErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid error code: {}", self.0)
    }
}

impl std::error::Error for InvalidErrorCode {}

impl TryFrom<u16> for ErrorCode {
    type Error = InvalidErrorCode;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            // General
            0 => Ok(ErrorCode::Success),
            1 => Ok(ErrorCode::Unknown),
            2 => Ok(ErrorCode::ValidationFailed),
            3 => Ok(ErrorCode::NotFound),
            4 => Ok(ErrorCode::AlreadyExists),
            5 => Ok(ErrorCode::InvalidRequest),
            6 => Ok(ErrorCode::InvalidFormat),

            // Planning
            1001 => Ok(ErrorCode::ConfigurationError),
            1002 => Ok(ErrorCode::InfeasibleAssignment),
            1003 => Ok(ErrorCode::ReoptimizationSuperseded),
            1004 => Ok(ErrorCode::ReoptimizationTimedOut),

            // Dispatch
            2001 => Ok(ErrorCode::IllegalTransition),
            2002 => Ok(ErrorCode::RouteNotFound),
            2003 => Ok(ErrorCode::StopNotFound),
            2004 => Ok(ErrorCode::CapacityExceeded),
            2005 => Ok(ErrorCode::OrderAlreadyRouted),
            2006 => Ok(ErrorCode::VehicleNotFound),
            2007 => Ok(ErrorCode::OrderNotFound),
            2008 => Ok(ErrorCode::RouteArchived),

            // Sync
            3001 => Ok(ErrorCode::SyncConflict),
            3002 => Ok(ErrorCode::SequenceGap),
            3003 => Ok(ErrorCode::ProtocolMismatch),
            3004 => Ok(ErrorCode::NotSubscribed),
            3005 => Ok(ErrorCode::HandshakeRequired),

            // Provider
            4001 => Ok(ErrorCode::ProviderUnavailable),
            4002 => Ok(ErrorCode::ProviderBadResponse),

            // Offline queue
            5001 => Ok(ErrorCode::OfflineReplayExhausted),
            5002 => Ok(ErrorCode::QueueItemNotFound),
            5003 => Ok(ErrorCode::QueueBlocked),

            // System
            9001 => Ok(ErrorCode::InternalError),
            9002 => Ok(ErrorCode::DatabaseError),
            9003 => Ok(ErrorCode::NetworkError),
            9004 => Ok(ErrorCode::TimeoutError),
            9005 => Ok(ErrorCode::ConfigError),
            9006 => Ok(ErrorCode::ClientDisconnected),
            9403 => Ok(ErrorCode::StorageCorrupted),

            _ => Err(InvalidErrorCode(value)),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

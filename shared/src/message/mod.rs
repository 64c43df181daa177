//! Hub wire protocol shared by dispatch-server and clients
//!
//! Frame layout on the wire:
//!
//! ```text
//! ┌──────────┬────────────┬────────────────┬──────────┬─────────────┐
//! │ type u8  │ request 16 │ correlation 16 │ len u32  │ payload     │
//! │          │ (uuid)     │ (uuid, nil=∅)  │ (LE)     │ (JSON)      │
//! └──────────┴────────────┴────────────────┴──────────┴─────────────┘
//! ```
//!
//! Sync traffic carries an [`Envelope`] as payload.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

use uuid::Uuid;

pub mod payload;
pub use payload::*;

/// Protocol version
pub const PROTOCOL_VERSION: u16 = 1;

/// Fixed header size: type + request id + correlation id + length
pub const FRAME_HEADER_LEN: usize = 1 + 16 + 16 + 4;

/// Upper bound for a single payload
pub const MAX_PAYLOAD_LEN: usize = 16 * 1024 * 1024;

/// Frame type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventType {
    /// Client hello, server answers with a `Response`
    Handshake = 0,
    /// Liveness ping, both directions
    Heartbeat = 1,
    /// Full route state
    Snapshot = 2,
    /// One sequenced route event
    Sync = 3,
    /// Driver-submitted action
    Submit = 4,
    /// Reply correlated to a request
    Response = 5,
    /// Resync request (client) or resync notice (server)
    Resync = 6,
}

impl TryFrom<u8> for EventType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(EventType::Handshake),
            1 => Ok(EventType::Heartbeat),
            2 => Ok(EventType::Snapshot),
            3 => Ok(EventType::Sync),
            4 => Ok(EventType::Submit),
            5 => Ok(EventType::Response),
            6 => Ok(EventType::Resync),
            _ => Err(()),
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventType::Handshake => write!(f, "handshake"),
            EventType::Heartbeat => write!(f, "heartbeat"),
            EventType::Snapshot => write!(f, "snapshot"),
            EventType::Sync => write!(f, "sync"),
            EventType::Submit => write!(f, "submit"),
            EventType::Response => write!(f, "response"),
            EventType::Resync => write!(f, "resync"),
        }
    }
}

/// Framing failure
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("invalid event type: {0}")]
    InvalidEventType(u8),
    #[error("payload too large: {0} bytes")]
    PayloadTooLarge(usize),
}

/// Message bus frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    pub request_id: Uuid,
    pub event_type: EventType,
    pub correlation_id: Option<Uuid>,
    pub payload: Vec<u8>,
}

impl BusMessage {
    pub fn new(event_type: EventType, payload: Vec<u8>) -> Self {
        Self {
            request_id: Uuid::new_v4(),
            event_type,
            correlation_id: None,
            payload,
        }
    }

    /// Serialize `data` as JSON into a new frame
    pub fn encode<T: Serialize>(event_type: EventType, data: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::new(event_type, serde_json::to_vec(data)?))
    }

    /// Set correlation ID (for RPC responses)
    pub fn with_correlation_id(mut self, id: Uuid) -> Self {
        self.correlation_id = Some(id);
        self
    }

    pub fn handshake(payload: &HandshakePayload) -> Result<Self, serde_json::Error> {
        Self::encode(EventType::Handshake, payload)
    }

    pub fn heartbeat() -> Result<Self, serde_json::Error> {
        Self::encode(EventType::Heartbeat, &Envelope::heartbeat())
    }

    pub fn envelope(event_type: EventType, envelope: &Envelope) -> Result<Self, serde_json::Error> {
        Self::encode(event_type, envelope)
    }

    /// Response correlated to `request`
    pub fn response_to<T: Serialize>(request: Uuid, data: &T) -> Result<Self, serde_json::Error> {
        Ok(Self::encode(EventType::Response, data)?.with_correlation_id(request))
    }

    /// Parse payload as the given type
    pub fn parse_payload<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    pub fn is_response(&self) -> bool {
        matches!(self.event_type, EventType::Response)
    }

    /// Encode into wire bytes
    pub fn to_frame(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        data.push(self.event_type as u8);
        data.extend_from_slice(self.request_id.as_bytes());
        let correlation = self.correlation_id.unwrap_or(Uuid::nil());
        data.extend_from_slice(correlation.as_bytes());
        data.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        data.extend_from_slice(&self.payload);
        data
    }
}

/// Decoded fixed-size frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub event_type: EventType,
    pub request_id: Uuid,
    pub correlation_id: Option<Uuid>,
    pub payload_len: usize,
}

impl FrameHeader {
    pub fn parse(buf: &[u8; FRAME_HEADER_LEN]) -> Result<Self, FrameError> {
        let event_type =
            EventType::try_from(buf[0]).map_err(|_| FrameError::InvalidEventType(buf[0]))?;

        let mut uuid_buf = [0u8; 16];
        uuid_buf.copy_from_slice(&buf[1..17]);
        let request_id = Uuid::from_bytes(uuid_buf);

        uuid_buf.copy_from_slice(&buf[17..33]);
        let correlation_raw = Uuid::from_bytes(uuid_buf);
        let correlation_id = (!correlation_raw.is_nil()).then_some(correlation_raw);

        let mut len_buf = [0u8; 4];
        len_buf.copy_from_slice(&buf[33..37]);
        let payload_len = u32::from_le_bytes(len_buf) as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge(payload_len));
        }

        Ok(Self {
            event_type,
            request_id,
            correlation_id,
            payload_len,
        })
    }

    pub fn into_message(self, payload: Vec<u8>) -> BusMessage {
        BusMessage {
            request_id: self.request_id,
            event_type: self.event_type,
            correlation_id: self.correlation_id,
            payload,
        }
    }
}

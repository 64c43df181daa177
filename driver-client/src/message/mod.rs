//! Hub link - framed transport, request/response correlation, config

pub mod client;
pub mod transport;

pub use client::MessageClient;
pub use shared::message::{BusMessage, EventType};

use shared::error::AppError;
use std::time::Duration;
use thiserror::Error;

/// Link errors
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// The hub answered with a typed error
    #[error("Hub error: {0}")]
    Hub(AppError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection closed")]
    Closed,
}

/// Message client configuration
#[derive(Debug, Clone)]
pub struct MessageClientConfig {
    /// Default request timeout
    pub request_timeout: Duration,
    /// Reconnect after the link drops (TCP only)
    pub auto_reconnect: bool,
    /// First reconnect delay
    pub reconnect_delay: Duration,
    /// Upper bound of the reconnect backoff
    pub max_reconnect_delay: Duration,
    /// 0 means retry forever
    pub max_reconnect_attempts: u32,
    /// Ping interval (0 disables)
    pub heartbeat_interval: Duration,
    /// A ping not answered within this is a dead link
    pub heartbeat_timeout: Duration,
}

impl Default for MessageClientConfig {
    /// Depot Wi-Fi profile
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(3),
            auto_reconnect: true,
            reconnect_delay: Duration::from_millis(500),
            max_reconnect_delay: Duration::from_secs(10),
            max_reconnect_attempts: 0,
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(2),
        }
    }
}

impl MessageClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local network: fast detection, fast recovery
    pub fn lan() -> Self {
        Self::default()
    }

    /// Cellular network: tolerate latency, ping less
    pub fn wan() -> Self {
        Self {
            request_timeout: Duration::from_secs(10),
            auto_reconnect: true,
            reconnect_delay: Duration::from_secs(1),
            max_reconnect_delay: Duration::from_secs(60),
            max_reconnect_attempts: 0,
            heartbeat_interval: Duration::from_secs(20),
            heartbeat_timeout: Duration::from_secs(5),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// 0 disables pings
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn with_reconnect_delay(mut self, delay: Duration, max: Duration) -> Self {
        self.reconnect_delay = delay;
        self.max_reconnect_delay = max;
        self
    }

    /// 0 means retry forever
    pub fn with_max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    /// Delay before reconnect attempt `n` (1-based)
    pub fn reconnect_backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(shared::util::backoff_delay_ms(
            self.reconnect_delay.as_millis() as u64,
            attempt.saturating_sub(1),
            self.max_reconnect_delay.as_millis() as u64,
        ))
    }
}

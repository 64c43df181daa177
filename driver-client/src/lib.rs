//! Driver Client - device side of the delivery sync hub
//!
//! Connects to the hub, keeps an optimistic view of the driver's routes and
//! buffers every action in a durable queue so nothing recorded offline is
//! lost. Replay is strictly in creation order.

pub mod config;
pub mod error;
pub mod message;
pub mod queue;
pub mod session;
pub mod state;

pub use config::{DriverConfig, QueueConfig};
pub use error::{ClientError, ClientResult, QueueError};
pub use message::{BusMessage, EventType, MessageClient, MessageClientConfig, MessageError};
pub use queue::{OfflineQueue, QueueEvent, QueueItem, RejectedItem, ReplayWorker, SyncState};
pub use session::DriverSession;
pub use state::{ApplyOutcome, LocalRouteView};

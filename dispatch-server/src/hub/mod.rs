//! Synchronization hub
//!
//! Keeps dispatcher consoles and driver devices in step with the dispatch
//! state machine over a framed TCP protocol (see `shared::message`).
//!
//! - **transport**: framed byte streams (TCP, in-process duplex)
//! - **session**: handshake, snapshot, live forwarding, resync, submissions
//! - **processor**: driver submissions to dispatch commands
//!
//! # Architecture
//!
//! ```text
//!                    ┌────────────────────────┐
//!  TCP clients ────► │ HubServer (accept loop)│
//!                    └──────────┬─────────────┘
//!                               │ one task per client
//!                               ▼
//!   DispatchManager ──broadcast──► Session ──► writer ──► client
//!          ▲                        │
//!          └──── SubmitProcessor ◄──┘ (Submit frames)
//! ```

pub mod processor;
pub mod session;
pub mod transport;

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use shared::message::ClientRole;
use tokio::io::DuplexStream;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::dispatch::{DispatchManager, SyncService};
pub use processor::{SubmitProcessor, Submitter};
use transport::{MemoryTransport, TcpTransport, Transport};

/// Hub settings
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Silence after which a session is released
    pub heartbeat_timeout: Duration,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout: Duration::from_secs(30),
        }
    }
}

/// A connected client, as shown on the admin API
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub client_id: String,
    pub role: ClientRole,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub peer_addr: Option<String>,
    pub connected_at: i64,
    /// Routes followed at handshake time
    pub routes: Vec<String>,
}

/// Shared by every session
#[derive(Debug, Clone)]
pub(crate) struct HubContext {
    pub(crate) manager: DispatchManager,
    pub(crate) sync: SyncService,
    pub(crate) processor: SubmitProcessor,
    pub(crate) config: HubConfig,
    pub(crate) sessions: Arc<DashMap<String, SessionInfo>>,
}

/// Synchronization hub
#[derive(Debug, Clone)]
pub struct HubServer {
    ctx: HubContext,
    shutdown: CancellationToken,
}

impl HubServer {
    pub fn new(manager: DispatchManager, config: HubConfig) -> Self {
        Self {
            ctx: HubContext {
                sync: SyncService::new(manager.clone()),
                processor: SubmitProcessor::new(manager.clone()),
                manager,
                config,
                sessions: Arc::new(DashMap::new()),
            },
            shutdown: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &HubConfig {
        &self.ctx.config
    }

    /// Token cancelled when the hub stops
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Close every session and stop accepting
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Currently connected clients
    pub fn connected_sessions(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> =
            self.ctx.sessions.iter().map(|e| e.value().clone()).collect();
        sessions.sort_by_key(|s| s.connected_at);
        sessions
    }

    pub fn session_count(&self) -> usize {
        self.ctx.sessions.len()
    }

    /// Accept TCP clients until shutdown
    pub async fn run_tcp(&self, listener: TcpListener) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(addr = %addr, "Sync hub listening");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("Sync hub shutting down");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            tracing::debug!(peer = %peer, "Client connected");
                            self.spawn_session(Arc::new(TcpTransport::from_stream(stream)));
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "Accept failed");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Open an in-process client connection
    ///
    /// The returned stream speaks the same framed protocol as TCP.
    pub fn connect_in_process(&self) -> DuplexStream {
        let (transport, client) = MemoryTransport::pair();
        self.spawn_session(Arc::new(transport));
        client
    }

    fn spawn_session(&self, transport: Arc<dyn Transport>) {
        let ctx = self.ctx.clone();
        let shutdown = self.shutdown.child_token();
        tokio::spawn(session::run(transport, ctx, shutdown));
    }
}

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use shared::error::AppError;
use shared::message::{
    AckPayload, BusMessage, Envelope, EventType, HandshakeAck, HandshakePayload, ResyncComplete,
    ResyncRequest, RouteCursor,
};
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use uuid::Uuid;

use super::transport::{MemoryTransport, TcpTransport, Transport};
use super::{MessageClientConfig, MessageError};

type PendingMap = Arc<Mutex<HashMap<Uuid, oneshot::Sender<BusMessage>>>>;

/// Message Client
///
/// One live, handshaken link to the hub. Replies are matched to requests
/// by `correlation_id`; everything else (snapshots, sync events, resync
/// notices) goes to the inbound channel in arrival order.
#[derive(Debug, Clone)]
pub struct MessageClient {
    transport: ClientTransport,
    config: MessageClientConfig,
    ack: HandshakeAck,
    pending_requests: PendingMap,
    inbound: Arc<Mutex<Option<mpsc::UnboundedReceiver<BusMessage>>>>,
    closed: CancellationToken,
}

#[derive(Debug, Clone)]
enum ClientTransport {
    Tcp(TcpTransport),
    Memory(MemoryTransport),
}

impl ClientTransport {
    async fn read_message(&self) -> Result<BusMessage, MessageError> {
        match self {
            ClientTransport::Tcp(t) => t.read_message().await,
            ClientTransport::Memory(t) => t.read_message().await,
        }
    }

    async fn write_message(&self, msg: &BusMessage) -> Result<(), MessageError> {
        match self {
            ClientTransport::Tcp(t) => t.write_message(msg).await,
            ClientTransport::Memory(t) => t.write_message(msg).await,
        }
    }

    async fn close(&self) -> Result<(), MessageError> {
        match self {
            ClientTransport::Tcp(t) => t.close().await,
            ClientTransport::Memory(t) => t.close().await,
        }
    }
}

/// Decode a correlated reply, or the typed error the hub sent instead
fn decode_reply<T: DeserializeOwned>(reply: &BusMessage) -> Result<T, MessageError> {
    match reply.parse_payload::<T>() {
        Ok(value) => Ok(value),
        Err(parse_err) => match reply.parse_payload::<AppError>() {
            Ok(err) => Err(MessageError::Hub(err)),
            Err(_) => Err(MessageError::InvalidMessage(parse_err.to_string())),
        },
    }
}

impl MessageClient {
    /// Connect via TCP and handshake
    pub async fn connect(
        addr: &str,
        hello: &HandshakePayload,
        config: MessageClientConfig,
    ) -> Result<Self, MessageError> {
        let transport = TcpTransport::connect(addr).await?;
        Self::establish(ClientTransport::Tcp(transport), hello, config).await
    }

    /// Handshake over an in-process pipe
    pub async fn connect_memory(
        stream: DuplexStream,
        hello: &HandshakePayload,
        config: MessageClientConfig,
    ) -> Result<Self, MessageError> {
        Self::establish(ClientTransport::Memory(MemoryTransport::new(stream)), hello, config).await
    }

    async fn establish(
        transport: ClientTransport,
        hello: &HandshakePayload,
        config: MessageClientConfig,
    ) -> Result<Self, MessageError> {
        let request = BusMessage::handshake(hello)?;
        transport.write_message(&request).await?;

        // Nothing else is sent before the hub answers the hello
        let reply = tokio::time::timeout(config.request_timeout, transport.read_message())
            .await
            .map_err(|_| MessageError::Timeout("handshake".to_string()))??;
        if reply.correlation_id != Some(request.request_id) {
            return Err(MessageError::InvalidMessage(format!(
                "expected handshake reply, got {} frame",
                reply.event_type
            )));
        }
        let ack: HandshakeAck = match decode_reply(&reply) {
            Ok(ack) => ack,
            Err(e) => {
                let _ = transport.close().await;
                return Err(e);
            }
        };
        tracing::info!(
            session_id = %ack.session_id,
            epoch = %ack.epoch,
            routes = ack.routes.len(),
            "Connected to hub"
        );

        Ok(Self::new(transport, config, ack))
    }

    fn new(transport: ClientTransport, config: MessageClientConfig, ack: HandshakeAck) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let pending_requests: PendingMap = Arc::new(Mutex::new(HashMap::new()));

        let client = Self {
            transport: transport.clone(),
            config,
            ack,
            pending_requests: pending_requests.clone(),
            inbound: Arc::new(Mutex::new(Some(inbound_rx))),
            closed: CancellationToken::new(),
        };

        // Read loop: replies to their waiter, the rest in order to the inbound channel
        let closed = client.closed.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = closed.cancelled() => break,
                    read = transport.read_message() => read,
                };
                match msg {
                    Ok(msg) => {
                        if let Some(correlation_id) = msg.correlation_id {
                            let waiter = pending_requests.lock().remove(&correlation_id);
                            if let Some(tx) = waiter {
                                let _ = tx.send(msg);
                                continue;
                            }
                        }
                        if msg.event_type == EventType::Heartbeat {
                            continue;
                        }
                        if inbound_tx.send(msg).is_err() {
                            tracing::debug!("Inbound receiver dropped");
                        }
                    }
                    Err(MessageError::Closed) => {
                        tracing::info!("Hub closed the connection");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Transport read error");
                        break;
                    }
                }
            }
            closed.cancel();
            // Dropping the senders fails every waiter
            pending_requests.lock().clear();
        });

        if !client.config.heartbeat_interval.is_zero() {
            let pinger = client.clone();
            tokio::spawn(async move { pinger.heartbeat_loop().await });
        }

        client
    }

    async fn heartbeat_loop(self) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        interval.tick().await;
        loop {
            tokio::select! {
                _ = self.closed.cancelled() => return,
                _ = interval.tick() => {}
            }
            let ping = match BusMessage::heartbeat() {
                Ok(ping) => ping,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to encode heartbeat");
                    return;
                }
            };
            if let Err(e) = self.request_with_timeout(&ping, self.config.heartbeat_timeout).await {
                tracing::warn!(error = %e, "Heartbeat failed, dropping link");
                self.close().await;
                return;
            }
        }
    }

    /// Handshake reply of this link
    pub fn handshake(&self) -> &HandshakeAck {
        &self.ack
    }

    pub fn session_id(&self) -> &str {
        &self.ack.session_id
    }

    pub fn epoch(&self) -> &str {
        &self.ack.epoch
    }

    pub fn is_connected(&self) -> bool {
        !self.closed.is_cancelled()
    }

    /// Resolves once the link is gone
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    /// Uncorrelated frames from the hub, in arrival order
    ///
    /// The receiver can be taken once.
    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<BusMessage>> {
        self.inbound.lock().take()
    }

    /// Send a message (fire and forget)
    pub async fn send(&self, msg: &BusMessage) -> Result<(), MessageError> {
        if !self.is_connected() {
            return Err(MessageError::Closed);
        }
        self.transport.write_message(msg).await
    }

    /// Send and wait for the correlated reply
    pub async fn request(&self, msg: &BusMessage) -> Result<BusMessage, MessageError> {
        self.request_with_timeout(msg, self.config.request_timeout).await
    }

    pub async fn request_with_timeout(
        &self,
        msg: &BusMessage,
        timeout: Duration,
    ) -> Result<BusMessage, MessageError> {
        let request_id = msg.request_id;
        let (tx, rx) = oneshot::channel();
        self.pending_requests.lock().insert(request_id, tx);

        if let Err(e) = self.send(msg).await {
            self.pending_requests.lock().remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(MessageError::Closed),
            Err(_) => {
                self.pending_requests.lock().remove(&request_id);
                Err(MessageError::Timeout(format!("{} request", msg.event_type)))
            }
        }
    }

    /// Submit one envelope and wait for its acknowledgement
    pub async fn submit(&self, envelope: &Envelope) -> Result<AckPayload, MessageError> {
        let msg = BusMessage::envelope(EventType::Submit, envelope)?;
        let reply = self.request(&msg).await?;
        decode_reply(&reply)
    }

    /// Ask the hub to catch the given routes up
    ///
    /// Snapshots and events arrive on the inbound channel before the reply.
    pub async fn resync(&self, cursors: Vec<RouteCursor>) -> Result<ResyncComplete, MessageError> {
        let msg = BusMessage::encode(EventType::Resync, &ResyncRequest { cursors })?;
        let reply = self.request(&msg).await?;
        decode_reply(&reply)
    }

    /// Close the link; waiters fail with `Closed`
    pub async fn close(&self) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();
        if let Err(e) = self.transport.close().await {
            tracing::debug!(error = %e, "Close failed");
        }
        self.pending_requests.lock().clear();
    }
}

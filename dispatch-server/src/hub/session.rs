//! One client session
//!
//! # Lifecycle
//!
//! ```text
//! Handshake ──► HandshakeAck ──► Snapshot per route ──► live loop ──► released
//!                  (subscribed to the manager before snapshots are read)
//! ```
//!
//! The live loop multiplexes three sources: frames from the client (read by
//! a dedicated task so a half-read frame is never dropped), route events
//! from the manager broadcast, and the shutdown token. All outbound frames
//! go through one writer task, so frames never interleave on the wire.
//!
//! # Ordering
//!
//! Every route the session follows has a cursor: the last sequence written
//! to the client. An event is written only when its sequence is above the
//! cursor. A jump of more than one is filled from the event log before the
//! event itself, so clients always receive a gap-free stream per route.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use shared::error::{AppError, ErrorCode};
use shared::message::{
    BusMessage, ClientRole, Envelope, EnvelopeType, EventType, HandshakeAck, HandshakePayload,
    PROTOCOL_VERSION, ResyncComplete, ResyncNotice, ResyncRequest, RouteCursor,
};
use shared::route::{EventPayload, RouteSnapshot, SyncEvent};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::processor::Submitter;
use super::transport::Transport;
use super::{HubContext, SessionInfo};

/// Delay before closing after a handshake error, so the client can read it
const HANDSHAKE_ERROR_DELAY_MS: u64 = 100;

/// Run a session to completion
pub(crate) async fn run(transport: Arc<dyn Transport>, ctx: HubContext, shutdown: CancellationToken) {
    let peer = transport.peer_addr().unwrap_or_else(|| "unknown".to_string());
    match handshake(&transport, &ctx).await {
        Ok((hello, request_id)) => {
            let session = Session::new(hello, ctx, transport.clone());
            if let Err(e) = session.serve(request_id, shutdown).await {
                tracing::debug!(peer = %peer, error = %e, "Session ended with error");
            }
        }
        Err(e) => {
            tracing::debug!(peer = %peer, error = %e, "Handshake failed");
        }
    }
    let _ = transport.close().await;
}

/// Wait for and validate the client hello
async fn handshake(
    transport: &Arc<dyn Transport>,
    ctx: &HubContext,
) -> Result<(HandshakePayload, uuid::Uuid), AppError> {
    let msg = tokio::time::timeout(ctx.config.heartbeat_timeout, transport.read_message())
        .await
        .map_err(|_| AppError::new(ErrorCode::TimeoutError))??;

    if msg.event_type != EventType::Handshake {
        tracing::warn!(got = %msg.event_type, "Expected handshake");
        let err = AppError::new(ErrorCode::HandshakeRequired);
        send_error(transport, &msg, &err).await;
        return Err(err);
    }

    let hello: HandshakePayload = msg
        .parse_payload()
        .map_err(|e| AppError::invalid_request(format!("Invalid handshake payload: {e}")))?;

    if hello.version != PROTOCOL_VERSION {
        tracing::warn!(
            client_id = %hello.client_id,
            expected = PROTOCOL_VERSION,
            got = hello.version,
            "Protocol version mismatch"
        );
        let err = AppError::with_message(
            ErrorCode::ProtocolMismatch,
            format!(
                "Protocol version mismatch: server={}, client={}",
                PROTOCOL_VERSION, hello.version
            ),
        );
        send_error(transport, &msg, &err).await;
        return Err(err);
    }
    if hello.role == ClientRole::Driver && hello.vehicle_id.is_none() && hello.routes.is_empty() {
        let err = AppError::validation("driver handshake needs a vehicle or routes");
        send_error(transport, &msg, &err).await;
        return Err(err);
    }

    Ok((hello, msg.request_id))
}

async fn send_error(transport: &Arc<dyn Transport>, request: &BusMessage, err: &AppError) {
    if let Ok(response) = BusMessage::response_to(request.request_id, err)
        && let Err(e) = transport.write_message(&response).await
    {
        tracing::debug!(error = %e, "Failed to send handshake error");
    }
    tokio::time::sleep(Duration::from_millis(HANDSHAKE_ERROR_DELAY_MS)).await;
}

struct Session {
    id: String,
    hello: HandshakePayload,
    ctx: HubContext,
    transport: Arc<dyn Transport>,
    /// Route -> last sequence written to the client
    cursors: Mutex<HashMap<String, u64>>,
    outbound: mpsc::UnboundedSender<BusMessage>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<BusMessage>>>,
}

impl Session {
    fn new(hello: HandshakePayload, ctx: HubContext, transport: Arc<dyn Transport>) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        Self {
            id: shared::util::new_id(),
            hello,
            ctx,
            transport,
            cursors: Mutex::new(HashMap::new()),
            outbound,
            outbound_rx: Mutex::new(Some(outbound_rx)),
        }
    }

    fn submitter(&self) -> Submitter {
        Submitter {
            client_id: self.hello.client_id.clone(),
            role: self.hello.role,
        }
    }

    fn send(&self, msg: BusMessage) {
        // Receiver gone means the writer stopped; the loop notices on its own
        let _ = self.outbound.send(msg);
    }

    fn send_encoded<T: serde::Serialize>(&self, event_type: EventType, data: &T) {
        match BusMessage::encode(event_type, data) {
            Ok(msg) => self.send(msg),
            Err(e) => tracing::error!(session_id = %self.id, error = %e, "Failed to encode frame"),
        }
    }

    fn reply<T: serde::Serialize>(&self, request: &BusMessage, data: &T) {
        match BusMessage::response_to(request.request_id, data) {
            Ok(msg) => self.send(msg),
            Err(e) => tracing::error!(session_id = %self.id, error = %e, "Failed to encode reply"),
        }
    }

    async fn serve(self, handshake_id: uuid::Uuid, shutdown: CancellationToken) -> Result<(), AppError> {
        let session = Arc::new(self);
        let disconnect = CancellationToken::new();

        // Writer task: the only place frames hit the transport
        let writer = {
            let transport = session.transport.clone();
            let disconnect = disconnect.clone();
            let mut rx = session
                .outbound_rx
                .lock()
                .take()
                .ok_or_else(|| AppError::internal("session already served"))?;
            tokio::spawn(async move {
                while let Some(msg) = rx.recv().await {
                    if let Err(e) = transport.write_message(&msg).await {
                        tracing::debug!(error = %e, "Client write failed");
                        break;
                    }
                }
                disconnect.cancel();
            })
        };

        // Subscribe before reading snapshots so nothing falls in between
        let mut events = session.ctx.manager.subscribe();
        let snapshots = session.initial_snapshots().await?;
        let routes: Vec<String> = snapshots.iter().map(|s| s.route_id.clone()).collect();

        session.reply_ack(handshake_id, &routes);
        {
            let mut cursors = session.cursors.lock();
            for snapshot in &snapshots {
                session.write_snapshot(&mut cursors, snapshot);
            }
        }

        session.ctx.sessions.insert(
            session.id.clone(),
            SessionInfo {
                session_id: session.id.clone(),
                client_id: session.hello.client_id.clone(),
                role: session.hello.role,
                vehicle_id: session.hello.vehicle_id.clone(),
                peer_addr: session.transport.peer_addr(),
                connected_at: shared::util::now_millis(),
                routes,
            },
        );
        tracing::info!(
            session_id = %session.id,
            client_id = %session.hello.client_id,
            role = %session.hello.role,
            routes = snapshots.len(),
            "Client session started"
        );

        // Reader task: whole frames into a channel
        let (inbound_tx, mut inbound) = mpsc::channel::<BusMessage>(64);
        let reader = {
            let transport = session.transport.clone();
            tokio::spawn(async move {
                loop {
                    match transport.read_message().await {
                        Ok(msg) => {
                            if inbound_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            if e.code != ErrorCode::ClientDisconnected {
                                tracing::debug!(error = %e, "Client read failed");
                            }
                            break;
                        }
                    }
                }
            })
        };

        let timeout = session.ctx.config.heartbeat_timeout;
        let mut deadline = Instant::now() + timeout;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!(session_id = %session.id, "Hub shutting down, closing session");
                    break;
                }
                _ = disconnect.cancelled() => break,
                _ = tokio::time::sleep_until(deadline) => {
                    tracing::info!(
                        session_id = %session.id,
                        client_id = %session.hello.client_id,
                        "Heartbeat timeout, releasing session"
                    );
                    break;
                }
                frame = inbound.recv() => {
                    let Some(msg) = frame else {
                        tracing::debug!(session_id = %session.id, "Client disconnected");
                        break;
                    };
                    deadline = Instant::now() + timeout;
                    session.handle_frame(msg).await;
                }
                event = events.recv() => {
                    match event {
                        Ok(event) => session.forward(&event),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!(
                                session_id = %session.id,
                                dropped = n,
                                "Session lagged behind, asking client to resync"
                            );
                            session.send_encoded(
                                EventType::Resync,
                                &ResyncNotice { reason: format!("lagged by {n} events") },
                            );
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        }

        session.ctx.sessions.remove(&session.id);
        reader.abort();
        writer.abort();
        tracing::info!(session_id = %session.id, client_id = %session.hello.client_id, "Client session released");
        Ok(())
    }

    fn reply_ack(&self, handshake_id: uuid::Uuid, routes: &[String]) {
        let ack = HandshakeAck {
            session_id: self.id.clone(),
            epoch: self.ctx.manager.epoch().to_string(),
            routes: routes.to_vec(),
            heartbeat_timeout_ms: self.ctx.config.heartbeat_timeout.as_millis() as u64,
        };
        match BusMessage::response_to(handshake_id, &ack) {
            Ok(msg) => self.send(msg),
            Err(e) => tracing::error!(error = %e, "Failed to encode handshake ack"),
        }
    }

    /// Live routes this client follows from the start
    async fn initial_snapshots(&self) -> Result<Vec<RouteSnapshot>, AppError> {
        let manager = self.ctx.manager.clone();
        let hello = self.hello.clone();
        let snapshots = tokio::task::spawn_blocking(move || -> Result<Vec<RouteSnapshot>, AppError> {
            let mut snapshots = match (hello.role, &hello.vehicle_id) {
                (ClientRole::Dispatcher, _) => manager.get_active_routes()?,
                (ClientRole::Driver, Some(vehicle_id)) => manager
                    .get_routes_for_vehicle(vehicle_id)?
                    .into_iter()
                    .filter(|r| r.is_active())
                    .collect(),
                (ClientRole::Driver, None) => vec![],
            };
            for route_id in &hello.routes {
                if snapshots.iter().any(|s| &s.route_id == route_id) {
                    continue;
                }
                if let Some(snapshot) = manager.get_snapshot(route_id)? {
                    snapshots.push(snapshot);
                }
            }
            snapshots.sort_by(|a, b| a.route_id.cmp(&b.route_id));
            Ok(snapshots)
        })
        .await
        .map_err(|e| AppError::internal(e.to_string()))??;
        Ok(snapshots)
    }

    fn write_snapshot(&self, cursors: &mut HashMap<String, u64>, snapshot: &RouteSnapshot) {
        match Envelope::snapshot(snapshot) {
            Ok(envelope) => {
                self.send_encoded(EventType::Snapshot, &envelope);
                cursors.insert(snapshot.route_id.clone(), snapshot.last_sequence);
            }
            Err(e) => tracing::error!(route_id = %snapshot.route_id, error = %e, "Failed to encode snapshot"),
        }
    }

    fn write_event(&self, cursors: &mut HashMap<String, u64>, event: &SyncEvent) {
        match Envelope::from_event(event) {
            Ok(envelope) => {
                self.send_encoded(EventType::Sync, &envelope);
                cursors.insert(event.route_id.clone(), event.sequence);
            }
            Err(e) => tracing::error!(route_id = %event.route_id, error = %e, "Failed to encode event"),
        }
    }

    /// Whether this client starts following a route it just saw an event for
    fn follows_new_route(&self, event: &SyncEvent) -> bool {
        if self.hello.routes.contains(&event.route_id) {
            return true;
        }
        match (self.hello.role, &self.hello.vehicle_id) {
            (ClientRole::Dispatcher, _) => true,
            (ClientRole::Driver, Some(mine)) => match &event.payload {
                EventPayload::RouteCreated { vehicle_id, .. } => vehicle_id == mine,
                EventPayload::RouteStatusChanged {
                    vehicle_id: Some(vehicle_id),
                    ..
                } => vehicle_id == mine,
                _ => false,
            },
            (ClientRole::Driver, None) => false,
        }
    }

    /// Forward a live event, keeping the per-route stream gap-free
    fn forward(&self, event: &SyncEvent) {
        let mut cursors = self.cursors.lock();
        let Some(&cursor) = cursors.get(&event.route_id) else {
            if self.follows_new_route(event) {
                match self.ctx.manager.get_snapshot(&event.route_id) {
                    Ok(Some(snapshot)) => self.write_snapshot(&mut cursors, &snapshot),
                    Ok(None) => {}
                    Err(e) => tracing::warn!(route_id = %event.route_id, error = %e, "Failed to load new route"),
                }
            }
            return;
        };

        if event.sequence <= cursor {
            return;
        }
        if event.sequence == cursor + 1 {
            self.write_event(&mut cursors, event);
            return;
        }

        // Gap: fill from the log, which already holds this event
        match self.ctx.manager.get_events_since(&event.route_id, cursor) {
            Ok(missed) => {
                tracing::debug!(
                    session_id = %self.id,
                    route_id = %event.route_id,
                    from = cursor,
                    to = event.sequence,
                    "Filling sequence gap from the event log"
                );
                for missed in missed.iter().filter(|e| e.sequence <= event.sequence) {
                    self.write_event(&mut cursors, missed);
                }
            }
            Err(e) => {
                tracing::warn!(route_id = %event.route_id, error = %e, "Gap fill failed, asking client to resync");
                self.send_encoded(
                    EventType::Resync,
                    &ResyncNotice {
                        reason: format!("sequence gap on {}", event.route_id),
                    },
                );
            }
        }
    }

    async fn handle_frame(self: &Arc<Self>, msg: BusMessage) {
        match msg.event_type {
            EventType::Heartbeat => {
                if let Ok(pong) = BusMessage::heartbeat() {
                    self.send(pong.with_correlation_id(msg.request_id));
                }
            }
            EventType::Submit => self.handle_submit(msg),
            EventType::Resync => self.handle_resync(msg).await,
            EventType::Handshake => {
                tracing::warn!(session_id = %self.id, "Duplicate handshake ignored");
            }
            other => {
                tracing::warn!(session_id = %self.id, event_type = %other, "Unexpected frame from client");
                self.reply(&msg, &AppError::invalid_request(format!("unexpected {other} frame")));
            }
        }
    }

    fn handle_submit(self: &Arc<Self>, msg: BusMessage) {
        let envelope: Envelope = match msg.parse_payload() {
            Ok(envelope) => envelope,
            Err(e) => {
                let ack = shared::message::AckPayload::rejected(
                    String::new(),
                    AppError::invalid_request(format!("invalid envelope: {e}")),
                );
                self.reply(&msg, &ack);
                return;
            }
        };
        let key = envelope.idempotency_key.clone().unwrap_or_default();

        if !self.cursors.lock().contains_key(&envelope.route_id) {
            crate::security_log!(
                "WARN",
                "submit_not_subscribed",
                session_id = self.id.as_str(),
                client_id = self.hello.client_id.as_str(),
                route_id = envelope.route_id.as_str()
            );
            let err = AppError::not_subscribed(envelope.route_id.clone());
            self.reply(&msg, &shared::message::AckPayload::rejected(key, err));
            return;
        }
        if envelope.kind == EnvelopeType::Snapshot || envelope.kind == EnvelopeType::Heartbeat {
            let err = AppError::invalid_request(format!("{:?} is not a submission", envelope.kind));
            self.reply(&msg, &shared::message::AckPayload::rejected(key, err));
            return;
        }

        let session = self.clone();
        tokio::spawn(async move {
            let ack = session
                .ctx
                .processor
                .process(&session.submitter(), &envelope)
                .await;
            session.reply(&msg, &ack);
        });
    }

    /// Catch the client up from its cursors
    async fn handle_resync(self: &Arc<Self>, msg: BusMessage) {
        let request: ResyncRequest = match msg.parse_payload() {
            Ok(request) => request,
            Err(e) => {
                self.reply(&msg, &AppError::invalid_request(format!("invalid resync request: {e}")));
                return;
            }
        };

        // Only routes this session follows or may follow
        let mut dropped = Vec::new();
        let mut allowed = Vec::with_capacity(request.cursors.len());
        {
            let cursors = self.cursors.lock();
            for cursor in request.cursors {
                if cursors.contains_key(&cursor.route_id) || self.may_follow(&cursor.route_id) {
                    allowed.push(cursor);
                } else {
                    dropped.push(cursor.route_id);
                }
            }
        }

        let sync = self.ctx.sync.clone();
        let request = ResyncRequest { cursors: allowed };
        let response = match tokio::task::spawn_blocking(move || sync.sync(&request, None)).await {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.reply(&msg, &AppError::from(e));
                return;
            }
            Err(e) => {
                self.reply(&msg, &AppError::internal(e.to_string()));
                return;
            }
        };

        let mut cursors = self.cursors.lock();
        for route in response.routes {
            if route.requires_full_sync {
                match route.snapshot {
                    Some(snapshot) => self.write_snapshot(&mut cursors, &snapshot),
                    None => {
                        cursors.remove(&route.route_id);
                        dropped.push(route.route_id);
                    }
                }
                continue;
            }
            let cursor = cursors.get(&route.route_id).copied();
            for event in route.events {
                if cursor.is_none_or(|c| event.sequence > c) {
                    self.write_event(&mut cursors, &event);
                }
            }
            // Up to date with nothing to send still starts the subscription
            cursors.entry(route.route_id).or_insert(route.server_sequence);
        }

        let complete = ResyncComplete {
            cursors: cursors
                .iter()
                .map(|(route_id, last_sequence)| RouteCursor {
                    route_id: route_id.clone(),
                    last_sequence: *last_sequence,
                })
                .collect(),
            dropped,
            epoch: response.server_epoch,
        };
        drop(cursors);
        self.reply(&msg, &complete);
    }

    /// Permission check for routes outside the current subscription
    fn may_follow(&self, route_id: &str) -> bool {
        if self.hello.role == ClientRole::Dispatcher || self.hello.routes.iter().any(|r| r == route_id) {
            return true;
        }
        let Some(mine) = &self.hello.vehicle_id else {
            return false;
        };
        matches!(
            self.ctx.manager.get_snapshot(route_id),
            Ok(Some(snapshot)) if &snapshot.vehicle_id == mine
        )
    }
}

//! Driver session
//!
//! What the driver app talks to. Owns the durable queue, the local route
//! view and the replay worker, and keeps at most one live hub link.
//!
//! ```text
//!  driver taps ──► check against projected view ──► OfflineQueue ──► ReplayWorker ──► hub
//!                                                        ▲                              │
//!  projected view ◄── confirmed view + queued items ─────┘     snapshots / events ◄─────┘
//! ```

use std::sync::Arc;

use parking_lot::RwLock;
use shared::message::{
    ClientRole, DriverAction, Envelope, EventType, HandshakeAck, HandshakePayload,
    PROTOCOL_VERSION, ResyncNotice, RouteCursor,
};
use shared::models::GeoPoint;
use shared::route::{RouteSnapshot, StopStatus, SyncEvent};
use tokio::io::DuplexStream;
use tokio::sync::{Notify, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::DriverConfig;
use crate::error::{ClientError, ClientResult};
use crate::message::{BusMessage, MessageClient, MessageError};
use crate::queue::{OfflineQueue, QueueEvent, QueueItem, RejectedItem, ReplayWorker};
use crate::state::{ApplyOutcome, LocalRouteView};

struct Inner {
    config: DriverConfig,
    queue: OfflineQueue,
    view: RwLock<LocalRouteView>,
    link: watch::Sender<Option<MessageClient>>,
    wake: Arc<Notify>,
    queue_events: broadcast::Sender<QueueEvent>,
    route_updates: broadcast::Sender<String>,
    shutdown: CancellationToken,
}

#[derive(Clone)]
pub struct DriverSession {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for DriverSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DriverSession")
            .field("client_id", &self.inner.config.client_id)
            .field("online", &self.is_online())
            .finish_non_exhaustive()
    }
}

impl DriverSession {
    /// Start the session and its replay worker
    ///
    /// Items left in the queue by a previous run are replayed as soon as a
    /// link is up.
    pub fn start(config: DriverConfig, queue: OfflineQueue) -> Self {
        let (link, link_rx) = watch::channel(None);
        let (queue_events, _) = broadcast::channel(256);
        let (route_updates, _) = broadcast::channel(256);
        let wake = Arc::new(Notify::new());
        let shutdown = CancellationToken::new();

        let worker = ReplayWorker::new(
            queue.clone(),
            config.queue.clone(),
            link_rx,
            wake.clone(),
            queue_events.clone(),
        );
        tokio::spawn(worker.run(shutdown.child_token()));

        Self {
            inner: Arc::new(Inner {
                config,
                queue,
                view: RwLock::new(LocalRouteView::new()),
                link,
                wake,
                queue_events,
                route_updates,
                shutdown,
            }),
        }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.inner.config
    }

    pub fn is_online(&self) -> bool {
        self.inner
            .link
            .borrow()
            .as_ref()
            .is_some_and(MessageClient::is_connected)
    }

    /// Current hub session id
    pub fn session_id(&self) -> Option<String> {
        self.inner
            .link
            .borrow()
            .as_ref()
            .map(|c| c.session_id().to_string())
    }

    fn hello(&self) -> HandshakePayload {
        let config = &self.inner.config;
        HandshakePayload {
            version: PROTOCOL_VERSION,
            role: ClientRole::Driver,
            client_id: config.client_id.clone(),
            vehicle_id: config.vehicle_id.clone(),
            routes: config.routes.clone(),
            epoch: self.inner.view.read().epoch().map(str::to_string),
        }
    }

    /// Connect once over TCP
    pub async fn connect(&self, addr: &str) -> ClientResult<HandshakeAck> {
        let client =
            MessageClient::connect(addr, &self.hello(), self.inner.config.message.clone()).await?;
        Ok(self.attach(client).await)
    }

    /// Connect over an in-process pipe
    pub async fn connect_memory(&self, stream: DuplexStream) -> ClientResult<HandshakeAck> {
        let client =
            MessageClient::connect_memory(stream, &self.hello(), self.inner.config.message.clone())
                .await?;
        Ok(self.attach(client).await)
    }

    /// Keep a TCP link up, reconnecting with backoff
    ///
    /// Stops on shutdown, when the hub refuses the handshake, or when
    /// reconnects are disabled or exhausted.
    pub fn spawn_tcp(&self, addr: impl Into<String>) -> JoinHandle<()> {
        let session = self.clone();
        let addr = addr.into();
        tokio::spawn(async move {
            let config = session.inner.config.message.clone();
            let shutdown = session.inner.shutdown.clone();
            let mut attempt = 0u32;
            while !shutdown.is_cancelled() {
                match MessageClient::connect(&addr, &session.hello(), config.clone()).await {
                    Ok(client) => {
                        attempt = 0;
                        session.attach(client.clone()).await;
                        tokio::select! {
                            _ = shutdown.cancelled() => {
                                client.close().await;
                                break;
                            }
                            _ = client.closed() => {}
                        }
                        tracing::info!(addr = %addr, "Hub link lost");
                    }
                    Err(MessageError::Hub(err)) => {
                        tracing::error!(addr = %addr, code = ?err.code, error = %err, "Hub refused the device");
                        break;
                    }
                    Err(e) => {
                        attempt += 1;
                        tracing::warn!(addr = %addr, attempt, error = %e, "Hub unreachable");
                    }
                }
                if !config.auto_reconnect {
                    break;
                }
                if config.max_reconnect_attempts > 0 && attempt >= config.max_reconnect_attempts {
                    tracing::error!(addr = %addr, attempt, "Giving up reconnecting");
                    break;
                }
                let delay = config.reconnect_backoff(attempt.max(1));
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        })
    }

    /// Adopt a freshly handshaken link
    ///
    /// Routes the device still holds but the hub did not snapshot (ended
    /// while offline) are caught up first, so their queued items reach a
    /// session that follows them. Replay starts only after that.
    async fn attach(&self, client: MessageClient) -> HandshakeAck {
        let ack = client.handshake().clone();
        if self.inner.view.write().adopt_epoch(&ack.epoch) {
            tracing::info!(epoch = %ack.epoch, "Full resync after hub restart");
        }
        if let Some(inbound) = client.take_inbound() {
            let session = self.clone();
            let link = client.clone();
            tokio::spawn(async move { session.pump(link, inbound).await });
        }

        let stale: Vec<RouteCursor> = self
            .inner
            .view
            .read()
            .cursors()
            .into_iter()
            .filter(|c| !ack.routes.contains(&c.route_id))
            .collect();
        if !stale.is_empty() {
            tracing::debug!(routes = stale.len(), "Catching up routes outside the handshake");
            self.resync(&client, stale).await;
        }

        if let Some(previous) = self.inner.link.send_replace(Some(client)) {
            tokio::spawn(async move { previous.close().await });
        }
        ack
    }

    /// Apply hub traffic to the local view until the link drops
    async fn pump(self, client: MessageClient, mut inbound: mpsc::UnboundedReceiver<BusMessage>) {
        loop {
            let msg = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                msg = inbound.recv() => msg,
            };
            let Some(msg) = msg else { break };
            match msg.event_type {
                EventType::Snapshot => self.on_snapshot(&msg),
                EventType::Sync => {
                    if let Some(cursor) = self.on_event(&msg) {
                        self.resync(&client, vec![cursor]).await;
                    }
                }
                EventType::Resync => {
                    let reason = msg
                        .parse_payload::<ResyncNotice>()
                        .map(|n| n.reason)
                        .unwrap_or_default();
                    tracing::info!(reason = %reason, "Hub asked for a resync");
                    let cursors = self.inner.view.read().cursors();
                    self.resync(&client, cursors).await;
                }
                other => tracing::debug!(event_type = %other, "Ignoring frame"),
            }
        }

        // Only clear the link if it is still ours
        let session_id = client.session_id().to_string();
        self.inner.link.send_if_modified(|current| {
            if current.as_ref().is_some_and(|c| c.session_id() == session_id) {
                *current = None;
                true
            } else {
                false
            }
        });
        tracing::info!(session_id = %session_id, "Offline");
    }

    fn on_snapshot(&self, msg: &BusMessage) {
        let snapshot = msg
            .parse_payload::<Envelope>()
            .and_then(|e| e.parse::<RouteSnapshot>());
        match snapshot {
            Ok(snapshot) => {
                let route_id = snapshot.route_id.clone();
                if self.inner.view.write().apply_snapshot(snapshot) {
                    let _ = self.inner.route_updates.send(route_id);
                }
            }
            Err(e) => tracing::warn!(error = %e, "Malformed snapshot"),
        }
    }

    /// Apply one event; returns a cursor when the route must be resynced
    fn on_event(&self, msg: &BusMessage) -> Option<RouteCursor> {
        let event = match msg
            .parse_payload::<Envelope>()
            .and_then(|e| e.parse::<SyncEvent>())
        {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed sync event");
                return None;
            }
        };
        let outcome = self.inner.view.write().apply_event(&event);
        match outcome {
            ApplyOutcome::Applied => {
                let _ = self.inner.route_updates.send(event.route_id);
                None
            }
            ApplyOutcome::Duplicate => None,
            ApplyOutcome::Gap { expected, received } => {
                tracing::info!(route_id = %event.route_id, expected, received, "Sequence gap");
                Some(RouteCursor {
                    route_id: event.route_id,
                    last_sequence: expected - 1,
                })
            }
            ApplyOutcome::UnknownRoute => Some(RouteCursor {
                route_id: event.route_id,
                last_sequence: 0,
            }),
        }
    }

    async fn resync(&self, client: &MessageClient, cursors: Vec<RouteCursor>) {
        match client.resync(cursors).await {
            Ok(done) => {
                let mut view = self.inner.view.write();
                for route_id in &done.dropped {
                    if view.remove(route_id).is_some() {
                        tracing::info!(route_id = %route_id, "Route dropped by hub");
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "Resync failed"),
        }
    }

    // ========== Driver actions ==========

    fn record(&self, route_id: &str, action: DriverAction) -> ClientResult<QueueItem> {
        let pending = self.inner.queue.items()?;
        let observed = {
            let view = self.inner.view.read();
            view.check_action(route_id, &action, &pending)
                .map_err(ClientError::Rejected)?;
            view.last_sequence(route_id)
        };
        let item = self.inner.queue.enqueue(route_id, action, observed)?;
        self.inner.wake.notify_one();
        let _ = self.inner.route_updates.send(route_id.to_string());
        Ok(item)
    }

    fn stop_status(
        &self,
        route_id: &str,
        order_id: &str,
        status: StopStatus,
        evidence_ref: Option<String>,
        failure_reason: Option<String>,
    ) -> ClientResult<QueueItem> {
        self.record(
            route_id,
            DriverAction::StopStatus {
                order_id: order_id.to_string(),
                status,
                occurred_at: shared::util::now_millis(),
                evidence_ref,
                failure_reason,
            },
        )
    }

    pub fn depart(&self, route_id: &str, order_id: &str) -> ClientResult<QueueItem> {
        self.stop_status(route_id, order_id, StopStatus::EnRoute, None, None)
    }

    pub fn arrive(&self, route_id: &str, order_id: &str) -> ClientResult<QueueItem> {
        self.stop_status(route_id, order_id, StopStatus::Arrived, None, None)
    }

    /// Delivery done; `evidence_ref` points at the signature or photo
    pub fn complete(
        &self,
        route_id: &str,
        order_id: &str,
        evidence_ref: Option<String>,
    ) -> ClientResult<QueueItem> {
        self.stop_status(route_id, order_id, StopStatus::Completed, evidence_ref, None)
    }

    pub fn fail(&self, route_id: &str, order_id: &str, reason: impl Into<String>) -> ClientResult<QueueItem> {
        self.stop_status(route_id, order_id, StopStatus::Failed, None, Some(reason.into()))
    }

    pub fn report_location(&self, route_id: &str, location: GeoPoint) -> ClientResult<QueueItem> {
        self.record(
            route_id,
            DriverAction::Location {
                location,
                recorded_at: shared::util::now_millis(),
            },
        )
    }

    // ========== Views ==========

    /// Route as the driver should see it: confirmed state plus queued actions
    pub fn route(&self, route_id: &str) -> ClientResult<Option<RouteSnapshot>> {
        let pending = self.inner.queue.items()?;
        Ok(self.inner.view.read().optimistic(route_id, &pending))
    }

    pub fn routes(&self) -> ClientResult<Vec<RouteSnapshot>> {
        let pending = self.inner.queue.items()?;
        let view = self.inner.view.read();
        Ok(view
            .route_ids()
            .iter()
            .filter_map(|id| view.optimistic(id, &pending))
            .collect())
    }

    /// Last state the hub confirmed
    pub fn confirmed_route(&self, route_id: &str) -> Option<RouteSnapshot> {
        self.inner.view.read().confirmed(route_id).cloned()
    }

    /// Route ids changed locally or by the hub
    pub fn subscribe_routes(&self) -> broadcast::Receiver<String> {
        self.inner.route_updates.subscribe()
    }

    // ========== Queue ==========

    pub fn subscribe_queue(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.queue_events.subscribe()
    }

    pub fn pending(&self) -> ClientResult<Vec<QueueItem>> {
        Ok(self.inner.queue.items()?)
    }

    pub fn failed(&self) -> ClientResult<Vec<QueueItem>> {
        Ok(self.inner.queue.failed()?)
    }

    pub fn rejected(&self) -> ClientResult<Vec<RejectedItem>> {
        Ok(self.inner.queue.rejected()?)
    }

    /// Put a failed item back in line; it unblocks the queue
    pub fn retry(&self, id: &str) -> ClientResult<QueueItem> {
        let item = self.inner.queue.retry(id)?;
        self.inner.wake.notify_one();
        Ok(item)
    }

    /// Drop a failed item for good; the items behind it continue
    pub fn discard(&self, id: &str) -> ClientResult<QueueItem> {
        let item = self.inner.queue.discard(id)?;
        self.inner.wake.notify_one();
        let _ = self.inner.route_updates.send(item.route_id.clone());
        Ok(item)
    }

    pub fn dismiss_rejected(&self, id: &str) -> ClientResult<bool> {
        Ok(self.inner.queue.dismiss_rejected(id)?)
    }

    /// Close the link (the queue keeps filling)
    pub async fn disconnect(&self) {
        if let Some(client) = self.inner.link.send_replace(None) {
            client.close().await;
        }
    }

    /// Stop the worker and close the link
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.disconnect().await;
    }
}

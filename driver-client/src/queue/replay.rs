//! Replay worker
//!
//! Exactly one per device. Takes the queue head, submits it and waits for
//! the acknowledgement before touching the next item:
//!
//! - applied / duplicate: the item is removed
//! - rejected for a business reason: moved to the rejected list
//! - anything transient: counted, retried after backoff, and marked
//!   `failed_to_sync` once the attempt cap is hit
//!
//! A `failed_to_sync` head blocks the queue until the driver retries or
//! discards it. Time spent offline never counts as an attempt.

use std::sync::Arc;

use serde::Serialize;
use shared::error::AppError;
use shared::message::AckStatus;
use tokio::sync::{Notify, broadcast, watch};
use tokio_util::sync::CancellationToken;

use super::{OfflineQueue, QueueItem};
use crate::config::QueueConfig;
use crate::message::{MessageClient, MessageError};

/// What happened to a queued item
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueueEvent {
    Synced {
        id: String,
        route_id: String,
        sequence_number: Option<u64>,
        duplicate: bool,
    },
    Rejected {
        id: String,
        route_id: String,
        error: AppError,
    },
    FailedToSync {
        id: String,
        route_id: String,
        attempts: u32,
        error: Option<AppError>,
    },
}

enum Outcome {
    Settled { sequence: Option<u64>, duplicate: bool },
    Rejected(AppError),
    Retry(String),
    LinkLost,
}

pub struct ReplayWorker {
    queue: OfflineQueue,
    config: QueueConfig,
    link: watch::Receiver<Option<MessageClient>>,
    wake: Arc<Notify>,
    events: broadcast::Sender<QueueEvent>,
}

impl ReplayWorker {
    pub fn new(
        queue: OfflineQueue,
        config: QueueConfig,
        link: watch::Receiver<Option<MessageClient>>,
        wake: Arc<Notify>,
        events: broadcast::Sender<QueueEvent>,
    ) -> Self {
        Self {
            queue,
            config,
            link,
            wake,
            events,
        }
    }

    fn emit(&self, event: QueueEvent) {
        // No listener is fine
        let _ = self.events.send(event);
    }

    /// Current live link, if any
    fn client(&self) -> Option<MessageClient> {
        self.link.borrow().clone().filter(MessageClient::is_connected)
    }

    /// Park until something may have changed; false once the session is gone
    async fn idle(&mut self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = self.wake.notified() => true,
            changed = self.link.changed() => changed.is_ok(),
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        tracing::info!("Replay worker started");
        while !shutdown.is_cancelled() {
            let head = match self.queue.head() {
                Ok(head) => head,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to read offline queue");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.config.max_delay) => continue,
                    }
                }
            };

            let Some(item) = head else {
                if !self.idle(&shutdown).await {
                    break;
                }
                continue;
            };
            if item.is_blocked() {
                tracing::debug!(id = %item.id, "Queue blocked by failed item");
                if !self.idle(&shutdown).await {
                    break;
                }
                continue;
            }
            let Some(client) = self.client() else {
                if !self.idle(&shutdown).await {
                    break;
                }
                continue;
            };

            match self.submit(&client, &item).await {
                Outcome::Settled { sequence, duplicate } => {
                    if let Err(e) = self.queue.acknowledge(&item.id) {
                        tracing::error!(id = %item.id, error = %e, "Failed to drop acknowledged item");
                        continue;
                    }
                    tracing::debug!(id = %item.id, sequence = ?sequence, duplicate, "Queue item synced");
                    self.emit(QueueEvent::Synced {
                        id: item.id,
                        route_id: item.route_id,
                        sequence_number: sequence,
                        duplicate,
                    });
                }
                Outcome::Rejected(error) => match self.queue.reject(&item.id, error.clone()) {
                    Ok(_) => self.emit(QueueEvent::Rejected {
                        id: item.id,
                        route_id: item.route_id,
                        error,
                    }),
                    Err(e) => tracing::error!(id = %item.id, error = %e, "Failed to record rejection"),
                },
                Outcome::LinkLost => {
                    tracing::info!(id = %item.id, "Link lost during replay, waiting for reconnect");
                }
                Outcome::Retry(reason) => {
                    let item = match self.queue.record_attempt(&item.id, &reason) {
                        Ok(item) => item,
                        Err(e) => {
                            tracing::error!(id = %item.id, error = %e, "Failed to record attempt");
                            continue;
                        }
                    };
                    if item.attempts >= self.config.max_attempts {
                        match self.queue.mark_failed(&item.id) {
                            Ok(failed) => self.emit(QueueEvent::FailedToSync {
                                error: failed.sync_error(),
                                id: failed.id,
                                route_id: failed.route_id,
                                attempts: failed.attempts,
                            }),
                            Err(e) => tracing::error!(id = %item.id, error = %e, "Failed to mark item"),
                        }
                        continue;
                    }
                    let delay = self.config.backoff_delay(item.attempts);
                    tracing::debug!(id = %item.id, attempts = item.attempts, delay_ms = delay.as_millis() as u64, reason = %reason, "Replay backoff");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        tracing::info!("Replay worker stopped");
    }

    async fn submit(&self, client: &MessageClient, item: &QueueItem) -> Outcome {
        let envelope = match item.to_envelope() {
            Ok(envelope) => envelope,
            Err(e) => return Outcome::Rejected(AppError::invalid_request(e.to_string())),
        };
        match client.submit(&envelope).await {
            Ok(ack) => match ack.status {
                AckStatus::Applied => Outcome::Settled {
                    sequence: ack.sequence_number,
                    duplicate: false,
                },
                AckStatus::Duplicate => Outcome::Settled {
                    sequence: ack.sequence_number,
                    duplicate: true,
                },
                AckStatus::Rejected if ack.is_retryable() => Outcome::Retry(
                    ack.error
                        .map(|e| e.message)
                        .unwrap_or_else(|| "rejected".to_string()),
                ),
                AckStatus::Rejected => Outcome::Rejected(
                    ack.error
                        .unwrap_or_else(|| AppError::internal("rejected without error")),
                ),
            },
            Err(MessageError::Hub(err)) if err.is_retryable() => Outcome::Retry(err.message),
            Err(MessageError::Hub(err)) => Outcome::Rejected(err),
            Err(_) if !client.is_connected() => Outcome::LinkLost,
            Err(MessageError::Closed) => Outcome::LinkLost,
            Err(e) => Outcome::Retry(e.to_string()),
        }
    }
}

//! Event Router - fans route events out to server-side workers
//!
//! ```text
//! DispatchManager (broadcast)
//!        │
//!        └── EventRouter
//!               └── mpsc ──► RefreshWorker (failed stops only)
//! ```
//!
//! Hub sessions subscribe to the broadcast directly; the router only feeds
//! workers that react to events. A failed stop is never dropped: the send
//! waits for room in the channel.

use shared::route::{EventPayload, StopStatus, SyncEvent};
use tokio::sync::{broadcast, mpsc};

/// A stop failed on a live route
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedStop {
    pub route_id: String,
    pub order_id: String,
    pub sequence: u64,
}

pub struct EventChannels {
    pub failed_rx: mpsc::Receiver<FailedStop>,
}

pub struct EventRouter {
    failed_tx: mpsc::Sender<FailedStop>,
}

impl EventRouter {
    pub fn new(buffer: usize) -> (Self, EventChannels) {
        let (failed_tx, failed_rx) = mpsc::channel(buffer);
        (Self { failed_tx }, EventChannels { failed_rx })
    }

    /// Run until the source closes
    pub async fn run(self, mut source: broadcast::Receiver<SyncEvent>) {
        tracing::info!("Event router started");

        loop {
            match source.recv().await {
                Ok(event) => {
                    if !self.dispatch(&event).await {
                        tracing::info!("Failed-stop channel closed, event router stopping");
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::error!(skipped = n, "Event router lagged, failed-stop refreshes may be missed");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::info!("Source channel closed, event router stopping");
                    break;
                }
            }
        }
    }

    /// Route one event; false once the receiver is gone
    async fn dispatch(&self, event: &SyncEvent) -> bool {
        let EventPayload::StopStatusChanged {
            order_id,
            to: StopStatus::Failed,
            ..
        } = &event.payload
        else {
            return true;
        };

        let failed = FailedStop {
            route_id: event.route_id.clone(),
            order_id: order_id.clone(),
            sequence: event.sequence,
        };
        self.failed_tx.send(failed).await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::route::EventOrigin;

    fn event(route_id: &str, sequence: u64, payload: EventPayload) -> SyncEvent {
        SyncEvent::new(
            route_id.to_string(),
            sequence,
            EventOrigin::Driver,
            None,
            format!("c-{sequence}"),
            payload,
        )
    }

    fn stop_change(order_id: &str, to: StopStatus) -> EventPayload {
        EventPayload::StopStatusChanged {
            order_id: order_id.to_string(),
            from: StopStatus::EnRoute,
            to,
            occurred_at: 0,
            evidence_ref: None,
            failure_reason: None,
        }
    }

    #[tokio::test]
    async fn test_only_failed_stops_are_routed() {
        let (tx, rx) = broadcast::channel(16);
        let (router, mut channels) = EventRouter::new(8);
        let handle = tokio::spawn(router.run(rx));

        tx.send(event("r-1", 4, stop_change("a", StopStatus::Completed))).unwrap();
        tx.send(event("r-1", 5, stop_change("b", StopStatus::Failed))).unwrap();
        drop(tx);

        let failed = channels.failed_rx.recv().await.unwrap();
        assert_eq!(
            failed,
            FailedStop {
                route_id: "r-1".to_string(),
                order_id: "b".to_string(),
                sequence: 5,
            }
        );
        handle.await.unwrap();
        assert!(channels.failed_rx.recv().await.is_none());
    }
}

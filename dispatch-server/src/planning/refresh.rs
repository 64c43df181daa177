//! Re-times live routes after a stop fails
//!
//! Failures arriving in a burst for the same route are coalesced into one
//! refresh; the re-optimizer cancels a run that is overtaken anyway.

use std::collections::BTreeSet;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::Reoptimizer;
use crate::core::event_router::FailedStop;

#[derive(Debug, Clone)]
pub struct RefreshWorker {
    reoptimizer: Reoptimizer,
}

impl RefreshWorker {
    pub fn new(reoptimizer: Reoptimizer) -> Self {
        Self { reoptimizer }
    }

    pub async fn run(self, mut rx: mpsc::Receiver<FailedStop>, shutdown: CancellationToken) {
        tracing::info!("RefreshWorker started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("RefreshWorker shutting down");
                    break;
                }
                first = rx.recv() => {
                    let Some(first) = first else { break };
                    let mut routes = BTreeSet::from([first.route_id]);
                    while let Ok(more) = rx.try_recv() {
                        routes.insert(more.route_id);
                    }
                    for route_id in routes {
                        self.refresh(&route_id).await;
                    }
                }
            }
        }
    }

    async fn refresh(&self, route_id: &str) {
        match self.reoptimizer.refresh_after_failure(route_id).await {
            Ok(outcome) if !outcome.infeasible.is_empty() => {
                tracing::warn!(
                    route_id = %route_id,
                    infeasible = ?outcome.infeasible,
                    "Stops can no longer make their windows"
                );
            }
            Ok(outcome) => {
                tracing::debug!(route_id = %route_id, refreshed = outcome.sequence_refreshed, "Route re-timed");
            }
            Err(e) => tracing::warn!(route_id = %route_id, error = %e, "Route refresh failed"),
        }
    }
}

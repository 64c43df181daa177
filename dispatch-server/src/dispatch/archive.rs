//! Archive Worker - moves finished routes out of the live tables
//!
//! Completed and cancelled routes stay live for the rest of their planning
//! day so consoles can still show them. Once the day is over a periodic scan
//! archives them through the manager, which holds the route lock while the
//! snapshot moves to `archived_routes`.
//!
//! Note: redb operations are synchronous for stability.

use std::time::Duration;

use chrono::NaiveDate;
use tokio_util::sync::CancellationToken;

use super::manager::{DispatchManager, ManagerResult};

/// Worker for the periodic archive scan
#[derive(Debug, Clone)]
pub struct ArchiveWorker {
    manager: DispatchManager,
    interval: Duration,
}

impl ArchiveWorker {
    pub fn new(manager: DispatchManager, interval: Duration) -> Self {
        Self { manager, interval }
    }

    /// Run until shutdown
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(interval_secs = self.interval.as_secs(), "ArchiveWorker started");
        let mut scan_interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::info!("ArchiveWorker shutting down");
                    break;
                }
                _ = scan_interval.tick() => {
                    let today = chrono::Local::now().date_naive();
                    let worker = self.clone();
                    match tokio::task::spawn_blocking(move || worker.archive_before(today)).await {
                        Ok(Ok(0)) => {}
                        Ok(Ok(count)) => tracing::info!(count, "Archived finished routes"),
                        Ok(Err(e)) => tracing::error!(error = %e, "Archive scan failed"),
                        Err(e) => tracing::error!(error = %e, "Archive scan task panicked"),
                    }
                }
            }
        }
    }

    /// Archive every finished route planned before `today`
    ///
    /// A failure on one route is logged and the scan moves on; it is retried
    /// on the next tick.
    pub fn archive_before(&self, today: NaiveDate) -> ManagerResult<usize> {
        let due: Vec<String> = self
            .manager
            .storage()
            .get_all_snapshots()?
            .into_iter()
            .filter(|s| s.status.is_terminal() && s.planning_date < today)
            .map(|s| s.route_id)
            .collect();

        let mut archived = 0;
        for route_id in due {
            match self.manager.archive_route(&route_id) {
                Ok(_) => archived += 1,
                Err(e) => {
                    tracing::error!(route_id = %route_id, error = %e, "Failed to archive route")
                }
            }
        }
        Ok(archived)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::storage::DispatchStorage;
    use shared::models::{GeoPoint, PriorityTier};
    use shared::route::{CommandPayload, DispatchCommand, EventOrigin, PlannedStop};

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, day).unwrap()
    }

    fn create_route(manager: &DispatchManager, route_id: &str, day: u32) {
        let resp = manager.execute_command(DispatchCommand::new(
            EventOrigin::System,
            CommandPayload::CreateRoute {
                route_id: route_id.to_string(),
                vehicle_id: "v-1".to_string(),
                planning_date: date(day),
                capacity: 4,
                stops: vec![PlannedStop {
                    order_id: format!("{route_id}-o"),
                    location: GeoPoint::new(40.0, -3.0),
                    demand: 1,
                    priority: PriorityTier::Normal,
                    time_window: None,
                    planned_arrival: None,
                }],
                estimated_distance_m: 0.0,
                estimated_duration_s: 0.0,
            },
        ));
        assert!(resp.success);
    }

    fn cancel(manager: &DispatchManager, route_id: &str) {
        let resp = manager.execute_command(DispatchCommand::new(
            EventOrigin::Dispatcher,
            CommandPayload::CancelRoute {
                route_id: route_id.to_string(),
                reason: None,
            },
        ));
        assert!(resp.success);
    }

    #[test]
    fn test_archives_only_finished_routes_of_past_days() {
        let manager = DispatchManager::with_storage(DispatchStorage::open_in_memory().unwrap());
        create_route(&manager, "old-done", 1);
        create_route(&manager, "old-open", 1);
        create_route(&manager, "today-done", 2);
        cancel(&manager, "old-done");
        cancel(&manager, "today-done");

        let worker = ArchiveWorker::new(manager.clone(), Duration::from_secs(60));
        assert_eq!(worker.archive_before(date(2)).unwrap(), 1);

        let storage = manager.storage();
        assert!(storage.get_snapshot("old-done").unwrap().is_none());
        assert!(storage.get_archived("old-done").unwrap().is_some());
        assert!(storage.get_snapshot("old-open").unwrap().is_some());
        assert!(storage.get_snapshot("today-done").unwrap().is_some());

        // Nothing left to do
        assert_eq!(worker.archive_before(date(2)).unwrap(), 0);
    }
}

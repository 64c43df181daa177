//! Local route view
//!
//! Holds the last state the hub confirmed for each followed route and
//! projects queued actions on top of it. Confirmed state only moves forward
//! through snapshots and in-order events; the optimistic overlay is rebuilt
//! from the durable queue on every read, so a rejected action disappears
//! from the view as soon as it leaves the queue.

use std::collections::HashMap;

use shared::error::AppError;
use shared::message::{DriverAction, RouteCursor};
use shared::route::{RouteSnapshot, RouteStatus, StopStatus, SyncEvent, apply_event};

use crate::queue::QueueItem;

/// Result of feeding one event to the view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Applied,
    /// Already applied (sequence at or below the cursor)
    Duplicate,
    /// Events were missed; the route needs a resync
    Gap { expected: u64, received: u64 },
    /// No snapshot yet for this route
    UnknownRoute,
}

#[derive(Debug, Default)]
pub struct LocalRouteView {
    routes: HashMap<String, RouteSnapshot>,
    epoch: Option<String>,
}

impl LocalRouteView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn epoch(&self) -> Option<&str> {
        self.epoch.as_deref()
    }

    /// Adopt the hub's epoch; a different one invalidates every cursor
    ///
    /// Returns true when local state was dropped.
    pub fn adopt_epoch(&mut self, epoch: &str) -> bool {
        if self.epoch.as_deref() == Some(epoch) {
            return false;
        }
        let stale = self.epoch.is_some();
        if stale {
            tracing::info!(old = ?self.epoch, new = %epoch, "Hub epoch changed, dropping local routes");
            self.routes.clear();
        }
        self.epoch = Some(epoch.to_string());
        stale
    }

    /// Take a full snapshot from the hub
    ///
    /// An older snapshot than what is held is ignored.
    pub fn apply_snapshot(&mut self, snapshot: RouteSnapshot) -> bool {
        if !snapshot.verify_checksum() {
            tracing::warn!(route_id = %snapshot.route_id, "Snapshot checksum mismatch");
        }
        if let Some(current) = self.routes.get(&snapshot.route_id)
            && current.last_sequence > snapshot.last_sequence
        {
            return false;
        }
        self.routes.insert(snapshot.route_id.clone(), snapshot);
        true
    }

    /// Apply one sequenced event
    pub fn apply_event(&mut self, event: &SyncEvent) -> ApplyOutcome {
        let Some(snapshot) = self.routes.get_mut(&event.route_id) else {
            return ApplyOutcome::UnknownRoute;
        };
        let expected = snapshot.last_sequence + 1;
        if event.sequence < expected {
            return ApplyOutcome::Duplicate;
        }
        if event.sequence > expected {
            return ApplyOutcome::Gap {
                expected,
                received: event.sequence,
            };
        }
        apply_event(snapshot, event);
        ApplyOutcome::Applied
    }

    pub fn remove(&mut self, route_id: &str) -> Option<RouteSnapshot> {
        self.routes.remove(route_id)
    }

    /// Confirmed state of a route
    pub fn confirmed(&self, route_id: &str) -> Option<&RouteSnapshot> {
        self.routes.get(route_id)
    }

    pub fn route_ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.routes.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn last_sequence(&self, route_id: &str) -> Option<u64> {
        self.routes.get(route_id).map(|r| r.last_sequence)
    }

    /// Cursors for a resync request
    pub fn cursors(&self) -> Vec<RouteCursor> {
        let mut cursors: Vec<_> = self
            .routes
            .values()
            .map(|r| RouteCursor {
                route_id: r.route_id.clone(),
                last_sequence: r.last_sequence,
            })
            .collect();
        cursors.sort_by(|a, b| a.route_id.cmp(&b.route_id));
        cursors
    }

    /// Confirmed state with queued actions of the route layered on top
    ///
    /// `pending` must be in creation order. Actions that no longer fit the
    /// confirmed state (already echoed, or overtaken) are skipped.
    pub fn optimistic(&self, route_id: &str, pending: &[QueueItem]) -> Option<RouteSnapshot> {
        let mut snapshot = self.routes.get(route_id)?.clone();
        for item in pending.iter().filter(|i| i.route_id == route_id) {
            overlay(&mut snapshot, &item.action);
        }
        Some(snapshot)
    }

    /// Would the hub accept this action given what the device knows?
    pub fn check_action(
        &self,
        route_id: &str,
        action: &DriverAction,
        pending: &[QueueItem],
    ) -> Result<(), AppError> {
        let Some(route) = self.optimistic(route_id, pending) else {
            return Err(AppError::route_not_found(route_id));
        };
        if route.status.is_terminal() {
            return Err(AppError::illegal_transition(format!(
                "route {route_id} is {}",
                route.status
            )));
        }
        if let DriverAction::StopStatus { order_id, status, .. } = action {
            let stop = route
                .stop(order_id)
                .ok_or_else(|| AppError::stop_not_found(route_id, order_id.as_str()))?;
            if !stop_transition_allowed(stop.status, *status) {
                return Err(AppError::illegal_transition(format!(
                    "stop {order_id}: {} -> {status}",
                    stop.status
                )));
            }
        }
        Ok(())
    }
}

/// Driver completion may skip the arrival tap
fn stop_transition_allowed(from: StopStatus, to: StopStatus) -> bool {
    from.can_transition_to(to)
        || (to == StopStatus::Completed && matches!(from, StopStatus::Pending | StopStatus::EnRoute))
}

fn overlay(snapshot: &mut RouteSnapshot, action: &DriverAction) {
    match action {
        DriverAction::StopStatus {
            order_id,
            status,
            occurred_at,
            evidence_ref,
            failure_reason,
        } => {
            if snapshot.status.is_terminal() {
                return;
            }
            let Some(stop) = snapshot.stop_mut(order_id) else {
                return;
            };
            if !stop_transition_allowed(stop.status, *status) {
                return;
            }
            match status {
                StopStatus::Arrived => stop.actual_arrival = Some(*occurred_at),
                StopStatus::Completed => {
                    stop.actual_arrival.get_or_insert(*occurred_at);
                    stop.finished_at = Some(*occurred_at);
                    stop.evidence_ref = evidence_ref.clone();
                }
                StopStatus::Failed => {
                    stop.finished_at = Some(*occurred_at);
                    stop.failure_reason = failure_reason.clone();
                }
                StopStatus::Pending | StopStatus::EnRoute => {}
            }
            stop.status = *status;
            if snapshot.status == RouteStatus::Assigned {
                snapshot.status = RouteStatus::InProgress;
                snapshot.started_at.get_or_insert(*occurred_at);
            }
        }
        DriverAction::Location {
            location,
            recorded_at,
        } => {
            if snapshot.last_location_at.is_none_or(|at| at <= *recorded_at) {
                snapshot.last_location = Some(*location);
                snapshot.last_location_at = Some(*recorded_at);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::SyncState;
    use shared::error::ErrorCode;
    use shared::models::GeoPoint;
    use shared::route::{EventOrigin, EventPayload, StopSnapshot};

    fn route(id: &str) -> RouteSnapshot {
        let mut snapshot = RouteSnapshot::new(id.to_string());
        snapshot.vehicle_id = "v-1".to_string();
        snapshot.status = RouteStatus::Assigned;
        snapshot.capacity = 10;
        for (i, order) in ["o-1", "o-2"].into_iter().enumerate() {
            let mut stop = StopSnapshot::from_planned(&shared::route::PlannedStop {
                order_id: order.to_string(),
                location: GeoPoint::new(40.0 + i as f64 / 100.0, -3.7),
                demand: 2,
                priority: Default::default(),
                time_window: None,
                planned_arrival: None,
            });
            stop.sequence_index = i as u32;
            snapshot.stops.push(stop);
        }
        snapshot.last_sequence = 2;
        snapshot.update_checksum();
        snapshot
    }

    fn stop_event(route_id: &str, sequence: u64, order_id: &str, to: StopStatus) -> SyncEvent {
        SyncEvent::new(
            route_id.to_string(),
            sequence,
            EventOrigin::Driver,
            Some("tablet-1".to_string()),
            format!("cmd-{sequence}"),
            EventPayload::StopStatusChanged {
                order_id: order_id.to_string(),
                from: StopStatus::Pending,
                to,
                occurred_at: 5_000,
                evidence_ref: None,
                failure_reason: None,
            },
        )
    }

    fn queued(route_id: &str, action: DriverAction) -> QueueItem {
        QueueItem {
            id: shared::util::new_id(),
            position: 1,
            route_id: route_id.to_string(),
            action,
            observed_sequence: None,
            created_at: 0,
            attempts: 0,
            state: SyncState::Queued,
            last_error: None,
        }
    }

    fn status(order_id: &str, status: StopStatus) -> DriverAction {
        DriverAction::StopStatus {
            order_id: order_id.to_string(),
            status,
            occurred_at: 7_000,
            evidence_ref: None,
            failure_reason: None,
        }
    }

    #[test]
    fn test_events_apply_in_order_only() {
        let mut view = LocalRouteView::new();
        assert!(view.apply_snapshot(route("r-1")));

        assert_eq!(
            view.apply_event(&stop_event("r-1", 2, "o-1", StopStatus::Arrived)),
            ApplyOutcome::Duplicate
        );
        assert_eq!(
            view.apply_event(&stop_event("r-1", 5, "o-1", StopStatus::Arrived)),
            ApplyOutcome::Gap { expected: 3, received: 5 }
        );
        assert_eq!(
            view.apply_event(&stop_event("r-1", 3, "o-1", StopStatus::Arrived)),
            ApplyOutcome::Applied
        );
        assert_eq!(view.last_sequence("r-1"), Some(3));
        assert_eq!(
            view.apply_event(&stop_event("r-9", 1, "o-1", StopStatus::Arrived)),
            ApplyOutcome::UnknownRoute
        );
    }

    #[test]
    fn test_older_snapshot_is_ignored() {
        let mut view = LocalRouteView::new();
        let mut newer = route("r-1");
        newer.last_sequence = 10;
        newer.update_checksum();
        view.apply_snapshot(newer);
        assert!(!view.apply_snapshot(route("r-1")));
        assert_eq!(view.last_sequence("r-1"), Some(10));
        assert_eq!(view.cursors()[0].last_sequence, 10);
    }

    #[test]
    fn test_epoch_change_drops_routes() {
        let mut view = LocalRouteView::new();
        assert!(!view.adopt_epoch("e-1"));
        view.apply_snapshot(route("r-1"));
        assert!(!view.adopt_epoch("e-1"));
        assert!(view.adopt_epoch("e-2"));
        assert!(view.route_ids().is_empty());
    }

    #[test]
    fn test_optimistic_overlay_and_auto_start() {
        let mut view = LocalRouteView::new();
        view.apply_snapshot(route("r-1"));
        let pending = vec![
            queued("r-1", status("o-1", StopStatus::Completed)),
            queued(
                "r-1",
                DriverAction::Location {
                    location: GeoPoint::new(40.5, -3.6),
                    recorded_at: 8_000,
                },
            ),
            queued("r-2", status("o-2", StopStatus::Failed)),
        ];

        let projected = view.optimistic("r-1", &pending).unwrap();
        let stop = projected.stop("o-1").unwrap();
        assert_eq!(stop.status, StopStatus::Completed);
        assert_eq!(stop.actual_arrival, Some(7_000));
        assert_eq!(projected.status, RouteStatus::InProgress);
        assert_eq!(projected.last_location_at, Some(8_000));
        // Other routes' items do not leak in
        assert_eq!(projected.stop("o-2").unwrap().status, StopStatus::Pending);
        // Confirmed state untouched
        assert_eq!(view.confirmed("r-1").unwrap().status, RouteStatus::Assigned);
    }

    #[test]
    fn test_check_action_uses_projected_state() {
        let mut view = LocalRouteView::new();
        view.apply_snapshot(route("r-1"));
        let pending = vec![queued("r-1", status("o-1", StopStatus::Completed))];

        let err = view
            .check_action("r-1", &status("o-1", StopStatus::Arrived), &pending)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::IllegalTransition);

        view.check_action("r-1", &status("o-2", StopStatus::Arrived), &pending).unwrap();

        let err = view
            .check_action("r-1", &status("o-9", StopStatus::Arrived), &pending)
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::StopNotFound);

        let err = view
            .check_action("r-404", &status("o-1", StopStatus::Arrived), &[])
            .unwrap_err();
        assert_eq!(err.code, ErrorCode::RouteNotFound);
    }
}

//! UpdateStopStatus command handler
//!
//! Drivers report progress on a stop. Besides the plain transition this
//! handler covers three driver conveniences:
//! - a stop update on an `assigned` route starts the route first
//! - `completed` straight from `pending`/`en_route` records the arrival first
//! - a terminal report for a stop the dispatcher moved away while the device
//!   was offline wins, as long as the receiving route has not touched it

use crate::dispatch::actions::ensure_capacity;
use crate::dispatch::traits::{CommandContext, CommandHandler, CommandMetadata, DispatchError};
use shared::route::{
    EventOrigin, EventPayload, ReassignOrigin, RouteSnapshot, RouteStatus, StopSnapshot,
    StopStatus, SyncEvent,
};

/// UpdateStopStatus action
#[derive(Debug, Clone)]
pub struct UpdateStopStatusAction {
    pub route_id: String,
    pub order_id: String,
    pub status: StopStatus,
    pub occurred_at: Option<i64>,
    pub evidence_ref: Option<String>,
    pub failure_reason: Option<String>,
}

impl UpdateStopStatusAction {
    fn is_driver_terminal(&self, metadata: &CommandMetadata) -> bool {
        metadata.origin == EventOrigin::Driver && self.status.is_terminal()
    }

    /// Pull a stop back from the route it was reassigned to
    ///
    /// Returns the reclaimed stop as it will sit on this route.
    fn reclaim(
        &self,
        ctx: &mut CommandContext<'_>,
        metadata: &CommandMetadata,
        snapshot: &RouteSnapshot,
        events: &mut Vec<SyncEvent>,
    ) -> Result<StopSnapshot, DispatchError> {
        let not_found = || DispatchError::StopNotFound {
            route_id: self.route_id.clone(),
            order_id: self.order_id.clone(),
        };

        let holder_id = match ctx.route_for_order(&self.order_id)? {
            Some(id) if id != self.route_id => id,
            _ => return Err(not_found()),
        };
        if !self.is_driver_terminal(metadata) {
            return Err(not_found());
        }

        let holder = ctx.load_snapshot(&holder_id)?;
        let moved = holder.stop(&self.order_id).ok_or_else(not_found)?;
        if holder.status.is_terminal() || moved.status != StopStatus::Pending {
            return Err(DispatchError::SyncConflict(format!(
                "order {} was reassigned to route {} and is already {} there",
                self.order_id, holder_id, moved.status
            )));
        }
        ensure_capacity(snapshot, moved.demand)?;

        let reason = Some(format!("driver reported {} on {}", self.status, self.route_id));
        let outgoing = ctx.event(
            &holder_id,
            metadata.origin,
            metadata,
            EventPayload::RouteReassigned {
                order_id: self.order_id.clone(),
                from_route_id: holder_id.clone(),
                to_route_id: self.route_id.clone(),
                stop: None,
                position: None,
                reason: reason.clone(),
            },
        )?;

        let mut stop = moved.clone();
        stop.status = StopStatus::Pending;
        stop.reassigned_from = Some(ReassignOrigin {
            route_id: holder_id.clone(),
            sequence: outgoing.sequence,
        });
        let position = snapshot.locked_prefix_len() as u32;

        let incoming = ctx.event(
            &self.route_id,
            metadata.origin,
            metadata,
            EventPayload::RouteReassigned {
                order_id: self.order_id.clone(),
                from_route_id: holder_id.clone(),
                to_route_id: self.route_id.clone(),
                stop: Some(stop.clone()),
                position: Some(position),
                reason,
            },
        )?;

        tracing::warn!(
            order_id = %self.order_id,
            from_route = %holder_id,
            to_route = %self.route_id,
            "Driver terminal update reclaimed a reassigned stop"
        );

        events.push(outgoing);
        events.push(incoming);
        Ok(stop)
    }

    fn status_event(
        &self,
        ctx: &mut CommandContext<'_>,
        metadata: &CommandMetadata,
        from: StopStatus,
        to: StopStatus,
        occurred_at: i64,
    ) -> Result<SyncEvent, DispatchError> {
        let final_step = to == self.status;
        ctx.event(
            &self.route_id,
            metadata.origin,
            metadata,
            EventPayload::StopStatusChanged {
                order_id: self.order_id.clone(),
                from,
                to,
                occurred_at,
                evidence_ref: if final_step { self.evidence_ref.clone() } else { None },
                failure_reason: if final_step { self.failure_reason.clone() } else { None },
            },
        )
    }
}

impl CommandHandler for UpdateStopStatusAction {
    fn execute(
        &self,
        ctx: &mut CommandContext<'_>,
        metadata: &CommandMetadata,
    ) -> Result<Vec<SyncEvent>, DispatchError> {
        // 1. Route must be dispatched and not finished
        let snapshot = ctx.load_snapshot(&self.route_id)?;
        if matches!(snapshot.status, RouteStatus::Planned) || snapshot.status.is_terminal() {
            return Err(DispatchError::IllegalTransition(format!(
                "stops of route {} cannot change while it is {}",
                self.route_id, snapshot.status
            )));
        }

        let mut events = Vec::new();

        // 2. Locate the stop, reclaiming it if it moved away meanwhile
        let stop = match snapshot.stop(&self.order_id) {
            Some(stop) => stop.clone(),
            None => self.reclaim(ctx, metadata, &snapshot, &mut events)?,
        };

        if stop.status == self.status {
            return Err(DispatchError::illegal("stop", stop.status, self.status));
        }

        // 3. Work out the transition path
        let implicit_arrival = self.status == StopStatus::Completed
            && matches!(stop.status, StopStatus::Pending | StopStatus::EnRoute)
            && metadata.origin == EventOrigin::Driver;
        if !implicit_arrival && !stop.status.can_transition_to(self.status) {
            return Err(DispatchError::illegal("stop", stop.status, self.status));
        }

        // 4. Auto-start
        if snapshot.status == RouteStatus::Assigned {
            events.push(ctx.event(
                &self.route_id,
                EventOrigin::System,
                metadata,
                EventPayload::RouteStatusChanged {
                    from: RouteStatus::Assigned,
                    to: RouteStatus::InProgress,
                    vehicle_id: None,
                    capacity: None,
                    reason: Some("first stop update".to_string()),
                },
            )?);
        }

        // 5. Stop events
        let occurred_at = self.occurred_at.unwrap_or(metadata.timestamp);
        let mut from = stop.status;
        if implicit_arrival {
            events.push(self.status_event(ctx, metadata, from, StopStatus::Arrived, occurred_at)?);
            from = StopStatus::Arrived;
        }
        events.push(self.status_event(ctx, metadata, from, self.status, occurred_at)?);

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::actions::test_support::{metadata, route, seed};
    use crate::dispatch::storage::DispatchStorage;

    fn action(route_id: &str, order_id: &str, status: StopStatus) -> UpdateStopStatusAction {
        UpdateStopStatusAction {
            route_id: route_id.to_string(),
            order_id: order_id.to_string(),
            status,
            occurred_at: Some(500),
            evidence_ref: Some("sig-1".to_string()),
            failure_reason: None,
        }
    }

    fn transitions(events: &[SyncEvent]) -> Vec<(StopStatus, StopStatus)> {
        events
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::StopStatusChanged { from, to, .. } => Some((*from, *to)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_arrival_on_in_progress_route() {
        let storage = DispatchStorage::open_in_memory().unwrap();
        seed(&storage, &[route("r-1", RouteStatus::InProgress, &[("a", StopStatus::EnRoute)])]);
        let txn = storage.begin_write().unwrap();
        let mut ctx = CommandContext::new(&txn, &storage);

        let events = action("r-1", "a", StopStatus::Arrived)
            .execute(&mut ctx, &metadata(EventOrigin::Driver))
            .unwrap();
        assert_eq!(transitions(&events), [(StopStatus::EnRoute, StopStatus::Arrived)]);
        assert_eq!(events[0].sequence, 2);
    }

    #[test]
    fn test_first_update_starts_assigned_route() {
        let storage = DispatchStorage::open_in_memory().unwrap();
        seed(&storage, &[route("r-1", RouteStatus::Assigned, &[("a", StopStatus::Pending)])]);
        let txn = storage.begin_write().unwrap();
        let mut ctx = CommandContext::new(&txn, &storage);

        let events = action("r-1", "a", StopStatus::EnRoute)
            .execute(&mut ctx, &metadata(EventOrigin::Driver))
            .unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].origin, EventOrigin::System);
        assert!(matches!(
            events[0].payload,
            EventPayload::RouteStatusChanged { to: RouteStatus::InProgress, .. }
        ));
        assert_eq!(events[1].sequence, 3);
    }

    #[test]
    fn test_driver_completion_records_implicit_arrival() {
        let storage = DispatchStorage::open_in_memory().unwrap();
        seed(&storage, &[route("r-1", RouteStatus::InProgress, &[("a", StopStatus::Pending)])]);
        let txn = storage.begin_write().unwrap();
        let mut ctx = CommandContext::new(&txn, &storage);

        let events = action("r-1", "a", StopStatus::Completed)
            .execute(&mut ctx, &metadata(EventOrigin::Driver))
            .unwrap();
        assert_eq!(
            transitions(&events),
            [
                (StopStatus::Pending, StopStatus::Arrived),
                (StopStatus::Arrived, StopStatus::Completed)
            ]
        );
        match &events[1].payload {
            EventPayload::StopStatusChanged { evidence_ref, .. } => {
                assert_eq!(evidence_ref.as_deref(), Some("sig-1"))
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_dispatcher_cannot_complete_unarrived_stop() {
        let storage = DispatchStorage::open_in_memory().unwrap();
        seed(&storage, &[route("r-1", RouteStatus::InProgress, &[("a", StopStatus::Pending)])]);
        let txn = storage.begin_write().unwrap();
        let mut ctx = CommandContext::new(&txn, &storage);

        let result = action("r-1", "a", StopStatus::Completed)
            .execute(&mut ctx, &metadata(EventOrigin::Dispatcher));
        assert!(matches!(result, Err(DispatchError::IllegalTransition(_))));
    }

    #[test]
    fn test_terminal_stop_and_planned_route_rejected() {
        let storage = DispatchStorage::open_in_memory().unwrap();
        seed(
            &storage,
            &[
                route("r-1", RouteStatus::InProgress, &[("a", StopStatus::Completed)]),
                route("r-2", RouteStatus::Planned, &[("b", StopStatus::Pending)]),
            ],
        );
        let txn = storage.begin_write().unwrap();
        let mut ctx = CommandContext::new(&txn, &storage);
        let meta = metadata(EventOrigin::Driver);

        assert!(matches!(
            action("r-1", "a", StopStatus::Failed).execute(&mut ctx, &meta),
            Err(DispatchError::IllegalTransition(_))
        ));
        assert!(matches!(
            action("r-2", "b", StopStatus::Arrived).execute(&mut ctx, &meta),
            Err(DispatchError::IllegalTransition(_))
        ));
        assert!(matches!(
            action("r-1", "zzz", StopStatus::Arrived).execute(&mut ctx, &meta),
            Err(DispatchError::StopNotFound { .. })
        ));
    }

    #[test]
    fn test_offline_completion_reclaims_reassigned_stop() {
        let storage = DispatchStorage::open_in_memory().unwrap();
        let mut holder = route("r-2", RouteStatus::InProgress, &[("x", StopStatus::Pending)]);
        let mut moved = holder.stop("x").unwrap().clone();
        moved.order_id = "a".to_string();
        holder.insert_stop(moved, 1);
        seed(
            &storage,
            &[
                route("r-1", RouteStatus::InProgress, &[("b", StopStatus::Completed)]),
                holder,
            ],
        );
        let txn = storage.begin_write().unwrap();
        let mut ctx = CommandContext::new(&txn, &storage);

        let events = action("r-1", "a", StopStatus::Completed)
            .execute(&mut ctx, &metadata(EventOrigin::Driver))
            .unwrap();

        let routes: Vec<&str> = events.iter().map(|e| e.route_id.as_str()).collect();
        assert_eq!(routes, ["r-2", "r-1", "r-1", "r-1"]);
        match &events[1].payload {
            EventPayload::RouteReassigned { stop: Some(stop), position, .. } => {
                assert_eq!(*position, Some(1));
                assert_eq!(stop.reassigned_from.as_ref().unwrap().route_id, "r-2");
            }
            other => panic!("unexpected payload {other:?}"),
        }
        assert_eq!(
            transitions(&events),
            [
                (StopStatus::Pending, StopStatus::Arrived),
                (StopStatus::Arrived, StopStatus::Completed)
            ]
        );
    }

    #[test]
    fn test_reclaim_conflicts_when_new_route_started_stop() {
        let storage = DispatchStorage::open_in_memory().unwrap();
        let holder = route("r-2", RouteStatus::InProgress, &[("a", StopStatus::Arrived)]);
        seed(
            &storage,
            &[
                route("r-1", RouteStatus::InProgress, &[("b", StopStatus::Pending)]),
                holder,
            ],
        );
        let txn = storage.begin_write().unwrap();
        let mut ctx = CommandContext::new(&txn, &storage);

        let result = action("r-1", "a", StopStatus::Completed)
            .execute(&mut ctx, &metadata(EventOrigin::Driver));
        assert!(matches!(result, Err(DispatchError::SyncConflict(_))));
    }
}

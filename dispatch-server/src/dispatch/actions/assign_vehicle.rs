//! AssignVehicle command handler
//!
//! Binds a planned route to a vehicle (`planned -> assigned`).

use crate::dispatch::traits::{CommandContext, CommandHandler, CommandMetadata, DispatchError};
use shared::route::{EventPayload, RouteStatus, SyncEvent};

/// AssignVehicle action
#[derive(Debug, Clone)]
pub struct AssignVehicleAction {
    pub route_id: String,
    pub vehicle_id: String,
    pub capacity: u32,
}

impl CommandHandler for AssignVehicleAction {
    fn execute(
        &self,
        ctx: &mut CommandContext<'_>,
        metadata: &CommandMetadata,
    ) -> Result<Vec<SyncEvent>, DispatchError> {
        let snapshot = ctx.load_snapshot(&self.route_id)?;

        if !snapshot.status.can_transition_to(RouteStatus::Assigned) {
            return Err(DispatchError::illegal(
                "route",
                snapshot.status,
                RouteStatus::Assigned,
            ));
        }
        if self.vehicle_id.is_empty() {
            return Err(DispatchError::InvalidOperation(
                "vehicle id is required".to_string(),
            ));
        }

        let demand = snapshot.total_demand();
        if demand > self.capacity {
            return Err(DispatchError::CapacityExceeded {
                route_id: self.route_id.clone(),
                demand,
                capacity: self.capacity,
            });
        }

        let event = ctx.event(
            &self.route_id,
            metadata.origin,
            metadata,
            EventPayload::RouteStatusChanged {
                from: snapshot.status,
                to: RouteStatus::Assigned,
                vehicle_id: Some(self.vehicle_id.clone()),
                capacity: Some(self.capacity),
                reason: None,
            },
        )?;

        Ok(vec![event])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::actions::test_support::{metadata, route, seed};
    use crate::dispatch::storage::DispatchStorage;
    use shared::route::{EventOrigin, StopStatus};

    fn action(capacity: u32) -> AssignVehicleAction {
        AssignVehicleAction {
            route_id: "r-1".to_string(),
            vehicle_id: "truck-9".to_string(),
            capacity,
        }
    }

    #[test]
    fn test_assign_planned_route() {
        let storage = DispatchStorage::open_in_memory().unwrap();
        seed(
            &storage,
            &[route("r-1", RouteStatus::Planned, &[("a", StopStatus::Pending)])],
        );
        let txn = storage.begin_write().unwrap();
        let mut ctx = CommandContext::new(&txn, &storage);

        let events = action(8)
            .execute(&mut ctx, &metadata(EventOrigin::Dispatcher))
            .unwrap();
        assert_eq!(events[0].sequence, 2);
        assert!(matches!(
            &events[0].payload,
            EventPayload::RouteStatusChanged { to: RouteStatus::Assigned, vehicle_id: Some(v), .. } if v == "truck-9"
        ));
    }

    #[test]
    fn test_assign_rejects_started_route_and_small_vehicle() {
        let storage = DispatchStorage::open_in_memory().unwrap();
        seed(
            &storage,
            &[
                route("r-1", RouteStatus::InProgress, &[("a", StopStatus::Pending)]),
                route(
                    "r-2",
                    RouteStatus::Planned,
                    &[("b", StopStatus::Pending), ("c", StopStatus::Pending)],
                ),
            ],
        );
        let txn = storage.begin_write().unwrap();
        let mut ctx = CommandContext::new(&txn, &storage);
        let meta = metadata(EventOrigin::Dispatcher);

        assert!(matches!(
            action(8).execute(&mut ctx, &meta),
            Err(DispatchError::IllegalTransition(_))
        ));

        let small = AssignVehicleAction {
            route_id: "r-2".to_string(),
            vehicle_id: "bike".to_string(),
            capacity: 1,
        };
        assert!(matches!(
            small.execute(&mut ctx, &meta),
            Err(DispatchError::CapacityExceeded { .. })
        ));
    }
}

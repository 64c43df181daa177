//! CreateRoute command handler
//!
//! Publishes a freshly built route in `planned` state.

use std::collections::HashSet;

use chrono::NaiveDate;

use crate::dispatch::traits::{CommandContext, CommandHandler, CommandMetadata, DispatchError};
use shared::route::{EventPayload, PlannedStop, StopSnapshot, SyncEvent};

/// CreateRoute action
#[derive(Debug, Clone)]
pub struct CreateRouteAction {
    pub route_id: String,
    pub vehicle_id: String,
    pub planning_date: NaiveDate,
    pub capacity: u32,
    pub stops: Vec<PlannedStop>,
    pub estimated_distance_m: f64,
    pub estimated_duration_s: f64,
}

impl CommandHandler for CreateRouteAction {
    fn execute(
        &self,
        ctx: &mut CommandContext<'_>,
        metadata: &CommandMetadata,
    ) -> Result<Vec<SyncEvent>, DispatchError> {
        // 1. Route ids are never reused, archived ones included
        if ctx.route_exists(&self.route_id)? {
            return Err(DispatchError::InvalidOperation(format!(
                "route {} already exists",
                self.route_id
            )));
        }

        // 2. Validate stops
        if self.stops.is_empty() {
            return Err(DispatchError::InvalidOperation(
                "a route needs at least one stop".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for stop in &self.stops {
            if !seen.insert(stop.order_id.as_str()) {
                return Err(DispatchError::InvalidOperation(format!(
                    "order {} appears twice in route {}",
                    stop.order_id, self.route_id
                )));
            }
            if stop.demand == 0 {
                return Err(DispatchError::InvalidOperation(format!(
                    "order {} has zero demand",
                    stop.order_id
                )));
            }
            if let Some(route_id) = ctx.route_for_order(&stop.order_id)? {
                return Err(DispatchError::OrderAlreadyRouted {
                    order_id: stop.order_id.clone(),
                    route_id,
                });
            }
        }

        // 3. Capacity
        let demand: u32 = self.stops.iter().map(|s| s.demand).sum();
        if demand > self.capacity {
            return Err(DispatchError::CapacityExceeded {
                route_id: self.route_id.clone(),
                demand,
                capacity: self.capacity,
            });
        }

        // 4. Emit
        let stops = self
            .stops
            .iter()
            .enumerate()
            .map(|(i, planned)| {
                let mut stop = StopSnapshot::from_planned(planned);
                stop.sequence_index = i as u32;
                stop
            })
            .collect();

        let event = ctx.event(
            &self.route_id,
            metadata.origin,
            metadata,
            EventPayload::RouteCreated {
                vehicle_id: self.vehicle_id.clone(),
                planning_date: self.planning_date,
                capacity: self.capacity,
                stops,
                estimated_distance_m: self.estimated_distance_m,
                estimated_duration_s: self.estimated_duration_s,
            },
        )?;

        Ok(vec![event])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::actions::test_support::{metadata, planned, route, seed};
    use crate::dispatch::storage::DispatchStorage;
    use shared::route::{EventOrigin, RouteStatus, StopStatus};

    fn action(route_id: &str, ids: &[&str], capacity: u32) -> CreateRouteAction {
        CreateRouteAction {
            route_id: route_id.to_string(),
            vehicle_id: "v-1".to_string(),
            planning_date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            capacity,
            stops: ids.iter().map(|id| planned(id, 2)).collect(),
            estimated_distance_m: 1200.0,
            estimated_duration_s: 300.0,
        }
    }

    #[test]
    fn test_create_route_emits_first_sequence() {
        let storage = DispatchStorage::open_in_memory().unwrap();
        let txn = storage.begin_write().unwrap();
        let mut ctx = CommandContext::new(&txn, &storage);

        let events = action("r-1", &["a", "b"], 10)
            .execute(&mut ctx, &metadata(EventOrigin::System))
            .unwrap();

        assert_eq!(events.len(), 1);
        assert_eq!(events[0].sequence, 1);
        assert_eq!(events[0].route_id, "r-1");
        match &events[0].payload {
            EventPayload::RouteCreated { stops, .. } => {
                assert_eq!(stops.len(), 2);
                assert_eq!(stops[1].sequence_index, 1);
                assert_eq!(stops[1].status, StopStatus::Pending);
            }
            other => panic!("unexpected payload {other:?}"),
        }
    }

    #[test]
    fn test_create_route_rejects_overload() {
        let storage = DispatchStorage::open_in_memory().unwrap();
        let txn = storage.begin_write().unwrap();
        let mut ctx = CommandContext::new(&txn, &storage);

        let result = action("r-1", &["a", "b", "c"], 5).execute(&mut ctx, &metadata(EventOrigin::System));
        assert!(matches!(result, Err(DispatchError::CapacityExceeded { demand: 6, .. })));
    }

    #[test]
    fn test_create_route_rejects_routed_order() {
        let storage = DispatchStorage::open_in_memory().unwrap();
        seed(&storage, &[route("r-0", RouteStatus::Planned, &[("a", StopStatus::Pending)])]);
        let txn = storage.begin_write().unwrap();
        let mut ctx = CommandContext::new(&txn, &storage);

        let result = action("r-1", &["a"], 10).execute(&mut ctx, &metadata(EventOrigin::System));
        assert!(matches!(
            result,
            Err(DispatchError::OrderAlreadyRouted { ref route_id, .. }) if route_id == "r-0"
        ));
    }

    #[test]
    fn test_create_route_rejects_existing_id_and_duplicates() {
        let storage = DispatchStorage::open_in_memory().unwrap();
        seed(&storage, &[route("r-1", RouteStatus::Planned, &[("x", StopStatus::Pending)])]);
        let txn = storage.begin_write().unwrap();
        let mut ctx = CommandContext::new(&txn, &storage);

        let meta = metadata(EventOrigin::System);
        assert!(matches!(
            action("r-1", &["a"], 10).execute(&mut ctx, &meta),
            Err(DispatchError::InvalidOperation(_))
        ));
        assert!(matches!(
            action("r-2", &["a", "a"], 10).execute(&mut ctx, &meta),
            Err(DispatchError::InvalidOperation(_))
        ));
        assert!(matches!(
            action("r-2", &[], 10).execute(&mut ctx, &meta),
            Err(DispatchError::InvalidOperation(_))
        ));
    }
}

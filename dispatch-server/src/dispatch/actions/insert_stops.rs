//! InsertStops command handler
//!
//! Adds new orders to a live route at the positions the re-optimizer chose.
//! Worked stops (the locked prefix) never move. A plan computed against an
//! older sequence of the route is refused.

use crate::dispatch::actions::{ensure_active, ensure_capacity, ensure_fresh};
use crate::dispatch::traits::{CommandContext, CommandHandler, CommandMetadata, DispatchError};
use shared::route::{EventPayload, PlannedArrival, StopInsertion, StopSnapshot, SyncEvent};

/// InsertStops action
#[derive(Debug, Clone)]
pub struct InsertStopsAction {
    pub route_id: String,
    pub insertions: Vec<StopInsertion>,
    /// Refreshed ETAs for the whole route after all insertions
    pub planned_arrivals: Vec<PlannedArrival>,
}

impl CommandHandler for InsertStopsAction {
    fn execute(
        &self,
        ctx: &mut CommandContext<'_>,
        metadata: &CommandMetadata,
    ) -> Result<Vec<SyncEvent>, DispatchError> {
        let snapshot = ctx.load_snapshot(&self.route_id)?;
        ensure_active(&snapshot, "insert stops")?;
        ensure_fresh(&snapshot, metadata)?;

        if self.insertions.is_empty() {
            return Err(DispatchError::InvalidOperation(
                "no stops to insert".to_string(),
            ));
        }

        // Insertions apply one after another; check each against the route
        // as it will look at that point
        let mut working = snapshot.clone();
        for insertion in &self.insertions {
            let order_id = &insertion.stop.order_id;
            if insertion.stop.demand == 0 {
                return Err(DispatchError::InvalidOperation(format!(
                    "order {order_id} has zero demand"
                )));
            }
            if working.stop(order_id).is_some() {
                return Err(DispatchError::OrderAlreadyRouted {
                    order_id: order_id.clone(),
                    route_id: self.route_id.clone(),
                });
            }
            if let Some(route_id) = ctx.route_for_order(order_id)? {
                return Err(DispatchError::OrderAlreadyRouted {
                    order_id: order_id.clone(),
                    route_id,
                });
            }

            let position = insertion.position as usize;
            if position < working.locked_prefix_len() {
                return Err(DispatchError::SyncConflict(format!(
                    "position {position} on route {} is before stops the driver already worked",
                    self.route_id
                )));
            }
            if position > working.stops.len() {
                return Err(DispatchError::InvalidOperation(format!(
                    "position {position} is past the end of route {}",
                    self.route_id
                )));
            }
            working.insert_stop(StopSnapshot::from_planned(&insertion.stop), position);
        }

        let added: u32 = self.insertions.iter().map(|i| i.stop.demand).sum();
        ensure_capacity(&snapshot, added)?;

        let last = self.insertions.len() - 1;
        let mut events = Vec::with_capacity(self.insertions.len());
        for (i, insertion) in self.insertions.iter().enumerate() {
            let planned_arrivals = if i == last {
                self.planned_arrivals.clone()
            } else {
                Vec::new()
            };
            events.push(ctx.event(
                &self.route_id,
                metadata.origin,
                metadata,
                EventPayload::OrderAdded {
                    stop: StopSnapshot::from_planned(&insertion.stop),
                    position: insertion.position,
                    planned_arrivals,
                },
            )?);
        }

        Ok(events)
    }
}

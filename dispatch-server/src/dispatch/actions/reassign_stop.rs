//! ReassignStop command handler
//!
//! Moves a pending stop to another route. Emits one event on each route:
//! the source loses the stop, the target receives it with a back-reference.
//!
//! A stop the driver has already touched belongs to the driver. Reassigning
//! it is a conflict, as is reassigning a stop whose status changed after the
//! sequence the dispatcher was looking at.

use crate::dispatch::actions::{ensure_active, ensure_capacity};
use crate::dispatch::traits::{CommandContext, CommandHandler, CommandMetadata, DispatchError};
use shared::route::{EventPayload, ReassignOrigin, StopStatus, SyncEvent};

/// ReassignStop action
#[derive(Debug, Clone)]
pub struct ReassignStopAction {
    pub from_route_id: String,
    pub to_route_id: String,
    pub order_id: String,
    pub position: Option<u32>,
}

impl CommandHandler for ReassignStopAction {
    fn execute(
        &self,
        ctx: &mut CommandContext<'_>,
        metadata: &CommandMetadata,
    ) -> Result<Vec<SyncEvent>, DispatchError> {
        if self.from_route_id == self.to_route_id {
            return Err(DispatchError::InvalidOperation(
                "source and target route are the same".to_string(),
            ));
        }

        // 1. Both routes live
        let from = ctx.load_snapshot(&self.from_route_id)?;
        let to = ctx.load_snapshot(&self.to_route_id)?;
        ensure_active(&from, "reassign from")?;
        ensure_active(&to, "reassign to")?;

        // 2. The stop must still be untouched
        let stop = from
            .stop(&self.order_id)
            .ok_or_else(|| DispatchError::StopNotFound {
                route_id: self.from_route_id.clone(),
                order_id: self.order_id.clone(),
            })?;
        if stop.status != StopStatus::Pending {
            return Err(DispatchError::SyncConflict(format!(
                "stop {} is already {} on route {}",
                self.order_id, stop.status, self.from_route_id
            )));
        }
        if let Some(observed) = metadata.observed_sequence
            && stop.status_sequence > observed
        {
            return Err(DispatchError::SyncConflict(format!(
                "stop {} changed at sequence {} after observed sequence {}",
                self.order_id, stop.status_sequence, observed
            )));
        }

        // 3. Target constraints
        ensure_capacity(&to, stop.demand)?;
        let locked = to.locked_prefix_len();
        let position = match self.position {
            Some(p) if (p as usize) < locked => {
                return Err(DispatchError::SyncConflict(format!(
                    "position {p} on route {} is before stops the driver already worked",
                    self.to_route_id
                )));
            }
            Some(p) if p as usize > to.stops.len() => {
                return Err(DispatchError::InvalidOperation(format!(
                    "position {p} is past the end of route {}",
                    self.to_route_id
                )));
            }
            Some(p) => p,
            None => to.stops.len() as u32,
        };

        // 4. Emit on both routes
        let outgoing = ctx.event(
            &self.from_route_id,
            metadata.origin,
            metadata,
            EventPayload::RouteReassigned {
                order_id: self.order_id.clone(),
                from_route_id: self.from_route_id.clone(),
                to_route_id: self.to_route_id.clone(),
                stop: None,
                position: None,
                reason: None,
            },
        )?;

        let mut moved = stop.clone();
        moved.reassigned_from = Some(ReassignOrigin {
            route_id: self.from_route_id.clone(),
            sequence: outgoing.sequence,
        });
        moved.planned_arrival = None;

        let incoming = ctx.event(
            &self.to_route_id,
            metadata.origin,
            metadata,
            EventPayload::RouteReassigned {
                order_id: self.order_id.clone(),
                from_route_id: self.from_route_id.clone(),
                to_route_id: self.to_route_id.clone(),
                stop: Some(moved),
                position: Some(position),
                reason: None,
            },
        )?;

        Ok(vec![outgoing, incoming])
    }
}

//! ResequenceStops command handler

use std::collections::HashSet;

use crate::dispatch::actions::{ensure_active, ensure_fresh};
use crate::dispatch::traits::{CommandContext, CommandHandler, CommandMetadata, DispatchError};
use shared::route::{EventPayload, PlannedArrival, SyncEvent};

/// ResequenceStops action
///
/// Replaces the stop order and ETAs in one step. The new order must be a
/// permutation of the current stops and keep the locked prefix in place.
#[derive(Debug, Clone)]
pub struct ResequenceStopsAction {
    pub route_id: String,
    pub sequence: Vec<PlannedArrival>,
    pub estimated_distance_m: f64,
    pub estimated_duration_s: f64,
}

impl CommandHandler for ResequenceStopsAction {
    fn execute(
        &self,
        ctx: &mut CommandContext<'_>,
        metadata: &CommandMetadata,
    ) -> Result<Vec<SyncEvent>, DispatchError> {
        let snapshot = ctx.load_snapshot(&self.route_id)?;
        ensure_active(&snapshot, "resequence stops")?;
        ensure_fresh(&snapshot, metadata)?;

        let current: HashSet<&str> = snapshot.stops.iter().map(|s| s.order_id.as_str()).collect();
        let proposed: HashSet<&str> = self.sequence.iter().map(|p| p.order_id.as_str()).collect();
        if self.sequence.len() != snapshot.stops.len() || proposed != current {
            return Err(DispatchError::SyncConflict(format!(
                "sequence for route {} does not match its current stops",
                self.route_id
            )));
        }

        let locked = snapshot.locked_prefix_len();
        let moved = snapshot.stops[..locked]
            .iter()
            .zip(&self.sequence)
            .any(|(stop, entry)| stop.order_id != entry.order_id);
        if moved {
            return Err(DispatchError::SyncConflict(format!(
                "sequence moves stops of route {} the driver already worked",
                self.route_id
            )));
        }

        let event = ctx.event(
            &self.route_id,
            metadata.origin,
            metadata,
            EventPayload::StopsResequenced {
                sequence: self.sequence.clone(),
                estimated_distance_m: self.estimated_distance_m,
                estimated_duration_s: self.estimated_duration_s,
            },
        )?;

        Ok(vec![event])
    }
}

//! CancelRoute command handler
//!
//! Cancels a non-terminal route. Orders of stops not yet delivered or failed
//! go back to the unassigned pool (done by the manager's projection).

use crate::dispatch::traits::{CommandContext, CommandHandler, CommandMetadata, DispatchError};
use shared::route::{EventPayload, RouteStatus, SyncEvent};

/// CancelRoute action
#[derive(Debug, Clone)]
pub struct CancelRouteAction {
    pub route_id: String,
    pub reason: Option<String>,
}

impl CommandHandler for CancelRouteAction {
    fn execute(
        &self,
        ctx: &mut CommandContext<'_>,
        metadata: &CommandMetadata,
    ) -> Result<Vec<SyncEvent>, DispatchError> {
        let snapshot = ctx.load_snapshot(&self.route_id)?;

        if !snapshot.status.can_transition_to(RouteStatus::Cancelled) {
            return Err(DispatchError::illegal(
                "route",
                snapshot.status,
                RouteStatus::Cancelled,
            ));
        }

        let event = ctx.event(
            &self.route_id,
            metadata.origin,
            metadata,
            EventPayload::RouteStatusChanged {
                from: snapshot.status,
                to: RouteStatus::Cancelled,
                vehicle_id: None,
                capacity: None,
                reason: self.reason.clone(),
            },
        )?;

        Ok(vec![event])
    }
}

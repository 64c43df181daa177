//! StartRoute command handler

use crate::dispatch::traits::{CommandContext, CommandHandler, CommandMetadata, DispatchError};
use shared::route::{EventPayload, RouteStatus, SyncEvent};

/// StartRoute action (`assigned -> in_progress`)
#[derive(Debug, Clone)]
pub struct StartRouteAction {
    pub route_id: String,
}

impl CommandHandler for StartRouteAction {
    fn execute(
        &self,
        ctx: &mut CommandContext<'_>,
        metadata: &CommandMetadata,
    ) -> Result<Vec<SyncEvent>, DispatchError> {
        let snapshot = ctx.load_snapshot(&self.route_id)?;

        if !snapshot.status.can_transition_to(RouteStatus::InProgress) {
            return Err(DispatchError::illegal(
                "route",
                snapshot.status,
                RouteStatus::InProgress,
            ));
        }
        if snapshot.vehicle_id.is_empty() {
            return Err(DispatchError::IllegalTransition(format!(
                "route {} has no vehicle",
                self.route_id
            )));
        }
        if snapshot.pending_count() == 0 {
            return Err(DispatchError::IllegalTransition(format!(
                "route {} has no pending stops",
                self.route_id
            )));
        }

        let event = ctx.event(
            &self.route_id,
            metadata.origin,
            metadata,
            EventPayload::RouteStatusChanged {
                from: snapshot.status,
                to: RouteStatus::InProgress,
                vehicle_id: None,
                capacity: None,
                reason: None,
            },
        )?;

        Ok(vec![event])
    }
}

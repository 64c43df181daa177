//! ForceState command handler
//!
//! Manual override: sets a route or stop status once, bypassing the
//! transition table. The previous state travels in the event for audit.

use crate::dispatch::traits::{CommandContext, CommandHandler, CommandMetadata, DispatchError};
use shared::route::{EventPayload, OverrideTarget, SyncEvent};

/// ForceState action
#[derive(Debug, Clone)]
pub struct ForceStateAction {
    pub route_id: String,
    pub target: OverrideTarget,
    pub reason: String,
}

impl CommandHandler for ForceStateAction {
    fn execute(
        &self,
        ctx: &mut CommandContext<'_>,
        metadata: &CommandMetadata,
    ) -> Result<Vec<SyncEvent>, DispatchError> {
        if self.reason.trim().is_empty() {
            return Err(DispatchError::InvalidOperation(
                "an override needs a reason".to_string(),
            ));
        }

        let snapshot = ctx.load_snapshot(&self.route_id)?;

        let (previous_route_status, previous_stop_status) = match &self.target {
            OverrideTarget::Route { status } => {
                if snapshot.status == *status {
                    return Err(DispatchError::InvalidOperation(format!(
                        "route {} is already {status}",
                        self.route_id
                    )));
                }
                (Some(snapshot.status), None)
            }
            OverrideTarget::Stop { order_id, status } => {
                let stop = snapshot
                    .stop(order_id)
                    .ok_or_else(|| DispatchError::StopNotFound {
                        route_id: self.route_id.clone(),
                        order_id: order_id.clone(),
                    })?;
                if stop.status == *status {
                    return Err(DispatchError::InvalidOperation(format!(
                        "stop {order_id} is already {status}"
                    )));
                }
                (None, Some(stop.status))
            }
        };

        let event = ctx.event(
            &self.route_id,
            metadata.origin,
            metadata,
            EventPayload::OverrideApplied {
                target: self.target.clone(),
                previous_route_status,
                previous_stop_status,
                reason: self.reason.clone(),
            },
        )?;

        Ok(vec![event])
    }
}

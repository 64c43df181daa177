//! Command action implementations
//!
//! Each action implements the `CommandHandler` trait and handles
//! one specific command type.

use crate::dispatch::traits::{CommandContext, CommandHandler, CommandMetadata, DispatchError};
use shared::route::{CommandPayload, DispatchCommand, RouteSnapshot, SyncEvent};

mod assign_vehicle;
mod cancel_route;
mod create_route;
mod force_state;
mod insert_stops;
mod reassign_stop;
mod record_location;
mod resequence_stops;
mod start_route;
mod update_stop_status;

pub use assign_vehicle::AssignVehicleAction;
pub use cancel_route::CancelRouteAction;
pub use create_route::CreateRouteAction;
pub use force_state::ForceStateAction;
pub use insert_stops::InsertStopsAction;
pub use reassign_stop::ReassignStopAction;
pub use record_location::RecordLocationAction;
pub use resequence_stops::ResequenceStopsAction;
pub use start_route::StartRouteAction;
pub use update_stop_status::UpdateStopStatusAction;

/// CommandAction enum - dispatches to concrete action implementations
pub enum CommandAction {
    CreateRoute(CreateRouteAction),
    AssignVehicle(AssignVehicleAction),
    StartRoute(StartRouteAction),
    UpdateStopStatus(UpdateStopStatusAction),
    RecordLocation(RecordLocationAction),
    InsertStops(InsertStopsAction),
    ResequenceStops(ResequenceStopsAction),
    ReassignStop(ReassignStopAction),
    CancelRoute(CancelRouteAction),
    ForceState(ForceStateAction),
}

impl CommandHandler for CommandAction {
    fn execute(
        &self,
        ctx: &mut CommandContext<'_>,
        metadata: &CommandMetadata,
    ) -> Result<Vec<SyncEvent>, DispatchError> {
        match self {
            CommandAction::CreateRoute(action) => action.execute(ctx, metadata),
            CommandAction::AssignVehicle(action) => action.execute(ctx, metadata),
            CommandAction::StartRoute(action) => action.execute(ctx, metadata),
            CommandAction::UpdateStopStatus(action) => action.execute(ctx, metadata),
            CommandAction::RecordLocation(action) => action.execute(ctx, metadata),
            CommandAction::InsertStops(action) => action.execute(ctx, metadata),
            CommandAction::ResequenceStops(action) => action.execute(ctx, metadata),
            CommandAction::ReassignStop(action) => action.execute(ctx, metadata),
            CommandAction::CancelRoute(action) => action.execute(ctx, metadata),
            CommandAction::ForceState(action) => action.execute(ctx, metadata),
        }
    }
}

/// Convert DispatchCommand to CommandAction
///
/// This is the ONLY place with a match on CommandPayload.
impl From<&DispatchCommand> for CommandAction {
    fn from(cmd: &DispatchCommand) -> Self {
        match &cmd.payload {
            CommandPayload::CreateRoute {
                route_id,
                vehicle_id,
                planning_date,
                capacity,
                stops,
                estimated_distance_m,
                estimated_duration_s,
            } => CommandAction::CreateRoute(CreateRouteAction {
                route_id: route_id.clone(),
                vehicle_id: vehicle_id.clone(),
                planning_date: *planning_date,
                capacity: *capacity,
                stops: stops.clone(),
                estimated_distance_m: *estimated_distance_m,
                estimated_duration_s: *estimated_duration_s,
            }),
            CommandPayload::AssignVehicle {
                route_id,
                vehicle_id,
                capacity,
            } => CommandAction::AssignVehicle(AssignVehicleAction {
                route_id: route_id.clone(),
                vehicle_id: vehicle_id.clone(),
                capacity: *capacity,
            }),
            CommandPayload::StartRoute { route_id } => CommandAction::StartRoute(StartRouteAction {
                route_id: route_id.clone(),
            }),
            CommandPayload::UpdateStopStatus {
                route_id,
                order_id,
                status,
                occurred_at,
                evidence_ref,
                failure_reason,
            } => CommandAction::UpdateStopStatus(UpdateStopStatusAction {
                route_id: route_id.clone(),
                order_id: order_id.clone(),
                status: *status,
                occurred_at: *occurred_at,
                evidence_ref: evidence_ref.clone(),
                failure_reason: failure_reason.clone(),
            }),
            CommandPayload::RecordLocation {
                route_id,
                location,
                recorded_at,
            } => CommandAction::RecordLocation(RecordLocationAction {
                route_id: route_id.clone(),
                location: *location,
                recorded_at: *recorded_at,
            }),
            CommandPayload::InsertStops {
                route_id,
                insertions,
                planned_arrivals,
            } => CommandAction::InsertStops(InsertStopsAction {
                route_id: route_id.clone(),
                insertions: insertions.clone(),
                planned_arrivals: planned_arrivals.clone(),
            }),
            CommandPayload::ResequenceStops {
                route_id,
                sequence,
                estimated_distance_m,
                estimated_duration_s,
            } => CommandAction::ResequenceStops(ResequenceStopsAction {
                route_id: route_id.clone(),
                sequence: sequence.clone(),
                estimated_distance_m: *estimated_distance_m,
                estimated_duration_s: *estimated_duration_s,
            }),
            CommandPayload::ReassignStop {
                from_route_id,
                to_route_id,
                order_id,
                position,
            } => CommandAction::ReassignStop(ReassignStopAction {
                from_route_id: from_route_id.clone(),
                to_route_id: to_route_id.clone(),
                order_id: order_id.clone(),
                position: *position,
            }),
            CommandPayload::CancelRoute { route_id, reason } => {
                CommandAction::CancelRoute(CancelRouteAction {
                    route_id: route_id.clone(),
                    reason: reason.clone(),
                })
            }
            CommandPayload::ForceState {
                route_id,
                target,
                reason,
            } => CommandAction::ForceState(ForceStateAction {
                route_id: route_id.clone(),
                target: target.clone(),
                reason: reason.clone(),
            }),
        }
    }
}

/// Reject commands against completed/cancelled routes
pub(crate) fn ensure_active(snapshot: &RouteSnapshot, action: &str) -> Result<(), DispatchError> {
    if snapshot.status.is_terminal() {
        return Err(DispatchError::IllegalTransition(format!(
            "cannot {action} on route {} in status {}",
            snapshot.route_id, snapshot.status
        )));
    }
    Ok(())
}

/// Reject a plan computed against an older state of the route
pub(crate) fn ensure_fresh(
    snapshot: &RouteSnapshot,
    metadata: &CommandMetadata,
) -> Result<(), DispatchError> {
    if let Some(observed) = metadata.observed_sequence
        && snapshot.last_sequence > observed
    {
        return Err(DispatchError::SyncConflict(format!(
            "route {} is at sequence {} but the change was computed at {}",
            snapshot.route_id, snapshot.last_sequence, observed
        )));
    }
    Ok(())
}

/// Reject demand that would overflow the route's vehicle
pub(crate) fn ensure_capacity(snapshot: &RouteSnapshot, extra: u32) -> Result<(), DispatchError> {
    let demand = snapshot.total_demand() + extra;
    if demand > snapshot.capacity {
        return Err(DispatchError::CapacityExceeded {
            route_id: snapshot.route_id.clone(),
            demand,
            capacity: snapshot.capacity,
        });
    }
    Ok(())
}

//! Event appliers - pure reducers from `SyncEvent` to `RouteSnapshot`
//!
//! The dispatch server and driver devices run the same appliers, so a
//! snapshot rebuilt from the event log on either side carries the same
//! checksum.

use enum_dispatch::enum_dispatch;

use super::event::{EventPayload, SyncEvent};
use super::snapshot::RouteSnapshot;
use super::{OverrideTarget, RouteStatus, StopStatus};

/// Applies one event type to a snapshot
///
/// Implementations must be pure: same snapshot + same event gives the same
/// result.
#[enum_dispatch]
pub trait EventApplier {
    fn apply(&self, snapshot: &mut RouteSnapshot, event: &SyncEvent);
}

/// Dispatches to the applier of the event's payload
#[enum_dispatch(EventApplier)]
pub enum EventAction {
    RouteCreated(RouteCreatedApplier),
    RouteStatusChanged(RouteStatusChangedApplier),
    StopStatusChanged(StopStatusChangedApplier),
    LocationUpdate(LocationUpdateApplier),
    RouteReassigned(RouteReassignedApplier),
    OrderAdded(OrderAddedApplier),
    StopsResequenced(StopsResequencedApplier),
    OverrideApplied(OverrideAppliedApplier),
}

/// This is the ONLY place with a match on the payload kind.
impl From<&SyncEvent> for EventAction {
    fn from(event: &SyncEvent) -> Self {
        match &event.payload {
            EventPayload::RouteCreated { .. } => EventAction::RouteCreated(RouteCreatedApplier),
            EventPayload::RouteStatusChanged { .. } => {
                EventAction::RouteStatusChanged(RouteStatusChangedApplier)
            }
            EventPayload::StopStatusChanged { .. } => {
                EventAction::StopStatusChanged(StopStatusChangedApplier)
            }
            EventPayload::LocationUpdate { .. } => EventAction::LocationUpdate(LocationUpdateApplier),
            EventPayload::RouteReassigned { .. } => {
                EventAction::RouteReassigned(RouteReassignedApplier)
            }
            EventPayload::OrderAdded { .. } => EventAction::OrderAdded(OrderAddedApplier),
            EventPayload::StopsResequenced { .. } => {
                EventAction::StopsResequenced(StopsResequencedApplier)
            }
            EventPayload::OverrideApplied { .. } => {
                EventAction::OverrideApplied(OverrideAppliedApplier)
            }
        }
    }
}

/// Apply any event to a snapshot
pub fn apply_event(snapshot: &mut RouteSnapshot, event: &SyncEvent) {
    EventAction::from(event).apply(snapshot, event);
}

/// Bookkeeping shared by every applier
fn finish(snapshot: &mut RouteSnapshot, event: &SyncEvent) {
    snapshot.last_sequence = event.sequence;
    snapshot.updated_at = event.timestamp;
    snapshot.update_checksum();
}

fn mark_route_status(snapshot: &mut RouteSnapshot, status: RouteStatus, at: i64) {
    snapshot.status = status;
    if status == RouteStatus::InProgress && snapshot.started_at.is_none() {
        snapshot.started_at = Some(at);
    }
    if status.is_terminal() {
        snapshot.finished_at = Some(at);
    }
}

pub struct RouteCreatedApplier;

impl EventApplier for RouteCreatedApplier {
    fn apply(&self, snapshot: &mut RouteSnapshot, event: &SyncEvent) {
        if let EventPayload::RouteCreated {
            vehicle_id,
            planning_date,
            capacity,
            stops,
            estimated_distance_m,
            estimated_duration_s,
        } = &event.payload
        {
            snapshot.route_id = event.route_id.clone();
            snapshot.vehicle_id = vehicle_id.clone();
            snapshot.planning_date = *planning_date;
            snapshot.capacity = *capacity;
            snapshot.status = RouteStatus::Planned;
            snapshot.stops = stops.clone();
            for stop in &mut snapshot.stops {
                stop.status_sequence = event.sequence;
            }
            snapshot.reindex();
            snapshot.estimated_distance_m = *estimated_distance_m;
            snapshot.estimated_duration_s = *estimated_duration_s;
            snapshot.created_at = event.timestamp;
            finish(snapshot, event);
        }
    }
}

pub struct RouteStatusChangedApplier;

impl EventApplier for RouteStatusChangedApplier {
    fn apply(&self, snapshot: &mut RouteSnapshot, event: &SyncEvent) {
        if let EventPayload::RouteStatusChanged {
            to,
            vehicle_id,
            capacity,
            ..
        } = &event.payload
        {
            if let Some(vehicle_id) = vehicle_id {
                snapshot.vehicle_id = vehicle_id.clone();
            }
            if let Some(capacity) = capacity {
                snapshot.capacity = *capacity;
            }
            mark_route_status(snapshot, *to, event.timestamp);
            finish(snapshot, event);
        }
    }
}

pub struct StopStatusChangedApplier;

impl EventApplier for StopStatusChangedApplier {
    fn apply(&self, snapshot: &mut RouteSnapshot, event: &SyncEvent) {
        if let EventPayload::StopStatusChanged {
            order_id,
            to,
            occurred_at,
            evidence_ref,
            failure_reason,
            ..
        } = &event.payload
        {
            if let Some(stop) = snapshot.stop_mut(order_id) {
                stop.status = *to;
                stop.status_sequence = event.sequence;
                match to {
                    StopStatus::Arrived => stop.actual_arrival = Some(*occurred_at),
                    StopStatus::Completed => {
                        stop.actual_arrival.get_or_insert(*occurred_at);
                        stop.finished_at = Some(*occurred_at);
                        if evidence_ref.is_some() {
                            stop.evidence_ref = evidence_ref.clone();
                        }
                    }
                    StopStatus::Failed => {
                        stop.finished_at = Some(*occurred_at);
                        stop.failure_reason = failure_reason.clone();
                    }
                    StopStatus::Pending | StopStatus::EnRoute => {}
                }
            }
            finish(snapshot, event);
        }
    }
}

pub struct LocationUpdateApplier;

impl EventApplier for LocationUpdateApplier {
    fn apply(&self, snapshot: &mut RouteSnapshot, event: &SyncEvent) {
        if let EventPayload::LocationUpdate {
            location,
            recorded_at,
        } = &event.payload
        {
            // Late pings from a replayed queue never move the vehicle back
            if snapshot.last_location_at.is_none_or(|at| *recorded_at >= at) {
                snapshot.last_location = Some(*location);
                snapshot.last_location_at = Some(*recorded_at);
            }
            finish(snapshot, event);
        }
    }
}

pub struct RouteReassignedApplier;

impl EventApplier for RouteReassignedApplier {
    fn apply(&self, snapshot: &mut RouteSnapshot, event: &SyncEvent) {
        if let EventPayload::RouteReassigned {
            order_id,
            from_route_id,
            to_route_id,
            stop,
            position,
            ..
        } = &event.payload
        {
            if snapshot.route_id == *from_route_id {
                snapshot.remove_stop(order_id);
            } else if snapshot.route_id == *to_route_id
                && let Some(stop) = stop
            {
                let mut stop = stop.clone();
                stop.status_sequence = event.sequence;
                let at = position.map(|p| p as usize).unwrap_or(snapshot.stops.len());
                snapshot.insert_stop(stop, at);
            }
            finish(snapshot, event);
        }
    }
}

pub struct OrderAddedApplier;

impl EventApplier for OrderAddedApplier {
    fn apply(&self, snapshot: &mut RouteSnapshot, event: &SyncEvent) {
        if let EventPayload::OrderAdded {
            stop,
            position,
            planned_arrivals,
        } = &event.payload
        {
            let mut stop = stop.clone();
            stop.status_sequence = event.sequence;
            snapshot.insert_stop(stop, *position as usize);
            snapshot.apply_planned_arrivals(planned_arrivals);
            finish(snapshot, event);
        }
    }
}

pub struct StopsResequencedApplier;

impl EventApplier for StopsResequencedApplier {
    fn apply(&self, snapshot: &mut RouteSnapshot, event: &SyncEvent) {
        if let EventPayload::StopsResequenced {
            sequence,
            estimated_distance_m,
            estimated_duration_s,
        } = &event.payload
        {
            if let Err(reason) = snapshot.apply_sequence(sequence) {
                tracing::error!(
                    route_id = %snapshot.route_id,
                    sequence = event.sequence,
                    reason = %reason,
                    "Resequence event does not match route stops"
                );
            }
            snapshot.estimated_distance_m = *estimated_distance_m;
            snapshot.estimated_duration_s = *estimated_duration_s;
            finish(snapshot, event);
        }
    }
}

pub struct OverrideAppliedApplier;

impl EventApplier for OverrideAppliedApplier {
    fn apply(&self, snapshot: &mut RouteSnapshot, event: &SyncEvent) {
        if let EventPayload::OverrideApplied { target, .. } = &event.payload {
            match target {
                OverrideTarget::Route { status } => {
                    mark_route_status(snapshot, *status, event.timestamp);
                }
                OverrideTarget::Stop { order_id, status } => {
                    if let Some(stop) = snapshot.stop_mut(order_id) {
                        stop.status = *status;
                        stop.status_sequence = event.sequence;
                        if status.is_terminal() {
                            stop.finished_at.get_or_insert(event.timestamp);
                        } else {
                            stop.finished_at = None;
                        }
                    }
                }
            }
            finish(snapshot, event);
        }
    }
}

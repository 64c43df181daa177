use super::*;
use chrono::NaiveDate;
use shared::models::{GeoPoint, Order, PriorityTier};
use shared::route::PlannedStop;

fn create_test_manager() -> DispatchManager {
    let storage = DispatchStorage::open_in_memory().unwrap();
    DispatchManager::with_storage(storage)
}

fn planning_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
}

fn planned_stop(order_id: &str, demand: u32) -> PlannedStop {
    PlannedStop {
        order_id: order_id.to_string(),
        location: GeoPoint::new(40.0, -3.0),
        demand,
        priority: PriorityTier::Normal,
        time_window: None,
        planned_arrival: None,
    }
}

fn intake_order(order_id: &str) -> Order {
    Order {
        id: order_id.to_string(),
        location: GeoPoint::new(40.0, -3.0),
        demand: 1,
        priority: PriorityTier::Normal,
        time_window: None,
        status: OrderStatus::Unassigned,
        planning_date: planning_date(),
        created_at: 0,
    }
}

fn dispatcher(payload: CommandPayload) -> DispatchCommand {
    DispatchCommand::new(EventOrigin::Dispatcher, payload).with_actor("dispatcher-1")
}

fn driver(payload: CommandPayload) -> DispatchCommand {
    DispatchCommand::new(EventOrigin::Driver, payload).with_actor("driver-1")
}

fn create_route_cmd(route_id: &str, order_ids: &[&str], capacity: u32) -> DispatchCommand {
    DispatchCommand::new(
        EventOrigin::System,
        CommandPayload::CreateRoute {
            route_id: route_id.to_string(),
            vehicle_id: format!("v-{route_id}"),
            planning_date: planning_date(),
            capacity,
            stops: order_ids.iter().map(|id| planned_stop(id, 1)).collect(),
            estimated_distance_m: 1000.0,
            estimated_duration_s: 600.0,
        },
    )
}

fn stop_update(route_id: &str, order_id: &str, status: StopStatus) -> CommandPayload {
    CommandPayload::UpdateStopStatus {
        route_id: route_id.to_string(),
        order_id: order_id.to_string(),
        status,
        occurred_at: None,
        evidence_ref: None,
        failure_reason: None,
    }
}

/// Create and assign a route, asserting success
fn dispatched_route(manager: &DispatchManager, route_id: &str, order_ids: &[&str]) {
    let resp = manager.execute_command(create_route_cmd(route_id, order_ids, 6));
    assert!(resp.success, "create failed: {:?}", resp.error);
    let resp = manager.execute_command(dispatcher(CommandPayload::AssignVehicle {
        route_id: route_id.to_string(),
        vehicle_id: format!("v-{route_id}"),
        capacity: 6,
    }));
    assert!(resp.success, "assign failed: {:?}", resp.error);
}

fn snapshot(manager: &DispatchManager, route_id: &str) -> RouteSnapshot {
    manager.get_snapshot(route_id).unwrap().unwrap()
}

fn stop_ids(snapshot: &RouteSnapshot) -> Vec<&str> {
    snapshot.stops.iter().map(|s| s.order_id.as_str()).collect()
}

fn error_code(resp: &CommandResponse) -> shared::error::ErrorCode {
    resp.error.as_ref().expect("expected an error").code
}

mod test_conflicts;
mod test_core;
mod test_flows;

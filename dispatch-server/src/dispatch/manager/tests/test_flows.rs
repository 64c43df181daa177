use super::*;
use shared::models::{ShiftWindow, Vehicle};
use shared::route::{PlannedArrival, StopInsertion};

#[test]
fn test_full_delivery_flow_auto_completes() {
    let manager = create_test_manager();
    dispatched_route(&manager, "r-1", &["a", "b"]);

    for (order, status) in [
        ("a", StopStatus::EnRoute),
        ("a", StopStatus::Arrived),
        ("a", StopStatus::Completed),
        ("b", StopStatus::Arrived),
        ("b", StopStatus::Failed),
    ] {
        let resp = manager.execute_command(driver(stop_update("r-1", order, status)));
        assert!(resp.success, "{order} -> {status}: {:?}", resp.error);
    }

    let route = snapshot(&manager, "r-1");
    assert_eq!(route.status, RouteStatus::Completed);
    assert!(route.started_at.is_some());
    assert!(route.finished_at.is_some());

    let last = manager.get_events_since("r-1", route.last_sequence - 1).unwrap();
    assert_eq!(last.len(), 1);
    assert_eq!(last[0].origin, EventOrigin::System);
}

#[test]
fn test_offline_completions_replayed_in_order() {
    let manager = create_test_manager();
    dispatched_route(&manager, "r-1", &["s1", "s2", "s3", "s4", "s5"]);

    // Stop 3 completed online, two more queued while offline
    let queued: Vec<DispatchCommand> = ["s3", "s4", "s5"]
        .iter()
        .enumerate()
        .map(|(i, order)| {
            driver(CommandPayload::UpdateStopStatus {
                route_id: "r-1".to_string(),
                order_id: order.to_string(),
                status: StopStatus::Completed,
                occurred_at: Some(1_000 + i as i64),
                evidence_ref: Some(format!("sig-{order}")),
                failure_reason: None,
            })
            .with_command_id(format!("local-{order}"))
        })
        .collect();

    assert!(manager.execute_command(queued[0].clone()).success);

    // Reconnect: replay, with the network retrying the middle item
    let mut rx = manager.subscribe();
    assert!(manager.execute_command(queued[1].clone()).success);
    let retry = manager.execute_command(queued[1].clone());
    assert!(retry.duplicate);
    assert!(manager.execute_command(queued[2].clone()).success);

    let route = snapshot(&manager, "r-1");
    let completed: Vec<&str> = route
        .stops
        .iter()
        .filter(|s| s.status == StopStatus::Completed)
        .map(|s| s.order_id.as_str())
        .collect();
    assert_eq!(completed, ["s3", "s4", "s5"]);

    let mut sequences = Vec::new();
    while let Ok(event) = rx.try_recv() {
        sequences.push(event.sequence);
    }
    assert!(sequences.windows(2).all(|w| w[1] > w[0]));
    // Two stops, implicit arrival + completion each
    assert_eq!(sequences.len(), 4);
}

#[test]
fn test_reassign_moves_stop_and_index() {
    let manager = create_test_manager();
    dispatched_route(&manager, "r-1", &["a", "b"]);
    dispatched_route(&manager, "r-2", &["x"]);

    let resp = manager.execute_command(dispatcher(CommandPayload::ReassignStop {
        from_route_id: "r-1".to_string(),
        to_route_id: "r-2".to_string(),
        order_id: "b".to_string(),
        position: Some(0),
    }));
    assert!(resp.success, "{:?}", resp.error);
    assert_eq!(resp.last_sequence_for("r-1"), Some(3));
    assert_eq!(resp.last_sequence_for("r-2"), Some(3));

    let from = snapshot(&manager, "r-1");
    let to = snapshot(&manager, "r-2");
    assert_eq!(stop_ids(&from), ["a"]);
    assert_eq!(stop_ids(&to), ["b", "x"]);
    assert!(from.has_contiguous_indices() && to.has_contiguous_indices());
    assert_eq!(
        to.stop("b").unwrap().reassigned_from.as_ref().unwrap().route_id,
        "r-1"
    );
    assert_eq!(
        manager.storage().route_for_order("b").unwrap().as_deref(),
        Some("r-2")
    );
}

#[test]
fn test_insert_stops_with_refreshed_etas() {
    let manager = create_test_manager();
    dispatched_route(&manager, "r-1", &["a", "b"]);
    manager.execute_command(driver(stop_update("r-1", "a", StopStatus::Completed)));

    let resp = manager.execute_command(DispatchCommand::new(
        EventOrigin::System,
        CommandPayload::InsertStops {
            route_id: "r-1".to_string(),
            insertions: vec![StopInsertion {
                stop: planned_stop("u", 2),
                position: 1,
            }],
            planned_arrivals: vec![
                PlannedArrival {
                    order_id: "u".to_string(),
                    planned_arrival: Some(10_000),
                },
                PlannedArrival {
                    order_id: "b".to_string(),
                    planned_arrival: Some(12_000),
                },
            ],
        },
    ));
    assert!(resp.success, "{:?}", resp.error);

    let route = snapshot(&manager, "r-1");
    assert_eq!(stop_ids(&route), ["a", "u", "b"]);
    assert_eq!(route.stop("b").unwrap().planned_arrival, Some(12_000));
    assert_eq!(route.total_demand(), 4);
}

#[test]
fn test_cancel_returns_open_orders_to_pool() {
    let manager = create_test_manager();
    for id in ["a", "b"] {
        manager.storage().upsert_order(&intake_order(id)).unwrap();
    }
    dispatched_route(&manager, "r-1", &["a", "b"]);
    manager.execute_command(driver(stop_update("r-1", "a", StopStatus::Completed)));

    let resp = manager.execute_command(dispatcher(CommandPayload::CancelRoute {
        route_id: "r-1".to_string(),
        reason: Some("truck broke down".to_string()),
    }));
    assert!(resp.success);

    let storage = manager.storage();
    assert_eq!(storage.get_order("a").unwrap().unwrap().status, OrderStatus::Delivered);
    assert_eq!(storage.get_order("b").unwrap().unwrap().status, OrderStatus::Unassigned);
    assert!(storage.route_for_order("b").unwrap().is_none());

    // The freed order can be planned again
    let resp = manager.execute_command(create_route_cmd("r-2", &["b"], 6));
    assert!(resp.success, "{:?}", resp.error);
}

#[test]
fn test_location_updates_vehicle_position() {
    let manager = create_test_manager();
    manager
        .storage()
        .upsert_vehicle(&Vehicle {
            id: "v-r-1".to_string(),
            capacity: 6,
            shift: ShiftWindow::new(0, 1_000_000),
            depot: GeoPoint::new(40.0, -3.0),
            current_location: None,
            location_updated_at: None,
            available: true,
        })
        .unwrap();
    dispatched_route(&manager, "r-1", &["a"]);

    let ping = |lat: f64, at: i64| {
        driver(CommandPayload::RecordLocation {
            route_id: "r-1".to_string(),
            location: GeoPoint::new(lat, -3.0),
            recorded_at: at,
        })
    };
    assert!(manager.execute_command(ping(40.5, 200)).success);
    // Late ping from a replayed queue
    assert!(manager.execute_command(ping(40.1, 100)).success);

    let vehicle = manager.storage().get_vehicle("v-r-1").unwrap().unwrap();
    assert_eq!(vehicle.current_location, Some(GeoPoint::new(40.5, -3.0)));
    assert_eq!(snapshot(&manager, "r-1").last_location, Some(GeoPoint::new(40.5, -3.0)));
}

#[test]
fn test_override_reopens_failed_stop() {
    let manager = create_test_manager();
    manager.storage().upsert_order(&intake_order("b")).unwrap();
    dispatched_route(&manager, "r-1", &["a", "b"]);
    manager.execute_command(driver(stop_update("r-1", "b", StopStatus::Failed)));
    assert_eq!(
        manager.storage().get_order("b").unwrap().unwrap().status,
        OrderStatus::Failed
    );

    let resp = manager.execute_command(dispatcher(CommandPayload::ForceState {
        route_id: "r-1".to_string(),
        target: OverrideTarget::Stop {
            order_id: "b".to_string(),
            status: StopStatus::Pending,
        },
        reason: "customer was home after all".to_string(),
    }));
    assert!(resp.success, "{:?}", resp.error);

    let route = snapshot(&manager, "r-1");
    assert_eq!(route.stop("b").unwrap().status, StopStatus::Pending);
    assert_eq!(route.stop("b").unwrap().finished_at, None);
    assert_eq!(
        manager.storage().get_order("b").unwrap().unwrap().status,
        OrderStatus::Assigned
    );
}

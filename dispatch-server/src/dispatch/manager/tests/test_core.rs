use super::*;
use shared::error::ErrorCode;

#[test]
fn test_create_route() {
    let manager = create_test_manager();
    let resp = manager.execute_command(create_route_cmd("r-1", &["a", "b", "c"], 6));

    assert!(resp.success);
    assert_eq!(resp.last_sequence_for("r-1"), Some(1));

    let route = snapshot(&manager, "r-1");
    assert_eq!(route.status, RouteStatus::Planned);
    assert_eq!(stop_ids(&route), ["a", "b", "c"]);
    assert!(route.has_contiguous_indices());
    assert_eq!(route.last_sequence, 1);
    assert_eq!(manager.route_sequence("r-1").unwrap(), 1);
}

#[test]
fn test_idempotency() {
    let manager = create_test_manager();
    let cmd = create_route_cmd("r-1", &["a"], 6);

    let first = manager.execute_command(cmd.clone());
    assert!(first.success);
    assert!(!first.duplicate);

    let second = manager.execute_command(cmd);
    assert!(second.success);
    assert!(second.duplicate);
    assert!(second.sequences.is_empty());

    assert_eq!(manager.get_events_since("r-1", 0).unwrap().len(), 1);
}

#[test]
fn test_rejected_command_changes_nothing() {
    let manager = create_test_manager();
    dispatched_route(&manager, "r-1", &["a", "b"]);
    let before = snapshot(&manager, "r-1");

    // Completion requires arrival unless a driver reports it
    let resp = manager.execute_command(dispatcher(stop_update("r-1", "a", StopStatus::Completed)));
    assert!(!resp.success);
    assert_eq!(error_code(&resp), ErrorCode::IllegalTransition);

    assert_eq!(snapshot(&manager, "r-1"), before);
    assert_eq!(manager.route_sequence("r-1").unwrap(), 2);
}

#[test]
fn test_rejected_command_id_can_be_retried() {
    let manager = create_test_manager();
    let start = dispatcher(CommandPayload::StartRoute {
        route_id: "r-1".to_string(),
    })
    .with_command_id("start-1");

    // Route does not exist yet
    let resp = manager.execute_command(start.clone());
    assert_eq!(error_code(&resp), ErrorCode::RouteNotFound);

    dispatched_route(&manager, "r-1", &["a"]);
    let resp = manager.execute_command(start);
    assert!(resp.success);
    assert!(!resp.duplicate);
}

#[test]
fn test_sequences_are_per_route() {
    let manager = create_test_manager();
    dispatched_route(&manager, "r-1", &["a"]);
    dispatched_route(&manager, "r-2", &["b"]);

    assert_eq!(manager.route_sequence("r-1").unwrap(), 2);
    assert_eq!(manager.route_sequence("r-2").unwrap(), 2);

    let events = manager.get_events_since("r-1", 0).unwrap();
    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    assert_eq!(sequences, [1, 2]);
    assert!(events.iter().all(|e| e.route_id == "r-1"));
}

#[test]
fn test_start_route_requires_vehicle() {
    let manager = create_test_manager();
    manager.execute_command(create_route_cmd("r-1", &["a"], 6));

    let resp = manager.execute_command(dispatcher(CommandPayload::StartRoute {
        route_id: "r-1".to_string(),
    }));
    assert_eq!(error_code(&resp), ErrorCode::IllegalTransition);
}

#[test]
fn test_rebuild_matches_stored_snapshot() {
    let manager = create_test_manager();
    dispatched_route(&manager, "r-1", &["a", "b"]);
    manager.execute_command(driver(stop_update("r-1", "a", StopStatus::Arrived)));
    manager.execute_command(driver(stop_update("r-1", "a", StopStatus::Completed)));

    let stored = snapshot(&manager, "r-1");
    let rebuilt = manager.rebuild_snapshot("r-1").unwrap();
    assert_eq!(rebuilt.state_checksum, stored.state_checksum);
    assert_eq!(rebuilt.stops, stored.stops);
    assert!(manager.verify_route("r-1").unwrap());
}

#[test]
fn test_rebuild_unknown_route() {
    let manager = create_test_manager();
    assert!(matches!(
        manager.rebuild_snapshot("ghost"),
        Err(ManagerError::RouteNotFound(_))
    ));
}

#[test]
fn test_create_route_marks_orders_assigned() {
    let manager = create_test_manager();
    manager.storage().upsert_order(&intake_order("a")).unwrap();

    manager.execute_command(create_route_cmd("r-1", &["a"], 6));

    let order = manager.storage().get_order("a").unwrap().unwrap();
    assert_eq!(order.status, OrderStatus::Assigned);
    assert_eq!(
        manager.storage().route_for_order("a").unwrap().as_deref(),
        Some("r-1")
    );
}

#[test]
fn test_order_cannot_be_on_two_routes() {
    let manager = create_test_manager();
    manager.execute_command(create_route_cmd("r-1", &["a", "b"], 6));

    let resp = manager.execute_command(create_route_cmd("r-2", &["b"], 6));
    assert_eq!(error_code(&resp), ErrorCode::OrderAlreadyRouted);
    assert!(manager.get_snapshot("r-2").unwrap().is_none());
}

#[test]
fn test_capacity_enforced_on_create() {
    let manager = create_test_manager();
    let resp = manager.execute_command(create_route_cmd("r-1", &["a", "b", "c"], 2));
    assert_eq!(error_code(&resp), ErrorCode::CapacityExceeded);
}

#[test]
fn test_subscribers_see_events_in_sequence_order() {
    let manager = create_test_manager();
    let mut rx = manager.subscribe();

    dispatched_route(&manager, "r-1", &["a", "b"]);
    manager.execute_command(driver(stop_update("r-1", "a", StopStatus::Completed)));

    let mut sequences = Vec::new();
    while let Ok(event) = rx.try_recv() {
        sequences.push(event.sequence);
    }
    // create, assign, auto-start, implicit arrival, completion
    assert_eq!(sequences, [1, 2, 3, 4, 5]);
}

#[test]
fn test_archive_finished_route() {
    let manager = create_test_manager();
    dispatched_route(&manager, "r-1", &["a"]);

    // Still live
    assert!(manager.archive_route("r-1").is_err());

    manager.execute_command(dispatcher(CommandPayload::CancelRoute {
        route_id: "r-1".to_string(),
        reason: None,
    }));
    let archived = manager.archive_route("r-1").unwrap();
    assert_eq!(archived.status, RouteStatus::Cancelled);

    assert!(manager.get_active_routes().unwrap().is_empty());
    assert_eq!(
        snapshot(&manager, "r-1").status,
        RouteStatus::Cancelled,
        "archived routes stay readable"
    );

    // Archived routes accept no more commands
    let resp = manager.execute_command(dispatcher(CommandPayload::CancelRoute {
        route_id: "r-1".to_string(),
        reason: None,
    }));
    assert_eq!(error_code(&resp), ErrorCode::RouteArchived);
}

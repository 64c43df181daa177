use super::*;
use shared::error::ErrorCode;
use shared::route::{PlannedArrival, StopInsertion};

fn reassign(from: &str, to: &str, order_id: &str) -> DispatchCommand {
    dispatcher(CommandPayload::ReassignStop {
        from_route_id: from.to_string(),
        to_route_id: to.to_string(),
        order_id: order_id.to_string(),
        position: None,
    })
}

#[test]
fn test_completion_wins_over_later_reassignment() {
    let manager = create_test_manager();
    dispatched_route(&manager, "r-1", &["s1", "s2", "s3", "s4", "s5"]);
    dispatched_route(&manager, "r-2", &["x"]);

    let resp = manager.execute_command(driver(stop_update("r-1", "s5", StopStatus::Completed)));
    assert!(resp.success);
    let r2_before = snapshot(&manager, "r-2");

    let resp = manager.execute_command(reassign("r-1", "r-2", "s5"));
    assert_eq!(error_code(&resp), ErrorCode::SyncConflict);

    assert_eq!(snapshot(&manager, "r-1").stop("s5").unwrap().status, StopStatus::Completed);
    assert_eq!(snapshot(&manager, "r-2"), r2_before);
    assert_eq!(
        manager.storage().route_for_order("s5").unwrap().as_deref(),
        Some("r-1")
    );
}

#[test]
fn test_reassignment_with_stale_view_conflicts() {
    let manager = create_test_manager();
    dispatched_route(&manager, "r-1", &["a", "b"]);
    dispatched_route(&manager, "r-2", &["x"]);
    let observed = manager.route_sequence("r-1").unwrap();

    // Driver taps en route, then a dispatcher override puts the stop back
    manager.execute_command(driver(stop_update("r-1", "b", StopStatus::EnRoute)));
    manager.execute_command(dispatcher(CommandPayload::ForceState {
        route_id: "r-1".to_string(),
        target: OverrideTarget::Stop {
            order_id: "b".to_string(),
            status: StopStatus::Pending,
        },
        reason: "tapped by mistake".to_string(),
    }));

    let resp =
        manager.execute_command(reassign("r-1", "r-2", "b").with_observed_sequence(observed));
    assert_eq!(error_code(&resp), ErrorCode::SyncConflict);

    // A fresh view is accepted
    let current = manager.route_sequence("r-1").unwrap();
    let resp = manager.execute_command(reassign("r-1", "r-2", "b").with_observed_sequence(current));
    assert!(resp.success, "{:?}", resp.error);
}

#[test]
fn test_offline_completion_reclaims_reassigned_stop() {
    let manager = create_test_manager();
    dispatched_route(&manager, "r-1", &["s1", "s2", "s3", "s4", "s5"]);
    dispatched_route(&manager, "r-2", &["x"]);

    // Dispatcher moves s5 while the driver is offline
    assert!(manager.execute_command(reassign("r-1", "r-2", "s5")).success);

    // The queued completion arrives afterwards
    let resp = manager.execute_command(driver(stop_update("r-1", "s5", StopStatus::Completed)));
    assert!(resp.success, "{:?}", resp.error);

    let r1 = snapshot(&manager, "r-1");
    let r2 = snapshot(&manager, "r-2");
    assert_eq!(r1.stop("s5").unwrap().status, StopStatus::Completed);
    assert_eq!(r1.stop("s5").unwrap().reassigned_from.as_ref().unwrap().route_id, "r-2");
    assert!(r2.stop("s5").is_none());
    assert!(r1.has_contiguous_indices() && r2.has_contiguous_indices());
    assert_eq!(
        manager.storage().route_for_order("s5").unwrap().as_deref(),
        Some("r-1")
    );
    assert!(manager.verify_route("r-1").unwrap());
    assert!(manager.verify_route("r-2").unwrap());
}

#[test]
fn test_reclaim_conflicts_once_new_route_worked_the_stop() {
    let manager = create_test_manager();
    dispatched_route(&manager, "r-1", &["a", "b"]);
    dispatched_route(&manager, "r-2", &["x"]);

    assert!(manager.execute_command(reassign("r-1", "r-2", "b")).success);
    let resp = manager.execute_command(
        driver(stop_update("r-2", "b", StopStatus::EnRoute)).with_actor("driver-2"),
    );
    assert!(resp.success);

    let resp = manager.execute_command(driver(stop_update("r-1", "b", StopStatus::Completed)));
    assert_eq!(error_code(&resp), ErrorCode::SyncConflict);
    assert!(snapshot(&manager, "r-1").stop("b").is_none());
    assert_eq!(snapshot(&manager, "r-2").stop("b").unwrap().status, StopStatus::EnRoute);
}

#[test]
fn test_non_terminal_update_for_moved_stop_is_not_found() {
    let manager = create_test_manager();
    dispatched_route(&manager, "r-1", &["a", "b"]);
    dispatched_route(&manager, "r-2", &["x"]);
    assert!(manager.execute_command(reassign("r-1", "r-2", "b")).success);

    let resp = manager.execute_command(driver(stop_update("r-1", "b", StopStatus::Arrived)));
    assert_eq!(error_code(&resp), ErrorCode::StopNotFound);
}

#[test]
fn test_insert_before_worked_stops_conflicts() {
    let manager = create_test_manager();
    dispatched_route(&manager, "r-1", &["a", "b"]);
    manager.execute_command(driver(stop_update("r-1", "a", StopStatus::Arrived)));

    let resp = manager.execute_command(DispatchCommand::new(
        EventOrigin::System,
        CommandPayload::InsertStops {
            route_id: "r-1".to_string(),
            insertions: vec![StopInsertion {
                stop: planned_stop("u", 1),
                position: 0,
            }],
            planned_arrivals: vec![],
        },
    ));
    assert_eq!(error_code(&resp), ErrorCode::SyncConflict);
    assert!(manager.storage().route_for_order("u").unwrap().is_none());
}

#[test]
fn test_resequence_cannot_move_worked_stops() {
    let manager = create_test_manager();
    dispatched_route(&manager, "r-1", &["a", "b", "c"]);
    manager.execute_command(driver(stop_update("r-1", "a", StopStatus::Completed)));

    let order = |ids: &[&str]| -> Vec<PlannedArrival> {
        ids.iter()
            .map(|id| PlannedArrival {
                order_id: id.to_string(),
                planned_arrival: None,
            })
            .collect()
    };
    let resequence = |ids: &[&str]| {
        DispatchCommand::new(
            EventOrigin::System,
            CommandPayload::ResequenceStops {
                route_id: "r-1".to_string(),
                sequence: order(ids),
                estimated_distance_m: 900.0,
                estimated_duration_s: 500.0,
            },
        )
    };

    let resp = manager.execute_command(resequence(&["b", "a", "c"]));
    assert_eq!(error_code(&resp), ErrorCode::SyncConflict);

    let resp = manager.execute_command(resequence(&["a", "c", "b"]));
    assert!(resp.success, "{:?}", resp.error);
    assert_eq!(stop_ids(&snapshot(&manager, "r-1")), ["a", "c", "b"]);
}

#[test]
fn test_concurrent_commands_on_one_route_serialize() {
    let manager = create_test_manager();
    let ids: Vec<String> = (0..6).map(|i| format!("o{i}")).collect();
    let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
    dispatched_route(&manager, "r-1", &refs);

    std::thread::scope(|scope| {
        for id in &ids {
            let manager = manager.clone();
            scope.spawn(move || {
                let resp = manager.execute_command(driver(stop_update("r-1", id, StopStatus::Arrived)));
                // Only the first update auto-starts; all must land
                assert!(resp.success, "{id}: {:?}", resp.error);
            });
        }
    });

    let events = manager.get_events_since("r-1", 0).unwrap();
    let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
    let expected: Vec<u64> = (1..=sequences.len() as u64).collect();
    assert_eq!(sequences, expected);
    // create, assign, start, six arrivals
    assert_eq!(sequences.len(), 9);
    assert!(manager.verify_route("r-1").unwrap());
}

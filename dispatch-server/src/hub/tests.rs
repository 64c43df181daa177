use std::time::Duration;

use chrono::NaiveDate;
use shared::error::{AppError, ErrorCode};
use shared::message::{
    AckPayload, AckStatus, BusMessage, ClientRole, DriverAction, Envelope, EnvelopeType,
    EventType, HandshakeAck, HandshakePayload, PROTOCOL_VERSION, ResyncComplete, ResyncRequest,
    RouteCursor, SubmitPayload,
};
use shared::models::{GeoPoint, PriorityTier};
use shared::route::{
    CommandPayload, DispatchCommand, EventOrigin, PlannedStop, RouteSnapshot, StopStatus,
};
use tokio::io::DuplexStream;

use super::transport::{read_from_stream, write_to_stream};
use super::*;
use crate::dispatch::DispatchStorage;

fn date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 3, 2).unwrap()
}

fn hub_with(timeout: Duration) -> (DispatchManager, HubServer) {
    let manager = DispatchManager::with_storage(DispatchStorage::open_in_memory().unwrap());
    let hub = HubServer::new(
        manager.clone(),
        HubConfig {
            heartbeat_timeout: timeout,
        },
    );
    (manager, hub)
}

fn hub() -> (DispatchManager, HubServer) {
    hub_with(Duration::from_secs(5))
}

fn create_route(manager: &DispatchManager, route_id: &str, vehicle_id: &str) {
    let stops = ["a", "b"]
        .iter()
        .map(|id| PlannedStop {
            order_id: format!("{route_id}-{id}"),
            location: GeoPoint::new(40.0, -3.0),
            demand: 1,
            priority: PriorityTier::Normal,
            time_window: None,
            planned_arrival: None,
        })
        .collect();
    let resp = manager.execute_command(DispatchCommand::new(
        EventOrigin::System,
        CommandPayload::CreateRoute {
            route_id: route_id.to_string(),
            vehicle_id: vehicle_id.to_string(),
            planning_date: date(),
            capacity: 4,
            stops,
            estimated_distance_m: 0.0,
            estimated_duration_s: 0.0,
        },
    ));
    assert!(resp.success, "{:?}", resp.error);
    let resp = manager.execute_command(DispatchCommand::new(
        EventOrigin::Dispatcher,
        CommandPayload::AssignVehicle {
            route_id: route_id.to_string(),
            vehicle_id: vehicle_id.to_string(),
            capacity: 4,
        },
    ));
    assert!(resp.success, "{:?}", resp.error);
}

async fn send(stream: &mut DuplexStream, msg: &BusMessage) {
    write_to_stream(stream, msg).await.unwrap();
}

async fn recv(stream: &mut DuplexStream) -> BusMessage {
    tokio::time::timeout(Duration::from_secs(2), read_from_stream(stream))
        .await
        .expect("frame within 2s")
        .unwrap()
}

/// Skip frames until one matches
async fn recv_until(stream: &mut DuplexStream, pred: impl Fn(&BusMessage) -> bool) -> BusMessage {
    loop {
        let msg = recv(stream).await;
        if pred(&msg) {
            return msg;
        }
    }
}

fn driver_hello(vehicle_id: &str) -> HandshakePayload {
    HandshakePayload {
        version: PROTOCOL_VERSION,
        role: ClientRole::Driver,
        client_id: format!("device-{vehicle_id}"),
        vehicle_id: Some(vehicle_id.to_string()),
        routes: vec![],
        epoch: None,
    }
}

/// Handshake and collect the initial snapshots
async fn connect(hub: &HubServer, hello: &HandshakePayload) -> (DuplexStream, HandshakeAck, Vec<RouteSnapshot>) {
    let mut stream = hub.connect_in_process();
    let request = BusMessage::handshake(hello).unwrap();
    send(&mut stream, &request).await;

    let reply = recv(&mut stream).await;
    assert_eq!(reply.event_type, EventType::Response);
    assert_eq!(reply.correlation_id, Some(request.request_id));
    let ack: HandshakeAck = reply.parse_payload().unwrap();

    let mut snapshots = Vec::new();
    for _ in &ack.routes {
        let msg = recv(&mut stream).await;
        assert_eq!(msg.event_type, EventType::Snapshot);
        let envelope: Envelope = msg.parse_payload().unwrap();
        assert_eq!(envelope.kind, EnvelopeType::Snapshot);
        snapshots.push(envelope.parse().unwrap());
    }
    (stream, ack, snapshots)
}

fn complete(route_id: &str, order_id: &str, key: &str) -> BusMessage {
    let submit = SubmitPayload {
        action: DriverAction::StopStatus {
            order_id: order_id.to_string(),
            status: StopStatus::Completed,
            occurred_at: 1_000,
            evidence_ref: None,
            failure_reason: None,
        },
        observed_sequence: None,
        created_at: 1_000,
    };
    let envelope = Envelope::submission(route_id.to_string(), key.to_string(), &submit).unwrap();
    BusMessage::envelope(EventType::Submit, &envelope).unwrap()
}

#[tokio::test]
async fn test_version_mismatch_is_refused() {
    let (_, hub) = hub();
    let mut stream = hub.connect_in_process();
    let mut hello = driver_hello("v-1");
    hello.version = PROTOCOL_VERSION + 1;
    send(&mut stream, &BusMessage::handshake(&hello).unwrap()).await;

    let reply = recv(&mut stream).await;
    let err: AppError = reply.parse_payload().unwrap();
    assert_eq!(err.code, ErrorCode::ProtocolMismatch);
    assert_eq!(hub.session_count(), 0);
}

#[tokio::test]
async fn test_first_frame_must_be_handshake() {
    let (_, hub) = hub();
    let mut stream = hub.connect_in_process();
    send(&mut stream, &BusMessage::heartbeat().unwrap()).await;

    let reply = recv(&mut stream).await;
    let err: AppError = reply.parse_payload().unwrap();
    assert_eq!(err.code, ErrorCode::HandshakeRequired);
}

#[tokio::test]
async fn test_driver_gets_own_routes_then_live_events() {
    let (manager, hub) = hub();
    create_route(&manager, "r-1", "v-1");
    create_route(&manager, "r-2", "v-2");

    let (mut stream, ack, snapshots) = connect(&hub, &driver_hello("v-1")).await;
    assert_eq!(ack.epoch, manager.epoch());
    assert_eq!(ack.routes, vec!["r-1".to_string()]);
    let cursor = snapshots[0].last_sequence;

    // Another vehicle's route is not forwarded, ours is
    let other = manager.execute_command(DispatchCommand::new(
        EventOrigin::Dispatcher,
        CommandPayload::CancelRoute {
            route_id: "r-2".to_string(),
            reason: Some("test".to_string()),
        },
    ));
    assert!(other.success, "{:?}", other.error);
    let mine = manager.execute_command(DispatchCommand::new(
        EventOrigin::Driver,
        CommandPayload::UpdateStopStatus {
            route_id: "r-1".to_string(),
            order_id: "r-1-a".to_string(),
            status: StopStatus::EnRoute,
            occurred_at: None,
            evidence_ref: None,
            failure_reason: None,
        },
    ));
    assert!(mine.success, "{:?}", mine.error);

    let msg = recv(&mut stream).await;
    assert_eq!(msg.event_type, EventType::Sync);
    let envelope: Envelope = msg.parse_payload().unwrap();
    assert_eq!(envelope.route_id, "r-1");
    assert_eq!(envelope.sequence_number, Some(cursor + 1));
}

#[tokio::test]
async fn test_submit_is_acked_and_echoed_in_order() {
    let (manager, hub) = hub();
    create_route(&manager, "r-1", "v-1");
    let (mut stream, _, snapshots) = connect(&hub, &driver_hello("v-1")).await;
    let mut cursor = snapshots[0].last_sequence;

    let submit = complete("r-1", "r-1-a", "local-1");
    send(&mut stream, &submit).await;

    let mut ack = None;
    while ack.is_none() || cursor < manager.route_sequence("r-1").unwrap() {
        let msg = recv(&mut stream).await;
        match msg.event_type {
            EventType::Sync => {
                let envelope: Envelope = msg.parse_payload().unwrap();
                assert_eq!(envelope.sequence_number, Some(cursor + 1));
                cursor += 1;
            }
            EventType::Response => {
                assert_eq!(msg.correlation_id, Some(submit.request_id));
                ack = Some(msg.parse_payload::<AckPayload>().unwrap());
            }
            other => panic!("unexpected {other}"),
        }
    }
    let ack = ack.unwrap();
    assert_eq!(ack.status, AckStatus::Applied);
    assert_eq!(ack.sequence_number, Some(cursor));

    // Replay of the same key changes nothing
    let replay = complete("r-1", "r-1-a", "local-1");
    send(&mut stream, &replay).await;
    let msg = recv_until(&mut stream, |m| m.correlation_id == Some(replay.request_id)).await;
    let ack: AckPayload = msg.parse_payload().unwrap();
    assert_eq!(ack.status, AckStatus::Duplicate);
    assert_eq!(manager.route_sequence("r-1").unwrap(), cursor);
}

#[tokio::test]
async fn test_submit_to_foreign_route_is_refused() {
    let (manager, hub) = hub();
    create_route(&manager, "r-1", "v-1");
    create_route(&manager, "r-2", "v-2");
    let (mut stream, _, _) = connect(&hub, &driver_hello("v-1")).await;
    let before = manager.route_sequence("r-2").unwrap();

    let submit = complete("r-2", "r-2-a", "local-1");
    send(&mut stream, &submit).await;
    let msg = recv_until(&mut stream, |m| m.correlation_id == Some(submit.request_id)).await;
    let ack: AckPayload = msg.parse_payload().unwrap();
    assert_eq!(ack.status, AckStatus::Rejected);
    assert_eq!(ack.error.unwrap().code, ErrorCode::NotSubscribed);
    assert_eq!(manager.route_sequence("r-2").unwrap(), before);
}

#[tokio::test]
async fn test_resync_replays_missed_events() {
    let (manager, hub) = hub();
    create_route(&manager, "r-1", "v-1");
    let (mut stream, _, snapshots) = connect(&hub, &driver_hello("v-1")).await;
    let server_seq = snapshots[0].last_sequence;

    // Ask from an older cursor, as a device restored from disk would
    let request = BusMessage::encode(
        EventType::Resync,
        &ResyncRequest {
            cursors: vec![RouteCursor {
                route_id: "r-1".to_string(),
                last_sequence: 0,
            }],
        },
    )
    .unwrap();
    send(&mut stream, &request).await;

    let msg = recv_until(&mut stream, |m| m.correlation_id == Some(request.request_id)).await;
    let complete: ResyncComplete = msg.parse_payload().unwrap();
    assert_eq!(complete.epoch, manager.epoch());
    assert!(complete.dropped.is_empty());
    assert_eq!(complete.cursors.len(), 1);
    assert_eq!(complete.cursors[0].last_sequence, server_seq);
}

#[tokio::test]
async fn test_resync_drops_unknown_routes() {
    let (manager, hub) = hub();
    create_route(&manager, "r-1", "v-1");
    let (mut stream, _, _) = connect(&hub, &driver_hello("v-1")).await;

    let request = BusMessage::encode(
        EventType::Resync,
        &ResyncRequest {
            cursors: vec![RouteCursor {
                route_id: "r-gone".to_string(),
                last_sequence: 3,
            }],
        },
    )
    .unwrap();
    send(&mut stream, &request).await;

    let msg = recv_until(&mut stream, |m| m.correlation_id == Some(request.request_id)).await;
    let complete: ResyncComplete = msg.parse_payload().unwrap();
    assert_eq!(complete.dropped, vec!["r-gone".to_string()]);
}

#[tokio::test]
async fn test_dispatcher_follows_new_routes() {
    let (manager, hub) = hub();
    let hello = HandshakePayload {
        version: PROTOCOL_VERSION,
        role: ClientRole::Dispatcher,
        client_id: "console-1".to_string(),
        vehicle_id: None,
        routes: vec![],
        epoch: None,
    };
    let (mut stream, ack, _) = connect(&hub, &hello).await;
    assert!(ack.routes.is_empty());

    create_route(&manager, "r-9", "v-9");

    let msg = recv(&mut stream).await;
    assert_eq!(msg.event_type, EventType::Snapshot);
    let envelope: Envelope = msg.parse_payload().unwrap();
    assert_eq!(envelope.route_id, "r-9");
}

#[tokio::test]
async fn test_heartbeat_is_answered() {
    let (_, hub) = hub();
    let (mut stream, _, _) = connect(&hub, &driver_hello("v-1")).await;

    let ping = BusMessage::heartbeat().unwrap();
    send(&mut stream, &ping).await;
    let pong = recv(&mut stream).await;
    assert_eq!(pong.event_type, EventType::Heartbeat);
    assert_eq!(pong.correlation_id, Some(ping.request_id));
}

#[tokio::test]
async fn test_silent_session_is_released() {
    let (_, hub) = hub_with(Duration::from_millis(200));
    let (_stream, _, _) = connect(&hub, &driver_hello("v-1")).await;
    assert_eq!(hub.session_count(), 1);
    assert_eq!(hub.connected_sessions()[0].client_id, "device-v-1");

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(hub.session_count(), 0);
}

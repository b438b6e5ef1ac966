//! End-to-end routing scenarios exercised in-process: registry, routing
//! core, event pump and queues wired together exactly as the binary wires
//! them, with test endpoints standing in for live sockets.

use bytes::Bytes;
use railproto::{
    fragment_frame, FrameAssembler, Notification, Packet, PacketType, TrainEvent, VideoHeader,
};
use std::sync::Arc;
use switchyard::endpoint::{Endpoint, EndpointRole, TransportKind};
use switchyard::state::{spawn_event_pump, AppState};
use tokio_util::sync::CancellationToken;

fn test_state() -> Arc<AppState> {
    let mut config = railconf::RelayConfig::default();
    config.limits.speedtest_mb = 1;
    AppState::new(config)
}

fn ws_console(state: &AppState, id: &str) -> Arc<Endpoint> {
    let endpoint = Endpoint::new(id, EndpointRole::Console, TransportKind::Ws, &state.config.limits);
    state
        .registry
        .add_console(id, TransportKind::Ws, Arc::clone(&endpoint));
    endpoint
}

fn ws_train(state: &AppState, id: &str) -> Arc<Endpoint> {
    let endpoint = Endpoint::new(id, EndpointRole::Train, TransportKind::Ws, &state.config.limits);
    state
        .registry
        .add_train(id, TransportKind::Ws, Arc::clone(&endpoint));
    endpoint
}

async fn drain_queue(endpoint: &Endpoint) -> Vec<Bytes> {
    let mut out = Vec::new();
    while !endpoint.queue().is_empty() {
        match endpoint.queue().pop().await {
            Some(data) => out.push(data),
            None => break,
        }
    }
    out
}

/// S1: one train, two bound consoles, a 4000-byte frame at MTU 1053 reaches
/// both as four packets that reassemble byte-identically.
#[tokio::test]
async fn two_consoles_receive_a_fragmented_frame() {
    let state = test_state();
    ws_train(&state, "T1");
    let c1 = ws_console(&state, "C1");
    let c2 = ws_console(&state, "C2");
    state.registry.bind("C1", "T1").unwrap();
    state.registry.bind("C2", "T1").unwrap();

    let frame: Bytes = (0..4000u32).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();
    let packets: Vec<Bytes> = fragment_frame(7, 1_700_000_000_000, "T1", frame.clone(), 1053)
        .unwrap()
        .collect();
    assert_eq!(packets.len(), 4);

    for packet in &packets {
        state.router.route_train_packet("T1", packet.clone()).await;
    }

    for console in [&c1, &c2] {
        let received = drain_queue(console).await;
        assert_eq!(received.len(), 4);

        let mut assembler = FrameAssembler::new();
        let mut assembled = None;
        for (i, data) in received.iter().enumerate() {
            let (header, slice) = VideoHeader::parse(data).unwrap();
            assert_eq!(header.frame_id, 7);
            assert_eq!(header.packet_count, 4);
            assert_eq!(header.packet_index as usize, i + 1);
            assert_eq!(header.capture_timestamp_ms, 1_700_000_000_000);
            assembled = assembler.push(&header, slice);
        }
        assert_eq!(assembled.unwrap().data, frame);
    }
}

/// S3: after a rebind from T1 to T2, nothing T1 emits reaches the console
/// and everything T2 emits does.
#[tokio::test]
async fn rebind_reroutes_cleanly() {
    let state = test_state();
    ws_train(&state, "T1");
    ws_train(&state, "T2");
    let c1 = ws_console(&state, "C1");
    state.registry.bind("C1", "T1").unwrap();
    state.registry.bind("C1", "T2").unwrap();

    let stale: Vec<Bytes> = fragment_frame(1, 0, "T1", vec![1u8; 500].into(), 1053)
        .unwrap()
        .collect();
    for packet in stale {
        state.router.route_train_packet("T1", packet).await;
    }
    assert!(c1.queue().is_empty());

    let fresh: Vec<Bytes> = fragment_frame(2, 0, "T2", vec![2u8; 500].into(), 1053)
        .unwrap()
        .collect();
    for packet in fresh {
        state.router.route_train_packet("T2", packet).await;
    }
    assert_eq!(drain_queue(&c1).await.len(), 1);
}

/// S4: a train disconnect reaches every previously bound console as one
/// `disconnected` notification, and their bindings dissolve.
#[tokio::test]
async fn disconnect_cascade_notifies_consoles() {
    let state = test_state();
    let cancel = CancellationToken::new();
    let pump = spawn_event_pump(Arc::clone(&state), cancel.clone());

    ws_train(&state, "T1");
    let c1 = ws_console(&state, "C1");
    let c2 = ws_console(&state, "C2");
    state.registry.bind("C1", "T1").unwrap();
    state.registry.bind("C2", "T1").unwrap();

    // Let the pump flush the join/bind traffic, then drop it.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    drain_queue(&c1).await;
    drain_queue(&c2).await;

    state.registry.remove_train("T1", TransportKind::Ws);
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    for console in [&c1, &c2] {
        let packets = drain_queue(console).await;
        let disconnects: Vec<Notification> = packets
            .iter()
            .filter_map(|data| Packet::decode(data).ok())
            .filter(|packet| packet.kind == PacketType::Notification)
            .filter_map(|packet| packet.payload_json::<Notification>().ok())
            .filter(|n| n.event == TrainEvent::Disconnected)
            .collect();
        assert_eq!(disconnects.len(), 1);
        assert_eq!(disconnects[0].train_id, "T1");
    }
    assert!(state.registry.train_of("C1").is_none());
    assert!(state.registry.train_of("C2").is_none());

    cancel.cancel();
    pump.await.unwrap();
}

/// S6: a producer faster than the drain settles at the queue bound with a
/// monotonically growing drop counter.
#[tokio::test]
async fn video_backpressure_reaches_steady_state() {
    let state = test_state();
    ws_train(&state, "T1");
    let c1 = ws_console(&state, "C1");
    state.registry.bind("C1", "T1").unwrap();

    let bound = state.config.limits.video_queue;
    for i in 0..1000u32 {
        let packet: Vec<Bytes> = fragment_frame(i, 0, "T1", vec![0u8; 100].into(), 1053)
            .unwrap()
            .collect();
        state.router.route_train_packet("T1", packet[0].clone()).await;
    }

    assert_eq!(c1.queue().len(), bound);
    let dropped_midway = c1.queue().dropped_video();
    assert_eq!(dropped_midway, 1000 - bound as u64);

    // More production without draining: drops keep growing, length holds.
    for i in 1000..1100u32 {
        let packet: Vec<Bytes> = fragment_frame(i, 0, "T1", vec![0u8; 100].into(), 1053)
            .unwrap()
            .collect();
        state.router.route_train_packet("T1", packet[0].clone()).await;
    }
    assert_eq!(c1.queue().len(), bound);
    assert!(c1.queue().dropped_video() > dropped_midway);
}

/// Property 2: fragmentation round-trips across a grid of sizes and MTUs.
#[test]
fn fragmentation_round_trip_grid() {
    for &size in &[1usize, 53, 999, 1000, 1001, 4000, 20_000] {
        for &mtu in &[54usize, 100, 1053, 1500] {
            let frame: Bytes = (0..size).map(|i| (i % 251) as u8).collect::<Vec<_>>().into();
            let packets: Vec<Bytes> = fragment_frame(9, 42, "T1", frame.clone(), mtu)
                .unwrap()
                .collect();

            let expected = size.div_ceil(mtu - 53).max(1);
            assert_eq!(packets.len(), expected, "size={size} mtu={mtu}");

            let mut assembler = FrameAssembler::new();
            let mut assembled = None;
            for data in &packets {
                let (header, slice) = VideoHeader::parse(data).unwrap();
                assembled = assembler.push(&header, slice);
            }
            assert_eq!(assembled.unwrap().data, frame, "size={size} mtu={mtu}");
        }
    }
}

/// Property 4: the mutating registry operations are idempotent.
#[tokio::test]
async fn registry_operations_idempotent() {
    let state = test_state();
    ws_train(&state, "T1");
    ws_console(&state, "C1");

    state.registry.bind("C1", "T1").unwrap();
    state.registry.bind("C1", "T1").unwrap();
    assert_eq!(state.registry.subscribers_of("T1"), vec!["C1"]);

    state.registry.unbind("C1");
    state.registry.unbind("C1");
    assert!(state.registry.subscribers_of("T1").is_empty());

    state.registry.remove_train("T1", TransportKind::Ws);
    state.registry.remove_train("T1", TransportKind::Ws);
    assert!(state.registry.list_trains().is_empty());
}

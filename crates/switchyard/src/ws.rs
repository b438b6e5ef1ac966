//! Reliable bidirectional stream transport (WebSocket).
//!
//! Each endpoint connects at a path encoding its role and id. Per connection
//! the relay runs three cooperative tasks: the receiver (this handler), a
//! sender draining the endpoint's outbound queue, and a periodic keepalive.
//! All three cancel together on disconnect or I/O error, and the endpoint is
//! always removed from the registry on the way out.

use crate::endpoint::{Endpoint, EndpointRole, TransportKind};
use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use bytes::Bytes;
use futures::stream::StreamExt;
use futures::SinkExt;
use railproto::packet::peek_type;
use railproto::{Keepalive, Packet, PacketType};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ws/train/{train_id}", get(train_upgrade))
        .route("/ws/remote_control/{console_id}", get(console_upgrade))
}

async fn train_upgrade(
    ws: WebSocketUpgrade,
    Path(train_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, train_id, EndpointRole::Train, state))
}

async fn console_upgrade(
    ws: WebSocketUpgrade,
    Path(console_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, console_id, EndpointRole::Console, state))
}

async fn handle_connection(
    socket: WebSocket,
    id: String,
    role: EndpointRole,
    state: Arc<AppState>,
) {
    debug!(id, ?role, "websocket connection established");
    let endpoint = Endpoint::new(&id, role, TransportKind::Ws, &state.config.limits);

    match role {
        EndpointRole::Train => {
            state
                .registry
                .add_train(&id, TransportKind::Ws, Arc::clone(&endpoint))
        }
        EndpointRole::Console => {
            state
                .registry
                .add_console(&id, TransportKind::Ws, Arc::clone(&endpoint))
        }
    }

    let (mut sink, mut stream) = socket.split();

    // Sender: drains the bounded outbound queue in order.
    let sender_endpoint = Arc::clone(&endpoint);
    let sender = tokio::spawn(async move {
        let cancel = sender_endpoint.cancellation().clone();
        loop {
            let data = tokio::select! {
                _ = cancel.cancelled() => break,
                data = sender_endpoint.queue().pop() => match data {
                    Some(data) => data,
                    None => break,
                },
            };
            if sink.send(Message::Binary(data)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Heartbeat: a keepalive packet every interval, through the same queue
    // so it cannot overtake queued control traffic.
    let heartbeat_endpoint = Arc::clone(&endpoint);
    let keepalive_secs = state.config.limits.keepalive_secs;
    let heartbeat = tokio::spawn(async move {
        let cancel = heartbeat_endpoint.cancellation().clone();
        let mut interval = tokio::time::interval(Duration::from_secs(keepalive_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        interval.tick().await; // immediate first tick
        let mut sequence = 0u64;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            sequence += 1;
            let keepalive = Keepalive::new(sequence, now_ms());
            let Ok(packet) = Packet::json(PacketType::Keepalive, &keepalive) else {
                continue;
            };
            heartbeat_endpoint.queue().push_control(packet.encode()).await;
        }
    });

    // Receiver: this task. Every inbound packet refreshes the idle clock.
    while let Some(message) = stream.next().await {
        let data: Bytes = match message {
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        endpoint.touch();
        dispatch(&state, &endpoint, &id, role, data).await;
    }

    debug!(id, ?role, "websocket connection closed");
    shutdown(&state, &endpoint, sender, heartbeat).await;
}

async fn dispatch(
    state: &AppState,
    endpoint: &Arc<Endpoint>,
    id: &str,
    role: EndpointRole,
    data: Bytes,
) {
    match peek_type(&data) {
        Ok(PacketType::Keepalive) => match Packet::decode(&data)
            .and_then(|packet| packet.payload_json::<Keepalive>())
        {
            Ok(keepalive) => debug!(id, sequence = keepalive.sequence, "keepalive"),
            Err(_) => state.metrics.incr_codec_errors(),
        },
        Ok(PacketType::Rtt) => {
            // Relay-level ping: echo straight back to the sender.
            endpoint.queue().push_control(data).await;
        }
        Ok(_) => match role {
            EndpointRole::Train => state.router.route_train_packet(id, data).await,
            EndpointRole::Console => state.router.route_console_packet(id, data).await,
        },
        Err(railproto::ProtoError::UnknownType(tag)) => {
            warn!(id, tag, "unknown packet type");
            state.metrics.incr_unknown_type();
        }
        Err(_) => state.metrics.incr_codec_errors(),
    }
}

/// Cooperative teardown: cancel the sibling tasks, give in-flight sends a
/// bounded grace period, then drop the registry entry.
async fn shutdown(
    state: &AppState,
    endpoint: &Arc<Endpoint>,
    sender: tokio::task::JoinHandle<()>,
    heartbeat: tokio::task::JoinHandle<()>,
) {
    endpoint.close("connection closed");
    let _ = tokio::time::timeout(Duration::from_secs(1), sender).await;
    heartbeat.abort();
    state.registry.remove_endpoint(endpoint);
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

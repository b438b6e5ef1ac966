//! WebRTC signaling passthrough.
//!
//! Pure relay of SDP offers/answers and ICE candidates between a train and
//! the consoles interested in it, keyed by train id. No session state is
//! inspected beyond remembering the train's latest offer so late-joining
//! consoles can fetch it over HTTP. Media never touches this path.

use crate::state::AppState;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Default)]
struct Room {
    train: Option<mpsc::UnboundedSender<String>>,
    consoles: HashMap<u64, mpsc::UnboundedSender<String>>,
    next_peer: u64,
    last_offer: Option<Value>,
}

/// In-memory signaling rooms, one per train id.
pub struct SignalingHub {
    rooms: DashMap<String, Room>,
}

impl SignalingHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rooms: DashMap::new(),
        })
    }

    fn register_train(&self, train_id: &str) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.rooms.entry(train_id.to_string()).or_default().train = Some(tx);
        info!(train_id, "train registered for signaling");
        rx
    }

    fn unregister_train(&self, train_id: &str) {
        let mut remove = false;
        if let Some(mut room) = self.rooms.get_mut(train_id) {
            room.train = None;
            room.last_offer = None;
            remove = room.consoles.is_empty();
        }
        if remove {
            self.rooms.remove(train_id);
        }
        info!(train_id, "train unregistered from signaling");
    }

    fn register_console(&self, train_id: &str) -> (u64, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut room = self.rooms.entry(train_id.to_string()).or_default();
        let peer = room.next_peer;
        room.next_peer += 1;
        room.consoles.insert(peer, tx);
        info!(train_id, peer, "console registered for signaling");
        (peer, rx)
    }

    fn unregister_console(&self, train_id: &str, peer: u64) {
        let mut remove = false;
        if let Some(mut room) = self.rooms.get_mut(train_id) {
            room.consoles.remove(&peer);
            remove = room.consoles.is_empty() && room.train.is_none();
        }
        if remove {
            self.rooms.remove(train_id);
        }
    }

    /// Message from the train: remember offers, forward verbatim to every
    /// console peer.
    fn from_train(&self, train_id: &str, text: &str) {
        let Some(mut room) = self.rooms.get_mut(train_id) else {
            warn!(train_id, "signaling message for unknown room");
            return;
        };
        if let Ok(value) = serde_json::from_str::<Value>(text) {
            if value.get("type").and_then(Value::as_str) == Some("offer") {
                room.last_offer = Some(value);
            }
        }
        room.consoles
            .retain(|_, console| console.send(text.to_string()).is_ok());
    }

    /// Message from a console: forward verbatim to the train peer.
    fn from_console(&self, train_id: &str, text: &str) {
        let Some(room) = self.rooms.get(train_id) else {
            warn!(train_id, "signaling message for unknown room");
            return;
        };
        match &room.train {
            Some(train) => {
                if train.send(text.to_string()).is_err() {
                    warn!(train_id, "train signaling channel closed");
                }
            }
            None => warn!(train_id, "no train registered for signaling"),
        }
    }

    /// Forward an HTTP-side console message toward the train peer.
    pub fn forward_to_train(&self, train_id: &str, message: &Value) -> bool {
        match self.rooms.get(train_id).and_then(|room| room.train.clone()) {
            Some(train) => train.send(message.to_string()).is_ok(),
            None => false,
        }
    }

    /// The train's most recent SDP offer, if it announced one.
    pub fn last_offer(&self, train_id: &str) -> Option<Value> {
        self.rooms.get(train_id)?.last_offer.clone()
    }

    /// Peer counts per train for the status endpoint.
    pub fn status(&self) -> Value {
        let mut trains = serde_json::Map::new();
        for entry in self.rooms.iter() {
            trains.insert(
                entry.key().clone(),
                json!({
                    "train_connected": entry.value().train.is_some(),
                    "console_count": entry.value().consoles.len(),
                }),
            );
        }
        Value::Object(trains)
    }
}

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/webrtc/train/{train_id}", get(train_upgrade))
        .route("/webrtc/remote_control/{train_id}", get(console_upgrade))
        .route("/webrtc/status", get(status))
}

async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(state.signaling.status())
}

async fn train_upgrade(
    ws: WebSocketUpgrade,
    Path(train_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| train_session(socket, train_id, state))
}

async fn console_upgrade(
    ws: WebSocketUpgrade,
    Path(train_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| console_session(socket, train_id, state))
}

async fn train_session(socket: WebSocket, train_id: String, state: Arc<AppState>) {
    let mut outbound = state.signaling.register_train(&train_id);
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            forwarded = outbound.recv() => match forwarded {
                Some(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => state.signaling.from_train(&train_id, &text),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    debug!(train_id, "train signaling session ended");
    state.signaling.unregister_train(&train_id);
}

async fn console_session(socket: WebSocket, train_id: String, state: Arc<AppState>) {
    let (peer, mut outbound) = state.signaling.register_console(&train_id);
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            forwarded = outbound.recv() => match forwarded {
                Some(text) => {
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => state.signaling.from_console(&train_id, &text),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    debug!(train_id, peer, "console signaling session ended");
    state.signaling.unregister_console(&train_id, peer);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offer_is_remembered_and_forwarded() {
        let hub = SignalingHub::new();
        let _train_rx = hub.register_train("T1");
        let (_, mut console_rx) = hub.register_console("T1");

        hub.from_train("T1", r#"{"type":"offer","sdp":"v=0"}"#);

        let forwarded = console_rx.try_recv().unwrap();
        assert!(forwarded.contains("offer"));
        assert_eq!(hub.last_offer("T1").unwrap()["sdp"], "v=0");
    }

    #[test]
    fn console_messages_reach_train() {
        let hub = SignalingHub::new();
        let mut train_rx = hub.register_train("T1");
        let (_, _console_rx) = hub.register_console("T1");

        hub.from_console("T1", r#"{"type":"answer","sdp":"v=0"}"#);
        assert!(train_rx.try_recv().unwrap().contains("answer"));
    }

    #[test]
    fn ice_fans_out_to_every_console() {
        let hub = SignalingHub::new();
        let _train_rx = hub.register_train("T1");
        let (_, mut rx_a) = hub.register_console("T1");
        let (_, mut rx_b) = hub.register_console("T1");

        hub.from_train("T1", r#"{"type":"ice","candidate":{}}"#);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn empty_room_is_dropped() {
        let hub = SignalingHub::new();
        let (peer, _rx) = hub.register_console("T1");
        hub.unregister_console("T1", peer);
        assert!(hub.rooms.is_empty());
    }

    #[test]
    fn status_counts_peers() {
        let hub = SignalingHub::new();
        let _train_rx = hub.register_train("T1");
        let (_, _rx) = hub.register_console("T1");

        let status = hub.status();
        assert_eq!(status["T1"]["train_connected"], true);
        assert_eq!(status["T1"]["console_count"], 1);
    }
}

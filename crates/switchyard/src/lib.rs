//! switchyard - the central relay of the train teleoperation fabric.
//!
//! Trains publish H.264 video and telemetry; operator consoles subscribe to
//! exactly one train and issue driving commands. The relay authenticates
//! endpoints by identification string, maintains the console->train binding,
//! fans video and telemetry out, and point-routes commands in - across three
//! coexisting transports (WebSocket, QUIC with an unreliable datagram lane,
//! and an MQTT telemetry bus) plus a WebRTC signaling passthrough.

pub mod endpoint;
pub mod http;
pub mod liveness;
pub mod metrics;
pub mod mqtt;
pub mod quic;
pub mod registry;
pub mod router;
pub mod signaling;
pub mod state;
pub mod webtransport;
pub mod ws;

use axum::Router;
use state::AppState;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// The complete HTTP application: REST control surface, WebSocket transport
/// and WebRTC signaling, with CORS and request tracing.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(http::router())
        .merge(ws::router())
        .merge(signaling::router())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

//! Relay-facing transports for the train agent.
//!
//! The agent keeps one connection per enabled transport and selects which
//! one carries video at any moment. Control traffic (commands in, telemetry
//! and RTT probes out) flows on every connected transport's reliable lane;
//! the MQTT worker is a publish/subscribe sidecar that never carries media.

pub mod mqtt;
pub mod quic;
pub mod ws;

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use railproto::Protocol;

/// Which connection an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportId {
    Ws,
    Quic,
    Mqtt,
}

impl TransportId {
    /// The wire protocol name a SWITCH_PROTOCOL command selects.
    pub fn for_protocol(protocol: Protocol) -> Option<Self> {
        match protocol {
            Protocol::Websocket => Some(TransportId::Ws),
            Protocol::Quic => Some(TransportId::Quic),
            // The WebRTC media plane is negotiated peer-to-peer via the
            // relay's signaling passthrough; it is not a relay transport.
            Protocol::Webrtc => None,
        }
    }
}

/// Events every transport feeds into the agent loop.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// The transport finished its identification exchange.
    Identified { transport: TransportId },
    /// A packet arrived (tag byte included).
    Packet { transport: TransportId, data: Bytes },
    /// The connection is gone.
    Disconnected { transport: TransportId },
}

/// A connected media-capable transport.
#[async_trait]
pub trait Transport: Send + Sync {
    fn id(&self) -> TransportId;

    /// Reliable ordered send (telemetry, RTT probes, keepalives).
    async fn send_control(&self, data: Bytes) -> Result<()>;

    /// Video packet send; unreliable where the transport supports it.
    async fn send_video(&self, data: Bytes) -> Result<()>;
}

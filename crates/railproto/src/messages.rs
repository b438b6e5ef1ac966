//! JSON payloads for keepalive, notification, map-ack and RTT packets.

use serde::{Deserialize, Serialize};

/// Periodic liveness probe (PacketType::Keepalive). The sequence is
/// monotonically increasing per connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Keepalive {
    #[serde(rename = "type")]
    pub kind: String,
    pub sequence: u64,
    pub timestamp: i64,
}

impl Keepalive {
    pub fn new(sequence: u64, timestamp: i64) -> Self {
        Self {
            kind: "keepalive".into(),
            sequence,
            timestamp,
        }
    }
}

/// Fleet event broadcast to every console (PacketType::Notification).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrainEvent {
    Connected,
    Disconnected,
}

/// Notifications preserve unknown fields so newer relays can attach data
/// without breaking older consoles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: String,
    pub train_id: String,
    pub event: TrainEvent,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Notification {
    pub fn new(train_id: impl Into<String>, event: TrainEvent) -> Self {
        Self {
            kind: "notification".into(),
            train_id: train_id.into(),
            event,
            extra: serde_json::Map::new(),
        }
    }
}

/// Sent by a console to a train after binding completes
/// (PacketType::MapAck); the train answers with the RTT handshake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapAck {
    pub remote_control_id: String,
    pub train_id: String,
    pub timestamp: i64,
}

/// One RTT handshake sample (PacketType::RttTrain).
///
/// The train emits the probe with `train_timestamp` set and the console
/// fields absent; the console echoes it back with its identity and clock
/// filled in. Five echoed samples average into the per-console clock offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RttProbe {
    pub train_id: String,
    pub sample: u8,
    pub train_timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_control_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remote_control_timestamp: Option<i64>,
}

impl RttProbe {
    pub fn new(train_id: impl Into<String>, sample: u8, train_timestamp: i64) -> Self {
        Self {
            train_id: train_id.into(),
            sample,
            train_timestamp,
            remote_control_id: None,
            remote_control_timestamp: None,
        }
    }

    /// Console-side echo: same probe, console identity and clock attached.
    pub fn echoed(
        mut self,
        remote_control_id: impl Into<String>,
        remote_control_timestamp: i64,
    ) -> Self {
        self.remote_control_id = Some(remote_control_id.into());
        self.remote_control_timestamp = Some(remote_control_timestamp);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn notification_preserves_unknown_fields() {
        let json = r#"{"type":"notification","train_id":"T1","event":"connected","fleet_size":3}"#;
        let parsed: Notification = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.event, TrainEvent::Connected);
        assert_eq!(parsed.extra["fleet_size"], 3);

        let out = serde_json::to_value(&parsed).unwrap();
        assert_eq!(out["fleet_size"], 3);
    }

    #[test]
    fn rtt_probe_echo() {
        let probe = RttProbe::new("T1", 2, 1000);
        let json = serde_json::to_value(&probe).unwrap();
        assert!(json.get("remote_control_timestamp").is_none());
        assert!(json.get("remote_control_id").is_none());

        let echoed = probe.echoed("C1", 1600);
        assert_eq!(echoed.remote_control_id.as_deref(), Some("C1"));
        assert_eq!(echoed.remote_control_timestamp, Some(1600));
        assert_eq!(echoed.train_timestamp, 1000);
    }

    #[test]
    fn keepalive_wire_shape() {
        let json = serde_json::to_value(Keepalive::new(3, 99)).unwrap();
        assert_eq!(json["type"], "keepalive");
        assert_eq!(json["sequence"], 3);
    }
}

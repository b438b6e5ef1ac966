//! Telemetry records emitted by trains (PacketType::Telemetry).

use serde::{Deserialize, Serialize};

/// GPS position of the train.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Gps {
    pub lat: f64,
    pub lon: f64,
}

/// One telemetry sample, produced once per tick by the train agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryReport {
    pub train_id: String,
    pub status: String,
    pub direction: i8,
    pub speed: f64,
    pub max_speed: f64,
    pub brake_status: String,
    pub location: String,
    pub next_station: String,
    pub gps: Gps,
    pub temperature: f64,
    pub engine_temperature: f64,
    pub battery_level: f64,
    pub fuel_level: f64,
    pub network_signal_strength: u8,
    /// Milliseconds since the Unix epoch at sample time.
    pub timestamp: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_keeps_field_names() {
        let report = TelemetryReport {
            train_id: "T1".into(),
            status: "running".into(),
            direction: 1,
            speed: 42.0,
            max_speed: 60.0,
            brake_status: "released".into(),
            location: "Malente".into(),
            next_station: "Plön".into(),
            gps: Gps { lat: 54.17, lon: 10.56 },
            temperature: 19.0,
            engine_temperature: 78.0,
            battery_level: 91.5,
            fuel_level: 88.0,
            network_signal_strength: 73,
            timestamp: 1_700_000_000_000,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["train_id"], "T1");
        assert_eq!(json["gps"]["lat"], 54.17);
        assert_eq!(json["network_signal_strength"], 73);

        let back: TelemetryReport = serde_json::from_value(json).unwrap();
        assert_eq!(back.speed, 42.0);
        assert_eq!(back.next_station, "Plön");
    }
}

//! Driving commands issued by operator consoles (PacketType::Command).

use serde::{Deserialize, Serialize};

/// Instruction carried by a command packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Instruction {
    ChangeTargetSpeed,
    StopSendingData,
    StartSendingData,
    PowerOn,
    PowerOff,
    ChangeDirection,
    CalculateNetworkSpeed,
    ChangeVideoQuality,
    SwitchProtocol,
}

/// Travel direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    Forward,
    Backward,
}

/// Video quality preset. Quality changes reinitialise the encoder; there is
/// no in-place rate change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoQuality {
    Low,
    Medium,
    High,
}

impl VideoQuality {
    /// Target bitrate in bits per second.
    pub fn bitrate(self) -> u32 {
        match self {
            VideoQuality::Low => 1_000_000,
            VideoQuality::Medium => 2_000_000,
            VideoQuality::High => 5_000_000,
        }
    }
}

/// Video transport selected by SWITCH_PROTOCOL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Protocol {
    Websocket,
    Quic,
    Webrtc,
}

/// A command packet's JSON payload.
///
/// `remote_control_timestamp` is the console's wall clock in milliseconds;
/// together with the clock-sync offset it lets the train attribute one-way
/// command latency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveCommand {
    pub instruction: Instruction,
    pub remote_control_id: String,
    pub command_id: String,
    pub remote_control_timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<VideoQuality>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
}

impl DriveCommand {
    /// A bare command with no instruction-specific fields.
    pub fn simple(
        instruction: Instruction,
        remote_control_id: impl Into<String>,
        command_id: impl Into<String>,
        remote_control_timestamp: i64,
    ) -> Self {
        Self {
            instruction,
            remote_control_id: remote_control_id.into(),
            command_id: command_id.into(),
            remote_control_timestamp,
            target_speed: None,
            direction: None,
            quality: None,
            protocol: None,
        }
    }
}

/// Relay-originated stream gating instruction, sent toward a train when its
/// subscriber set transitions between empty and non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayCommand {
    #[serde(rename = "type")]
    pub kind: String,
    pub instruction: Instruction,
}

impl RelayCommand {
    pub fn start_sending() -> Self {
        Self {
            kind: "command".into(),
            instruction: Instruction::StartSendingData,
        }
    }

    pub fn stop_sending() -> Self {
        Self {
            kind: "command".into(),
            instruction: Instruction::StopSendingData,
        }
    }
}

/// Either shape a train may find in a command packet: a full console command
/// or a bare relay gating instruction.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum IncomingCommand {
    Drive(DriveCommand),
    Relay(RelayCommand),
}

impl IncomingCommand {
    pub fn instruction(&self) -> Instruction {
        match self {
            IncomingCommand::Drive(cmd) => cmd.instruction,
            IncomingCommand::Relay(cmd) => cmd.instruction,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn wire_names_are_stable() {
        let cmd = DriveCommand {
            instruction: Instruction::ChangeTargetSpeed,
            remote_control_id: "C1".into(),
            command_id: "x".into(),
            remote_control_timestamp: 1000,
            target_speed: Some(12.0),
            direction: None,
            quality: None,
            protocol: None,
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["instruction"], "CHANGE_TARGET_SPEED");
        assert_eq!(json["remote_control_id"], "C1");
        assert_eq!(json["remote_control_timestamp"], 1000);
        assert_eq!(json["target_speed"], 12.0);
        assert!(json.get("direction").is_none());
    }

    #[test]
    fn instruction_specific_fields_parse() {
        let cmd: DriveCommand = serde_json::from_str(
            r#"{"instruction":"CHANGE_DIRECTION","remote_control_id":"C1",
                "command_id":"y","remote_control_timestamp":5,"direction":"BACKWARD"}"#,
        )
        .unwrap();
        assert_eq!(cmd.direction, Some(Direction::Backward));

        let cmd: DriveCommand = serde_json::from_str(
            r#"{"instruction":"CHANGE_VIDEO_QUALITY","remote_control_id":"C1",
                "command_id":"z","remote_control_timestamp":5,"quality":"high"}"#,
        )
        .unwrap();
        assert_eq!(cmd.quality, Some(VideoQuality::High));

        let cmd: DriveCommand = serde_json::from_str(
            r#"{"instruction":"SWITCH_PROTOCOL","remote_control_id":"C1",
                "command_id":"w","remote_control_timestamp":5,"protocol":"WEBSOCKET"}"#,
        )
        .unwrap();
        assert_eq!(cmd.protocol, Some(Protocol::Websocket));
    }

    #[test]
    fn missing_required_field_rejected() {
        let result: Result<DriveCommand, _> =
            serde_json::from_str(r#"{"instruction":"POWER_ON"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn relay_command_wire_shape() {
        let json = serde_json::to_value(RelayCommand::start_sending()).unwrap();
        assert_eq!(json["type"], "command");
        assert_eq!(json["instruction"], "START_SENDING_DATA");
    }

    #[test]
    fn incoming_command_accepts_both_shapes() {
        let relay: IncomingCommand =
            serde_json::from_str(r#"{"type":"command","instruction":"STOP_SENDING_DATA"}"#)
                .unwrap();
        assert_eq!(relay.instruction(), Instruction::StopSendingData);
        assert!(matches!(relay, IncomingCommand::Relay(_)));

        let drive: IncomingCommand = serde_json::from_str(
            r#"{"instruction":"POWER_ON","remote_control_id":"C1",
                "command_id":"k","remote_control_timestamp":7}"#,
        )
        .unwrap();
        assert!(matches!(drive, IncomingCommand::Drive(_)));
    }

    #[test]
    fn quality_bitrates() {
        assert_eq!(VideoQuality::Low.bitrate(), 1_000_000);
        assert_eq!(VideoQuality::Medium.bitrate(), 2_000_000);
        assert_eq!(VideoQuality::High.bitrate(), 5_000_000);
    }
}

//! railproto - wire protocol for the switchyard teleoperation fabric
//!
//! Every transport (WebSocket, QUIC, MQTT) carries the same framed unit: a
//! single type byte followed by a type-specific payload. Video payloads are
//! further framed for fragmentation across MTU-bounded packets; everything
//! else is a UTF-8 JSON document.
//!
//! This crate is pure data: no I/O, no async. The relay and the train agent
//! both link it.

pub mod assembler;
pub mod command;
pub mod ident;
pub mod messages;
pub mod packet;
pub mod telemetry;
pub mod video;

pub use assembler::FrameAssembler;
pub use command::{
    Direction, DriveCommand, IncomingCommand, Instruction, Protocol, RelayCommand, VideoQuality,
};
pub use ident::{Identify, MapConnection, Role};
pub use messages::{Keepalive, MapAck, Notification, RttProbe, TrainEvent};
pub use packet::{Packet, PacketType, ProtoError};
pub use telemetry::{Gps, TelemetryReport};
pub use video::{fragment_frame, FragmentIter, VideoHeader, MIN_MTU, TRAIN_ID_LEN, VIDEO_HEADER_LEN};

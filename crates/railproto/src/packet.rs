//! Framed packet: one type byte, then a type-specific payload.
//!
//! ## Wire Format
//!
//! ```text
//! Byte 0:    PacketType (u8)
//! Byte 1..:  Payload
//!            - video:      binary, see `video` module
//!            - command / telemetry / keepalive / notification /
//!              map_ack / rtt / rtt_train: UTF-8 JSON document
//!            - speed-test types: opaque bytes
//! ```
//!
//! All multi-byte integers anywhere in this protocol are big-endian.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};

/// Packet type tags. The numbering is shared with every client on the wire;
/// do not renumber.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Video = 13,
    Audio = 14,
    Control = 15,
    Command = 16,
    Telemetry = 17,
    Imu = 18,
    Lidar = 19,
    Keepalive = 20,
    Notification = 21,
    DownloadStart = 22,
    Downloading = 23,
    DownloadEnd = 24,
    UploadStart = 25,
    Uploading = 26,
    UploadEnd = 27,
    Rtt = 28,
    MapAck = 29,
    RttTrain = 30,
}

impl PacketType {
    /// Parse a tag byte into a PacketType.
    pub fn from_u8(value: u8) -> Result<Self, ProtoError> {
        match value {
            13 => Ok(PacketType::Video),
            14 => Ok(PacketType::Audio),
            15 => Ok(PacketType::Control),
            16 => Ok(PacketType::Command),
            17 => Ok(PacketType::Telemetry),
            18 => Ok(PacketType::Imu),
            19 => Ok(PacketType::Lidar),
            20 => Ok(PacketType::Keepalive),
            21 => Ok(PacketType::Notification),
            22 => Ok(PacketType::DownloadStart),
            23 => Ok(PacketType::Downloading),
            24 => Ok(PacketType::DownloadEnd),
            25 => Ok(PacketType::UploadStart),
            26 => Ok(PacketType::Uploading),
            27 => Ok(PacketType::UploadEnd),
            28 => Ok(PacketType::Rtt),
            29 => Ok(PacketType::MapAck),
            30 => Ok(PacketType::RttTrain),
            other => Err(ProtoError::UnknownType(other)),
        }
    }

    /// Convert to the tag byte.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Whether the payload of this type is a JSON document.
    pub fn is_json(self) -> bool {
        matches!(
            self,
            PacketType::Command
                | PacketType::Telemetry
                | PacketType::Keepalive
                | PacketType::Notification
                | PacketType::MapAck
                | PacketType::Rtt
                | PacketType::RttTrain
        )
    }
}

/// A parsed packet: tag plus payload, payload uninterpreted.
#[derive(Debug, Clone)]
pub struct Packet {
    pub kind: PacketType,
    pub payload: Bytes,
}

/// Errors during packet encoding/decoding.
#[derive(Debug, thiserror::Error)]
pub enum ProtoError {
    #[error("empty packet")]
    Empty,
    #[error("unknown packet type: {0}")]
    UnknownType(u8),
    #[error("truncated video header: expected {expected} bytes, got {actual}")]
    TruncatedHeader { expected: usize, actual: usize },
    #[error("invalid JSON payload for {kind:?}: {source}")]
    BadJson {
        kind: PacketType,
        #[source]
        source: serde_json::Error,
    },
    #[error("train id not valid UTF-8")]
    InvalidTrainId,
    #[error("train id longer than {max} bytes: {actual}")]
    TrainIdTooLong { max: usize, actual: usize },
    #[error("mtu {0} below minimum {min}", min = crate::video::MIN_MTU)]
    MtuTooSmall(usize),
    #[error("video packet index {index} out of range 1..={count}")]
    PacketIndexOutOfRange { index: u16, count: u16 },
    #[error("malformed identification line")]
    BadIdentification,
    #[error("malformed control line: {0}")]
    BadControlLine(String),
}

impl Packet {
    /// Create a packet with a raw payload.
    pub fn new(kind: PacketType, payload: Bytes) -> Self {
        Self { kind, payload }
    }

    /// Create a packet by serialising a JSON record.
    pub fn json<T: Serialize>(kind: PacketType, record: &T) -> Result<Self, ProtoError> {
        let payload = serde_json::to_vec(record)
            .map_err(|source| ProtoError::BadJson { kind, source })?;
        Ok(Self {
            kind,
            payload: Bytes::from(payload),
        })
    }

    /// Parse the leading tag byte. The remainder is kept opaque.
    pub fn decode(data: &[u8]) -> Result<Self, ProtoError> {
        let (&tag, payload) = data.split_first().ok_or(ProtoError::Empty)?;
        Ok(Self {
            kind: PacketType::from_u8(tag)?,
            payload: Bytes::copy_from_slice(payload),
        })
    }

    /// Serialise to wire bytes: tag + payload.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + self.payload.len());
        buf.put_u8(self.kind.to_u8());
        buf.extend_from_slice(&self.payload);
        buf.freeze()
    }

    /// Interpret the payload as a typed JSON record.
    pub fn payload_json<T: DeserializeOwned>(&self) -> Result<T, ProtoError> {
        serde_json::from_slice(&self.payload).map_err(|source| ProtoError::BadJson {
            kind: self.kind,
            source,
        })
    }
}

/// Peek at the tag byte without copying the payload.
pub fn peek_type(data: &[u8]) -> Result<PacketType, ProtoError> {
    let &tag = data.first().ok_or(ProtoError::Empty)?;
    PacketType::from_u8(tag)
}

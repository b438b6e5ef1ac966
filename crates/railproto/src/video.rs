//! Video packet framing and frame fragmentation.
//!
//! An encoded video frame is split into an ordered burst of MTU-bounded
//! packets, each carrying enough header to be routed and reassembled on its
//! own. Header layout (53 bytes, all integers big-endian):
//!
//! ```text
//! Byte 0:      PacketType::Video (13)
//! Bytes 1-4:   frame_id (u32)
//! Bytes 5-6:   packet_count (u16)
//! Bytes 7-8:   packet_index (u16, 1-based)
//! Bytes 9-44:  train_id (36 bytes ASCII, space-padded)
//! Bytes 45-52: capture_timestamp_ms (u64)
//! Bytes 53..:  frame slice (<= mtu - 53)
//! ```
//!
//! Concatenating slices in ascending `packet_index` order reconstructs the
//! frame. The key frame carries its SPS/PPS prepended by the producer, so a
//! receiver can start decoding from any complete key frame.

use crate::packet::{PacketType, ProtoError};
use bytes::{BufMut, Bytes, BytesMut};

/// Fixed on-wire size of the video header, including the type byte.
pub const VIDEO_HEADER_LEN: usize = 53;

/// On-wire width of the train id field.
pub const TRAIN_ID_LEN: usize = 36;

/// Smallest MTU that leaves at least one payload byte per packet.
pub const MIN_MTU: usize = VIDEO_HEADER_LEN + 1;

/// Parsed video packet header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoHeader {
    pub frame_id: u32,
    pub packet_count: u16,
    /// 1-based index within the frame's burst.
    pub packet_index: u16,
    pub train_id: String,
    pub capture_timestamp_ms: u64,
}

impl VideoHeader {
    /// Parse the header of a full video packet (type byte included).
    pub fn parse(data: &[u8]) -> Result<(Self, Bytes), ProtoError> {
        if data.len() < VIDEO_HEADER_LEN {
            return Err(ProtoError::TruncatedHeader {
                expected: VIDEO_HEADER_LEN,
                actual: data.len(),
            });
        }
        if data[0] != PacketType::Video.to_u8() {
            return Err(ProtoError::UnknownType(data[0]));
        }

        let frame_id = u32::from_be_bytes([data[1], data[2], data[3], data[4]]);
        let packet_count = u16::from_be_bytes([data[5], data[6]]);
        let packet_index = u16::from_be_bytes([data[7], data[8]]);
        let train_id = std::str::from_utf8(&data[9..9 + TRAIN_ID_LEN])
            .map_err(|_| ProtoError::InvalidTrainId)?
            .trim_end()
            .to_string();
        let capture_timestamp_ms = u64::from_be_bytes([
            data[45], data[46], data[47], data[48], data[49], data[50], data[51], data[52],
        ]);

        if packet_index == 0 || packet_index > packet_count {
            return Err(ProtoError::PacketIndexOutOfRange {
                index: packet_index,
                count: packet_count,
            });
        }

        Ok((
            Self {
                frame_id,
                packet_count,
                packet_index,
                train_id,
                capture_timestamp_ms,
            },
            Bytes::copy_from_slice(&data[VIDEO_HEADER_LEN..]),
        ))
    }
}

/// Pad a train id to the fixed on-wire width.
fn pad_train_id(train_id: &str) -> Result<[u8; TRAIN_ID_LEN], ProtoError> {
    let raw = train_id.as_bytes();
    if raw.len() > TRAIN_ID_LEN {
        return Err(ProtoError::TrainIdTooLong {
            max: TRAIN_ID_LEN,
            actual: raw.len(),
        });
    }
    let mut padded = [b' '; TRAIN_ID_LEN];
    padded[..raw.len()].copy_from_slice(raw);
    Ok(padded)
}

/// Build one complete video packet (header + slice).
pub fn encode_video(
    frame_id: u32,
    capture_timestamp_ms: u64,
    train_id: &str,
    slice: &[u8],
    packet_index: u16,
    packet_count: u16,
) -> Result<Bytes, ProtoError> {
    if packet_index == 0 || packet_index > packet_count {
        return Err(ProtoError::PacketIndexOutOfRange {
            index: packet_index,
            count: packet_count,
        });
    }
    let padded = pad_train_id(train_id)?;

    let mut buf = BytesMut::with_capacity(VIDEO_HEADER_LEN + slice.len());
    buf.put_u8(PacketType::Video.to_u8());
    buf.put_u32(frame_id);
    buf.put_u16(packet_count);
    buf.put_u16(packet_index);
    buf.put_slice(&padded);
    buf.put_u64(capture_timestamp_ms);
    buf.put_slice(slice);
    Ok(buf.freeze())
}

/// Lazy fragmenter: yields the packets of one frame in index order.
pub struct FragmentIter {
    frame_id: u32,
    capture_timestamp_ms: u64,
    train_id: [u8; TRAIN_ID_LEN],
    frame: Bytes,
    slice_len: usize,
    packet_count: u16,
    next_index: u16,
}

impl FragmentIter {
    pub fn packet_count(&self) -> u16 {
        self.packet_count
    }
}

impl Iterator for FragmentIter {
    type Item = Bytes;

    fn next(&mut self) -> Option<Bytes> {
        if self.next_index > self.packet_count {
            return None;
        }
        let start = (self.next_index as usize - 1) * self.slice_len;
        let end = (start + self.slice_len).min(self.frame.len());
        let slice = self.frame.slice(start..end);

        let mut buf = BytesMut::with_capacity(VIDEO_HEADER_LEN + slice.len());
        buf.put_u8(PacketType::Video.to_u8());
        buf.put_u32(self.frame_id);
        buf.put_u16(self.packet_count);
        buf.put_u16(self.next_index);
        buf.put_slice(&self.train_id);
        buf.put_u64(self.capture_timestamp_ms);
        buf.put_slice(&slice);

        self.next_index += 1;
        Some(buf.freeze())
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.packet_count + 1).saturating_sub(self.next_index) as usize;
        (remaining, Some(remaining))
    }
}

/// Fragment an encoded frame into `ceil(len / (mtu - 53))` packets.
///
/// Every packet except possibly the last carries a full-length slice. An
/// empty frame still yields one packet so the receiver observes the frame id.
pub fn fragment_frame(
    frame_id: u32,
    capture_timestamp_ms: u64,
    train_id: &str,
    frame: Bytes,
    mtu: usize,
) -> Result<FragmentIter, ProtoError> {
    if mtu < MIN_MTU {
        return Err(ProtoError::MtuTooSmall(mtu));
    }
    let padded = pad_train_id(train_id)?;

    let slice_len = mtu - VIDEO_HEADER_LEN;
    let packet_count = frame.len().div_ceil(slice_len).max(1) as u16;

    Ok(FragmentIter {
        frame_id,
        capture_timestamp_ms,
        train_id: padded,
        frame,
        slice_len,
        packet_count,
        next_index: 1,
    })
}

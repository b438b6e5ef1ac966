//! Frame reassembly from out-of-order, possibly lossy packet bursts.
//!
//! Reassembly is a receiver-side concern: the relay fans packets out at
//! packet granularity and never reassembles centrally. A console (or a test
//! harness) feeds every video packet of one train into one assembler.

use crate::video::VideoHeader;
use bytes::{Bytes, BytesMut};

/// Reassembles one frame at a time. Arrival of a newer `frame_id` discards
/// any incomplete frame in progress; older frame ids are ignored.
#[derive(Debug, Default)]
pub struct FrameAssembler {
    current_frame_id: Option<u32>,
    expected: u16,
    received: u16,
    slices: Vec<Option<Bytes>>,
    discarded_frames: u64,
}

/// A fully reassembled frame.
#[derive(Debug, Clone)]
pub struct AssembledFrame {
    pub frame_id: u32,
    pub capture_timestamp_ms: u64,
    pub data: Bytes,
}

impl FrameAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frames dropped incomplete because a newer frame superseded them.
    pub fn discarded_frames(&self) -> u64 {
        self.discarded_frames
    }

    /// Feed one video packet. Returns the complete frame once every slice
    /// of the current frame has arrived.
    pub fn push(&mut self, header: &VideoHeader, slice: Bytes) -> Option<AssembledFrame> {
        match self.current_frame_id {
            Some(current) if header.frame_id < current => return None,
            Some(current) if header.frame_id > current => {
                if self.received > 0 && self.received < self.expected {
                    self.discarded_frames += 1;
                }
                self.start_frame(header);
            }
            None => self.start_frame(header),
            _ => {}
        }

        // A burst with an inconsistent packet_count is a producer bug; trust
        // the first packet seen for this frame.
        let idx = header.packet_index as usize - 1;
        if idx >= self.slices.len() {
            return None;
        }
        if self.slices[idx].is_none() {
            self.slices[idx] = Some(slice);
            self.received += 1;
        }

        if self.received == self.expected {
            let mut data = BytesMut::new();
            for piece in self.slices.drain(..) {
                data.extend_from_slice(&piece.expect("all slices present"));
            }
            let frame = AssembledFrame {
                frame_id: header.frame_id,
                capture_timestamp_ms: header.capture_timestamp_ms,
                data: data.freeze(),
            };
            self.current_frame_id = None;
            self.expected = 0;
            self.received = 0;
            Some(frame)
        } else {
            None
        }
    }

    fn start_frame(&mut self, header: &VideoHeader) {
        self.current_frame_id = Some(header.frame_id);
        self.expected = header.packet_count;
        self.received = 0;
        self.slices = vec![None; header.packet_count as usize];
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::video::{fragment_frame, VideoHeader};
    use pretty_assertions::assert_eq;

    const TS: u64 = 1_700_000_000_000;

    fn feed(assembler: &mut FrameAssembler, packet: &Bytes) -> Option<AssembledFrame> {
        let (header, slice) = VideoHeader::parse(packet).unwrap();
        assembler.push(&header, slice)
    }

    #[test]
    fn in_order_reassembly() {
        let frame: Bytes = (0..4000u32).map(|i| i as u8).collect::<Vec<_>>().into();
        let packets: Vec<Bytes> =
            fragment_frame(7, TS, "T1", frame.clone(), 1053).unwrap().collect();

        let mut assembler = FrameAssembler::new();
        let mut out = None;
        for packet in &packets {
            out = feed(&mut assembler, packet);
        }
        let assembled = out.expect("frame completes on final packet");
        assert_eq!(assembled.frame_id, 7);
        assert_eq!(assembled.capture_timestamp_ms, TS);
        assert_eq!(assembled.data, frame);
    }

    #[test]
    fn out_of_order_reassembly() {
        let frame: Bytes = vec![9u8; 3000].into();
        let mut packets: Vec<Bytes> =
            fragment_frame(3, TS, "T1", frame.clone(), 1053).unwrap().collect();
        packets.swap(0, 2);

        let mut assembler = FrameAssembler::new();
        let mut out = None;
        for packet in &packets {
            out = feed(&mut assembler, packet);
        }
        assert_eq!(out.unwrap().data, frame);
    }

    #[test]
    fn newer_frame_discards_incomplete() {
        let old: Vec<Bytes> =
            fragment_frame(1, TS, "T1", vec![1u8; 3000].into(), 1053).unwrap().collect();
        let new_frame: Bytes = vec![2u8; 500].into();
        let new: Vec<Bytes> =
            fragment_frame(2, TS, "T1", new_frame.clone(), 1053).unwrap().collect();

        let mut assembler = FrameAssembler::new();
        feed(&mut assembler, &old[0]);
        feed(&mut assembler, &old[1]);
        // frame 2 arrives before frame 1 finished
        let out = feed(&mut assembler, &new[0]);
        assert_eq!(out.unwrap().data, new_frame);
        assert_eq!(assembler.discarded_frames(), 1);
    }

    #[test]
    fn stale_frame_ignored() {
        let current: Vec<Bytes> =
            fragment_frame(5, TS, "T1", vec![1u8; 2000].into(), 1053).unwrap().collect();
        let stale: Vec<Bytes> =
            fragment_frame(4, TS, "T1", vec![2u8; 500].into(), 1053).unwrap().collect();

        let mut assembler = FrameAssembler::new();
        feed(&mut assembler, &current[0]);
        assert!(feed(&mut assembler, &stale[0]).is_none());
        let out = feed(&mut assembler, &current[1]);
        assert_eq!(out.unwrap().frame_id, 5);
    }

    #[test]
    fn duplicate_packet_is_harmless() {
        let packets: Vec<Bytes> =
            fragment_frame(8, TS, "T1", vec![7u8; 2000].into(), 1053).unwrap().collect();

        let mut assembler = FrameAssembler::new();
        feed(&mut assembler, &packets[0]);
        feed(&mut assembler, &packets[0]);
        let out = feed(&mut assembler, &packets[1]);
        assert!(out.is_some());
    }
}

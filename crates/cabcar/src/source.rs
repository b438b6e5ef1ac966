//! Encoded video sources.
//!
//! The camera and the H.264 encoder library are external collaborators; what
//! the agent consumes is a stream of already-encoded access units. The file
//! source below replays an Annex-B `.h264` dump in a loop at a fixed frame
//! rate, which is how bench setups drive the fabric without a vehicle.

use anyhow::{Context, Result};
use bytes::{Bytes, BytesMut};
use std::path::Path;

/// One encoded frame ready for fragmentation.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub frame_id: u32,
    pub capture_timestamp_ms: u64,
    pub data: Bytes,
    pub keyframe: bool,
}

/// A producer of encoded frames.
pub trait FrameSource: Send {
    /// The next access unit, in display order. Sources loop forever.
    fn next_frame(&mut self) -> Option<EncodedFrame>;
    fn fps(&self) -> u32;
}

const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;
const NAL_IDR: u8 = 5;
const NAL_SLICE: u8 = 1;

/// A single NAL unit with its Annex-B start code.
#[derive(Debug, Clone)]
struct Nal {
    data: Bytes,
    kind: u8,
}

/// Replays an Annex-B elementary stream from a file.
///
/// Access units are cut at VCL NAL boundaries. The parameter sets seen last
/// are tracked and prepended to every IDR frame, so any complete key frame a
/// receiver assembles is independently decodable.
pub struct H264FileSource {
    frames: Vec<(Bytes, bool)>,
    cursor: usize,
    next_frame_id: u32,
    fps: u32,
}

impl H264FileSource {
    pub fn open(path: &Path, fps: u32) -> Result<Self> {
        let raw = std::fs::read(path)
            .with_context(|| format!("reading video source {}", path.display()))?;
        let frames = cut_access_units(&raw);
        anyhow::ensure!(!frames.is_empty(), "no access units in {}", path.display());
        Ok(Self {
            frames,
            cursor: 0,
            next_frame_id: 0,
            fps,
        })
    }

    #[cfg(test)]
    fn from_bytes(raw: &[u8], fps: u32) -> Self {
        Self {
            frames: cut_access_units(raw),
            cursor: 0,
            next_frame_id: 0,
            fps,
        }
    }
}

impl FrameSource for H264FileSource {
    fn next_frame(&mut self) -> Option<EncodedFrame> {
        let (data, keyframe) = self.frames[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.frames.len();
        let frame_id = self.next_frame_id;
        self.next_frame_id = self.next_frame_id.wrapping_add(1);
        Some(EncodedFrame {
            frame_id,
            capture_timestamp_ms: now_ms(),
            data,
            keyframe,
        })
    }

    fn fps(&self) -> u32 {
        self.fps
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Split an Annex-B stream into NAL units, keeping start codes.
fn split_nals(raw: &[u8]) -> Vec<Nal> {
    let mut starts = Vec::new();
    let mut i = 0;
    while i + 3 <= raw.len() {
        if raw[i] == 0 && raw[i + 1] == 0 {
            if raw[i + 2] == 1 {
                starts.push((i, i + 3));
                i += 3;
                continue;
            }
            if i + 4 <= raw.len() && raw[i + 2] == 0 && raw[i + 3] == 1 {
                starts.push((i, i + 4));
                i += 4;
                continue;
            }
        }
        i += 1;
    }

    let mut nals = Vec::with_capacity(starts.len());
    for (idx, &(start, header_end)) in starts.iter().enumerate() {
        let end = starts.get(idx + 1).map(|&(next, _)| next).unwrap_or(raw.len());
        if header_end >= end {
            continue;
        }
        let kind = raw[header_end] & 0x1F;
        nals.push(Nal {
            data: Bytes::copy_from_slice(&raw[start..end]),
            kind,
        });
    }
    nals
}

/// Group NAL units into access units, one VCL NAL each; prepend tracked
/// SPS/PPS to IDR frames that arrived bare.
fn cut_access_units(raw: &[u8]) -> Vec<(Bytes, bool)> {
    let mut sps: Option<Bytes> = None;
    let mut pps: Option<Bytes> = None;
    let mut pending: Vec<Nal> = Vec::new();
    let mut frames = Vec::new();

    for nal in split_nals(raw) {
        match nal.kind {
            NAL_SPS => sps = Some(nal.data.clone()),
            NAL_PPS => pps = Some(nal.data.clone()),
            _ => {}
        }
        let is_vcl = nal.kind == NAL_SLICE || nal.kind == NAL_IDR;
        let is_idr = nal.kind == NAL_IDR;
        pending.push(nal);

        if is_vcl {
            let mut unit = BytesMut::new();
            let has_sps = pending.iter().any(|n| n.kind == NAL_SPS);
            if is_idr && !has_sps {
                if let (Some(sps), Some(pps)) = (&sps, &pps) {
                    unit.extend_from_slice(sps);
                    unit.extend_from_slice(pps);
                }
            }
            for nal in pending.drain(..) {
                unit.extend_from_slice(&nal.data);
            }
            frames.push((unit.freeze(), is_idr));
        }
    }
    frames
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn nal(kind: u8, body: &[u8]) -> Vec<u8> {
        let mut out = vec![0, 0, 0, 1, kind];
        out.extend_from_slice(body);
        out
    }

    #[test]
    fn splits_and_classifies_nals() {
        let mut raw = nal(NAL_SPS, b"s");
        raw.extend(nal(NAL_PPS, b"p"));
        raw.extend(nal(NAL_IDR, b"i"));
        raw.extend(nal(NAL_SLICE, b"x"));

        let nals = split_nals(&raw);
        assert_eq!(nals.len(), 4);
        assert_eq!(nals[0].kind, NAL_SPS);
        assert_eq!(nals[2].kind, NAL_IDR);
    }

    #[test]
    fn access_units_cut_at_vcl_boundaries() {
        let mut raw = nal(NAL_SPS, b"s");
        raw.extend(nal(NAL_PPS, b"p"));
        raw.extend(nal(NAL_IDR, b"i"));
        raw.extend(nal(NAL_SLICE, b"a"));
        raw.extend(nal(NAL_SLICE, b"b"));

        let frames = cut_access_units(&raw);
        assert_eq!(frames.len(), 3);
        assert!(frames[0].1, "first frame is the IDR");
        assert!(!frames[1].1);
    }

    #[test]
    fn bare_idr_gets_parameter_sets_prepended() {
        let mut raw = nal(NAL_SPS, b"s");
        raw.extend(nal(NAL_PPS, b"p"));
        raw.extend(nal(NAL_IDR, b"first"));
        raw.extend(nal(NAL_SLICE, b"x"));
        // Second IDR arrives without parameter sets of its own.
        raw.extend(nal(NAL_IDR, b"second"));

        let frames = cut_access_units(&raw);
        let (second_idr, is_idr) = &frames[2];
        assert!(is_idr);
        let sps = nal(NAL_SPS, b"s");
        assert!(second_idr.as_ref().windows(sps.len()).any(|w| w == sps));
    }

    #[test]
    fn source_loops_and_increments_frame_ids() {
        let mut raw = nal(NAL_SPS, b"s");
        raw.extend(nal(NAL_PPS, b"p"));
        raw.extend(nal(NAL_IDR, b"i"));
        raw.extend(nal(NAL_SLICE, b"x"));

        let mut source = H264FileSource::from_bytes(&raw, 30);
        let first = source.next_frame().unwrap();
        let second = source.next_frame().unwrap();
        let third = source.next_frame().unwrap();

        assert_eq!(first.frame_id, 0);
        assert_eq!(second.frame_id, 1);
        assert_eq!(third.frame_id, 2);
        // Two access units in the file, so the third wraps to the first AU.
        assert_eq!(third.data, first.data);
        assert_eq!(source.fps(), 30);
    }
}

//! Encoder facade.
//!
//! The H.264 encoder library is an external collaborator; the agent owns one
//! instance at a time through this facade. A `CHANGE_VIDEO_QUALITY` command
//! reinitialises the encoder with the preset's bitrate - there is no
//! in-place rate change.

use crate::source::EncodedFrame;
use railproto::VideoQuality;
use tracing::info;

/// Parameters the encoder is (re)built with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderSettings {
    pub quality: VideoQuality,
    pub fps: u32,
}

impl EncoderSettings {
    pub fn bitrate(&self) -> u32 {
        self.quality.bitrate()
    }
}

/// One live encoder instance.
pub trait FrameEncoder: Send {
    /// Pass a frame through the encoder. `None` means the encoder absorbed
    /// it (rate control may skip frames).
    fn encode(&mut self, frame: EncodedFrame) -> Option<EncodedFrame>;
}

/// For pre-encoded sources (file replay) the encode step is the identity.
pub struct PassthroughEncoder;

impl FrameEncoder for PassthroughEncoder {
    fn encode(&mut self, frame: EncodedFrame) -> Option<EncodedFrame> {
        Some(frame)
    }
}

type EncoderFactory = Box<dyn Fn(&EncoderSettings) -> Box<dyn FrameEncoder> + Send>;

/// Owns the active encoder and its settings; rebuilds on quality changes.
pub struct Encoder {
    settings: EncoderSettings,
    inner: Box<dyn FrameEncoder>,
    factory: EncoderFactory,
}

impl Encoder {
    pub fn new(factory: EncoderFactory, quality: VideoQuality, fps: u32) -> Self {
        let settings = EncoderSettings { quality, fps };
        let inner = factory(&settings);
        Self {
            settings,
            inner,
            factory,
        }
    }

    /// A passthrough encoder for pre-encoded sources.
    pub fn passthrough(fps: u32) -> Self {
        Self::new(Box::new(|_| Box::new(PassthroughEncoder)), VideoQuality::Medium, fps)
    }

    pub fn quality(&self) -> VideoQuality {
        self.settings.quality
    }

    pub fn encode(&mut self, frame: EncodedFrame) -> Option<EncodedFrame> {
        self.inner.encode(frame)
    }

    /// Tear the encoder down and bring it back up at the new bitrate.
    pub fn reconfigure(&mut self, quality: VideoQuality) {
        if quality == self.settings.quality {
            return;
        }
        info!(
            ?quality,
            bitrate = quality.bitrate(),
            "reinitialising encoder"
        );
        self.settings.quality = quality;
        self.inner = (self.factory)(&self.settings);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn frame() -> EncodedFrame {
        EncodedFrame {
            frame_id: 1,
            capture_timestamp_ms: 0,
            data: Bytes::from_static(b"au"),
            keyframe: false,
        }
    }

    #[test]
    fn passthrough_returns_frames_unchanged() {
        let mut encoder = Encoder::passthrough(30);
        let out = encoder.encode(frame()).unwrap();
        assert_eq!(out.data.as_ref(), b"au");
    }

    #[test]
    fn reconfigure_rebuilds_encoder_once_per_change() {
        let builds = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&builds);
        let mut encoder = Encoder::new(
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                Box::new(PassthroughEncoder)
            }),
            VideoQuality::Medium,
            30,
        );
        assert_eq!(builds.load(Ordering::SeqCst), 1);

        encoder.reconfigure(VideoQuality::High);
        assert_eq!(builds.load(Ordering::SeqCst), 2);
        assert_eq!(encoder.quality(), VideoQuality::High);

        // Same preset again: no rebuild.
        encoder.reconfigure(VideoQuality::High);
        assert_eq!(builds.load(Ordering::SeqCst), 2);
    }
}

//! Frame fragmenter and pacer.
//!
//! Each encoded frame becomes an ordered burst of MTU-bounded packets on the
//! currently selected transport. The selection is read once per frame, so a
//! SWITCH_PROTOCOL command takes effect exactly at a frame boundary and a
//! burst is never split across transports.

use crate::source::EncodedFrame;
use crate::transport::{Transport, TransportId};
use anyhow::Result;
use railproto::fragment_frame;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, warn};

pub struct Pacer {
    train_id: String,
    mtu: usize,
    active: watch::Receiver<TransportId>,
    transports: HashMap<TransportId, Arc<dyn Transport>>,
}

impl Pacer {
    pub fn new(
        train_id: impl Into<String>,
        mtu: usize,
        active: watch::Receiver<TransportId>,
    ) -> Self {
        Self {
            train_id: train_id.into(),
            mtu,
            active,
            transports: HashMap::new(),
        }
    }

    pub fn attach(&mut self, transport: Arc<dyn Transport>) {
        self.transports.insert(transport.id(), transport);
    }

    pub fn detach(&mut self, id: TransportId) {
        self.transports.remove(&id);
    }

    /// Fragment one frame and send the burst in packet order.
    pub async fn send_frame(&self, frame: &EncodedFrame) -> Result<()> {
        let selected = *self.active.borrow();
        let Some(transport) = self.transports.get(&selected) else {
            warn!(?selected, "no transport attached for video");
            return Ok(());
        };

        let packets = fragment_frame(
            frame.frame_id,
            frame.capture_timestamp_ms,
            &self.train_id,
            frame.data.clone(),
            self.mtu,
        )?;
        let total = packets.packet_count();
        for packet in packets {
            transport.send_video(packet).await?;
        }
        debug!(
            frame_id = frame.frame_id,
            packets = total,
            transport = ?selected,
            "frame paced"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use railproto::VideoHeader;
    use std::sync::Mutex;

    struct RecordingTransport {
        id: TransportId,
        sent: Mutex<Vec<Bytes>>,
    }

    impl RecordingTransport {
        fn new(id: TransportId) -> Arc<Self> {
            Arc::new(Self {
                id,
                sent: Mutex::new(Vec::new()),
            })
        }

        fn sent(&self) -> Vec<Bytes> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn id(&self) -> TransportId {
            self.id
        }

        async fn send_control(&self, data: Bytes) -> Result<()> {
            self.sent.lock().unwrap().push(data);
            Ok(())
        }

        async fn send_video(&self, data: Bytes) -> Result<()> {
            self.sent.lock().unwrap().push(data);
            Ok(())
        }
    }

    fn frame(frame_id: u32, len: usize) -> EncodedFrame {
        EncodedFrame {
            frame_id,
            capture_timestamp_ms: 1_700_000_000_000,
            data: vec![7u8; len].into(),
            keyframe: false,
        }
    }

    #[tokio::test]
    async fn burst_is_ordered_and_complete() {
        let (_, active) = watch::channel(TransportId::Quic);
        let mut pacer = Pacer::new("T1", 1053, active);
        let quic = RecordingTransport::new(TransportId::Quic);
        pacer.attach(quic.clone());

        pacer.send_frame(&frame(7, 4000)).await.unwrap();

        let sent = quic.sent();
        assert_eq!(sent.len(), 4);
        for (i, packet) in sent.iter().enumerate() {
            let (header, _) = VideoHeader::parse(packet).unwrap();
            assert_eq!(header.packet_index as usize, i + 1);
            assert_eq!(header.packet_count, 4);
        }
    }

    #[tokio::test]
    async fn switch_applies_at_frame_boundary() {
        let (select, active) = watch::channel(TransportId::Quic);
        let mut pacer = Pacer::new("T1", 1053, active);
        let quic = RecordingTransport::new(TransportId::Quic);
        let ws = RecordingTransport::new(TransportId::Ws);
        pacer.attach(quic.clone());
        pacer.attach(ws.clone());

        pacer.send_frame(&frame(1, 2000)).await.unwrap();
        select.send(TransportId::Ws).unwrap();
        pacer.send_frame(&frame(2, 2000)).await.unwrap();

        // Whole bursts, nothing interleaved.
        assert_eq!(quic.sent().len(), 2);
        assert_eq!(ws.sent().len(), 2);
        let (header, _) = VideoHeader::parse(&ws.sent()[0]).unwrap();
        assert_eq!(header.frame_id, 2);
    }

    #[tokio::test]
    async fn missing_transport_is_not_fatal() {
        let (_, active) = watch::channel(TransportId::Quic);
        let pacer = Pacer::new("T1", 1053, active);
        assert!(pacer.send_frame(&frame(1, 100)).await.is_ok());
    }
}

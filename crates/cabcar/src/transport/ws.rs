//! WebSocket transport: the reliable full-duplex lane and the low-rate
//! video fallback.

use super::{Transport, TransportEvent, TransportId};
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

pub struct WsTransport {
    outbound: mpsc::Sender<Bytes>,
}

impl WsTransport {
    /// Connect to `ws[s]://host:port/ws/train/{train_id}` and spawn the
    /// reader/writer tasks. The path itself identifies the train, so the
    /// transport reports `Identified` as soon as the socket is up.
    pub async fn connect(
        url: &str,
        events: mpsc::Sender<TransportEvent>,
    ) -> Result<Arc<Self>> {
        let (socket, _response) = tokio_tungstenite::connect_async(url)
            .await
            .with_context(|| format!("connecting websocket {url}"))?;
        debug!(url, "websocket connected");
        let (mut sink, mut stream) = socket.split();

        let (outbound, mut outbound_rx) = mpsc::channel::<Bytes>(64);

        tokio::spawn(async move {
            while let Some(data) = outbound_rx.recv().await {
                if sink.send(Message::Binary(data.to_vec())).await.is_err() {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_events = events.clone();
        tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match message {
                    Ok(Message::Binary(data)) => {
                        let event = TransportEvent::Packet {
                            transport: TransportId::Ws,
                            data: Bytes::from(data),
                        };
                        if reader_events.send(event).await.is_err() {
                            return;
                        }
                    }
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
            let _ = reader_events
                .send(TransportEvent::Disconnected {
                    transport: TransportId::Ws,
                })
                .await;
        });

        events
            .send(TransportEvent::Identified {
                transport: TransportId::Ws,
            })
            .await
            .ok();

        Ok(Arc::new(Self { outbound }))
    }
}

#[async_trait]
impl Transport for WsTransport {
    fn id(&self) -> TransportId {
        TransportId::Ws
    }

    async fn send_control(&self, data: Bytes) -> Result<()> {
        self.outbound
            .send(data)
            .await
            .map_err(|_| anyhow::anyhow!("websocket writer gone"))
    }

    async fn send_video(&self, data: Bytes) -> Result<()> {
        // Same ordered lane; WS has no unreliable mode.
        if let Err(err) = self.outbound.try_send(data) {
            match err {
                mpsc::error::TrySendError::Full(_) => {
                    warn!("websocket outbound full, dropping video packet");
                    Ok(())
                }
                mpsc::error::TrySendError::Closed(_) => {
                    Err(anyhow::anyhow!("websocket writer gone"))
                }
            }
        } else {
            Ok(())
        }
    }
}

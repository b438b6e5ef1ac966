//! MQTT sidecar: telemetry/status/heartbeat publishing and the command
//! subscription. Never carries media.

use super::{TransportEvent, TransportId};
use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};
use railproto::PacketType;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct MqttWorker {
    train_id: String,
    client: AsyncClient,
}

impl MqttWorker {
    /// Connect to the broker, subscribe to this train's control topic, and
    /// spawn the event loop. Incoming commands surface as packet events
    /// with the command tag prepended, so the agent dispatches them exactly
    /// like stream-delivered commands.
    pub fn start(
        train_id: &str,
        broker_host: &str,
        broker_port: u16,
        events: mpsc::Sender<TransportEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let mut options = MqttOptions::new(
            format!("cabcar-{train_id}"),
            broker_host.to_string(),
            broker_port,
        );
        options.set_keep_alive(Duration::from_secs(60));
        let (client, mut eventloop) = AsyncClient::new(options, 64);

        let command_topic = format!("commands/{train_id}/control");
        let subscribe_client = client.clone();
        let id = train_id.to_string();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = eventloop.poll() => event,
                };
                match event {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        info!(train_id = %id, "MQTT connected");
                        if let Err(err) = subscribe_client
                            .subscribe(&command_topic, QoS::AtLeastOnce)
                            .await
                        {
                            warn!(%err, "command topic subscribe failed");
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        debug!(topic = %publish.topic, "command via bus");
                        let mut packet = BytesMut::with_capacity(1 + publish.payload.len());
                        packet.put_u8(PacketType::Command.to_u8());
                        packet.extend_from_slice(&publish.payload);
                        let event = TransportEvent::Packet {
                            transport: TransportId::Mqtt,
                            data: packet.freeze(),
                        };
                        if events.send(event).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(%err, "MQTT connection error; retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self {
            train_id: train_id.to_string(),
            client,
        }
    }

    pub async fn publish_telemetry(&self, payload: &[u8]) -> Result<()> {
        let topic = format!("train/{}/telemetry", self.train_id);
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .await?;
        Ok(())
    }

    pub async fn publish_status(&self, payload: &[u8]) -> Result<()> {
        let topic = format!("train/{}/status", self.train_id);
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .await?;
        Ok(())
    }

    pub async fn publish_heartbeat(&self, payload: &[u8]) -> Result<()> {
        let topic = format!("train/{}/heartbeat", self.train_id);
        self.client
            .publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .await?;
        Ok(())
    }
}

/// Frame one telemetry record as a packet (tag byte prepended).
pub fn telemetry_packet(payload: &[u8]) -> Bytes {
    let mut packet = BytesMut::with_capacity(1 + payload.len());
    packet.put_u8(PacketType::Telemetry.to_u8());
    packet.extend_from_slice(payload);
    packet.freeze()
}

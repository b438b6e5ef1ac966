//! Telemetry bus adapter (MQTT).
//!
//! Thin bridge to the broker: subscribes to the train telemetry topics at
//! startup, extracts the train id from the topic, parses the JSON record,
//! hands it to in-process subscribers, and forwards telemetry to every
//! console bound to that train on whichever other transport they are
//! connected on. Commands toward a train publish on
//! `commands/<train_id>/control` at QoS 1.
//!
//! The broker owns liveness for this transport; the relay never idles out
//! MQTT endpoints.

use crate::endpoint::{Endpoint, EndpointRole, TransportKind};
use crate::state::AppState;
use anyhow::Result;
use bytes::{BufMut, Bytes, BytesMut};
use railproto::PacketType;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const TELEMETRY_TOPIC: &str = "train/+/telemetry";
const STATUS_TOPIC: &str = "train/+/status";
const HEARTBEAT_TOPIC: &str = "train/+/heartbeat";

/// Message classes arriving on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusMessageKind {
    Telemetry,
    Status,
    Heartbeat,
}

/// A bus message handed to in-process subscribers.
#[derive(Debug, Clone)]
pub struct BusEvent {
    pub train_id: String,
    pub kind: BusMessageKind,
    pub payload: serde_json::Value,
}

/// Handle for publishing commands toward trains over the bus.
#[derive(Clone)]
pub struct CommandPublisher {
    client: AsyncClient,
}

impl CommandPublisher {
    /// Publish a command JSON document to a train's control topic.
    pub async fn publish_command(&self, train_id: &str, payload: &[u8]) -> Result<()> {
        let topic = format!("commands/{train_id}/control");
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .await?;
        Ok(())
    }
}

pub struct MqttBridge {
    state: Arc<AppState>,
    client: AsyncClient,
    eventloop: EventLoop,
    bus: broadcast::Sender<BusEvent>,
}

impl MqttBridge {
    pub fn new(state: Arc<AppState>) -> Self {
        let mut options = MqttOptions::new(
            "switchyard-bridge",
            state.config.bind.mqtt_host.clone(),
            state.config.bind.mqtt_port,
        );
        options.set_keep_alive(Duration::from_secs(60));
        let (client, eventloop) = AsyncClient::new(options, 64);
        let (bus, _) = broadcast::channel(256);
        Self {
            state,
            client,
            eventloop,
            bus,
        }
    }

    pub fn commands(&self) -> CommandPublisher {
        CommandPublisher {
            client: self.client.clone(),
        }
    }

    /// Subscribe to parsed bus messages in-process.
    pub fn subscribe_bus(&self) -> broadcast::Receiver<BusEvent> {
        self.bus.subscribe()
    }

    /// Drive the broker connection until cancelled. Reconnection is the
    /// event loop's job; errors only back the poll off.
    pub async fn run(self, cancel: CancellationToken) {
        let MqttBridge {
            state,
            client,
            mut eventloop,
            bus,
        } = self;
        info!(
            host = %state.config.bind.mqtt_host,
            port = state.config.bind.mqtt_port,
            "MQTT bridge starting"
        );
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = eventloop.poll() => event,
            };
            match event {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("connected to MQTT broker");
                    subscribe_topics(&client).await;
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    handle_publish(&state, &client, &bus, &publish.topic, &publish.payload).await;
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(%err, "MQTT connection error; retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
        info!("MQTT bridge stopped");
    }
}

async fn subscribe_topics(client: &AsyncClient) {
    let topics = [
        (TELEMETRY_TOPIC, QoS::AtLeastOnce),
        (STATUS_TOPIC, QoS::AtLeastOnce),
        (HEARTBEAT_TOPIC, QoS::AtMostOnce),
    ];
    for (topic, qos) in topics {
        match client.subscribe(topic, qos).await {
            Ok(()) => info!(topic, ?qos, "subscribed"),
            Err(err) => warn!(topic, %err, "subscribe failed"),
        }
    }
}

async fn handle_publish(
    state: &Arc<AppState>,
    client: &AsyncClient,
    bus: &broadcast::Sender<BusEvent>,
    topic: &str,
    payload: &[u8],
) {
    let Some((train_id, kind)) = parse_topic(topic) else {
        warn!(topic, "unrecognised topic");
        return;
    };

    let record: serde_json::Value = match serde_json::from_slice(payload) {
        Ok(record) => record,
        Err(err) => {
            warn!(%train_id, %err, "malformed JSON on bus");
            state.metrics.incr_codec_errors();
            return;
        }
    };

    let endpoint = ensure_endpoint(state, client, &train_id);
    endpoint.touch();

    match kind {
        BusMessageKind::Telemetry => {
            debug!(%train_id, "telemetry via bus");
            let mut packet = BytesMut::with_capacity(1 + payload.len());
            packet.put_u8(PacketType::Telemetry.to_u8());
            packet.extend_from_slice(payload);
            state
                .router
                .fan_out_reliable(&train_id, packet.freeze())
                .await;
        }
        BusMessageKind::Status => {
            debug!(%train_id, "status via bus");
        }
        BusMessageKind::Heartbeat => {
            debug!(%train_id, "heartbeat via bus");
        }
    }

    let _ = bus.send(BusEvent {
        train_id,
        kind,
        payload: record,
    });
}

/// A train talking on the bus is reachable over MQTT: register an
/// endpoint whose outbound queue publishes to its control topic.
fn ensure_endpoint(state: &Arc<AppState>, client: &AsyncClient, train_id: &str) -> Arc<Endpoint> {
    if let Some(endpoint) = state
        .registry
        .train_on_transport(train_id, TransportKind::Mqtt)
    {
        return endpoint;
    }

    let endpoint = Endpoint::new(
        train_id,
        EndpointRole::Train,
        TransportKind::Mqtt,
        &state.config.limits,
    );
    state
        .registry
        .add_train(train_id, TransportKind::Mqtt, Arc::clone(&endpoint));

    // Drain task: queued command packets become QoS-1 publishes. The
    // one-byte tag is stripped; the bus carries bare JSON.
    let publisher = CommandPublisher {
        client: client.clone(),
    };
    let drain_endpoint = Arc::clone(&endpoint);
    let train = train_id.to_string();
    tokio::spawn(async move {
        while let Some(data) = drain_endpoint.queue().pop().await {
            let payload: Bytes = if data.is_empty() { data } else { data.slice(1..) };
            if let Err(err) = publisher.publish_command(&train, &payload).await {
                warn!(%train, %err, "command publish failed");
                break;
            }
        }
    });

    endpoint
}

fn parse_topic(topic: &str) -> Option<(String, BusMessageKind)> {
    let mut parts = topic.split('/');
    if parts.next()? != "train" {
        return None;
    }
    let train_id = parts.next()?;
    if train_id.is_empty() {
        return None;
    }
    let kind = match parts.next()? {
        "telemetry" => BusMessageKind::Telemetry,
        "status" => BusMessageKind::Status,
        "heartbeat" => BusMessageKind::Heartbeat,
        _ => return None,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((train_id.to_string(), kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_parsing() {
        assert_eq!(
            parse_topic("train/T1/telemetry"),
            Some(("T1".into(), BusMessageKind::Telemetry))
        );
        assert_eq!(
            parse_topic("train/T1/status"),
            Some(("T1".into(), BusMessageKind::Status))
        );
        assert_eq!(
            parse_topic("train/T1/heartbeat"),
            Some(("T1".into(), BusMessageKind::Heartbeat))
        );
        assert_eq!(parse_topic("train/T1/other"), None);
        assert_eq!(parse_topic("commands/T1/control"), None);
        assert_eq!(parse_topic("train//telemetry"), None);
        assert_eq!(parse_topic("train/T1/telemetry/extra"), None);
    }
}

//! The train agent: state machine, command dispatch and the send path.

use crate::clock::{ClockSync, EchoOutcome};
use crate::encoder::Encoder;
use crate::motor::MotorDriver;
use crate::pacer::Pacer;
use crate::source::FrameSource;
use crate::telemetry::TelemetrySimulator;
use crate::transport::mqtt::{telemetry_packet, MqttWorker};
use crate::transport::{Transport, TransportEvent, TransportId};
use crate::{netspeed, transport};
use anyhow::Result;
use bytes::Bytes;
use railproto::{
    DriveCommand, IncomingCommand, Instruction, Keepalive, MapAck, Packet, PacketType, RttProbe,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Send-path state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    Disconnected,
    Identifying,
    Idle,
    Streaming,
}

/// Events driving the send-path state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStateEvent {
    TransportConnected,
    HelloReceived,
    StartSending,
    StopSending,
    PowerOff,
    TransportDisconnected,
}

impl AgentState {
    pub fn on_event(self, event: AgentStateEvent) -> AgentState {
        use AgentState::*;
        use AgentStateEvent::*;
        match (self, event) {
            (_, TransportDisconnected) => Disconnected,
            (_, PowerOff) => Idle,
            (Disconnected, TransportConnected) => Identifying,
            (Identifying, HelloReceived) => Idle,
            (Idle, StartSending) => Streaming,
            (Streaming, StopSending) => Idle,
            (state, _) => state,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub train_id: String,
    pub server_host: String,
    pub http_port: u16,
    pub quic_port: u16,
    pub mqtt_port: u16,
    pub tls: bool,
    pub insecure: bool,
    pub fps: u32,
    pub mtu: usize,
    pub initial_transport: TransportId,
}

impl AgentConfig {
    pub fn ws_url(&self) -> String {
        let scheme = if self.tls { "wss" } else { "ws" };
        format!(
            "{scheme}://{}:{}/ws/train/{}",
            self.server_host, self.http_port, self.train_id
        )
    }

    pub fn http_base(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{scheme}://{}:{}", self.server_host, self.http_port)
    }
}

pub struct TrainAgent {
    config: AgentConfig,
    state: AgentState,
    encoder: Encoder,
    source: Box<dyn FrameSource>,
    telemetry: TelemetrySimulator,
    motor: Box<dyn MotorDriver>,
    clock: ClockSync,
    pacer: Pacer,
    active_tx: watch::Sender<TransportId>,
    controls: HashMap<TransportId, Arc<dyn Transport>>,
    mqtt: Option<MqttWorker>,
    keepalive_sequence: u64,
}

impl TrainAgent {
    pub fn new(
        config: AgentConfig,
        source: Box<dyn FrameSource>,
        motor: Box<dyn MotorDriver>,
    ) -> Self {
        let (active_tx, active_rx) = watch::channel(config.initial_transport);
        let pacer = Pacer::new(&config.train_id, config.mtu, active_rx);
        let fps = config.fps;
        Self {
            telemetry: TelemetrySimulator::new(&config.train_id),
            clock: ClockSync::new(&config.train_id),
            encoder: Encoder::passthrough(fps),
            state: AgentState::Disconnected,
            source,
            motor,
            pacer,
            active_tx,
            controls: HashMap::new(),
            mqtt: None,
            config,
            keepalive_sequence: 0,
        }
    }

    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Connect every transport and run the agent loop until cancelled.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let (events_tx, mut events) = mpsc::channel::<TransportEvent>(256);
        self.state = self.state.on_event(AgentStateEvent::TransportConnected);

        match transport::ws::WsTransport::connect(&self.config.ws_url(), events_tx.clone()).await {
            Ok(ws) => {
                self.pacer.attach(ws.clone());
                self.controls.insert(TransportId::Ws, ws);
            }
            Err(err) => warn!(%err, "websocket connect failed"),
        }

        let quic_addr = format!("{}:{}", self.config.server_host, self.config.quic_port);
        match tokio::net::lookup_host(&quic_addr)
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
        {
            Some(addr) => {
                match transport::quic::QuicTransport::connect(
                    addr,
                    &self.config.server_host,
                    &self.config.train_id,
                    self.config.insecure,
                    events_tx.clone(),
                )
                .await
                {
                    Ok(quic) => {
                        self.pacer.attach(quic.clone());
                        self.controls.insert(TransportId::Quic, quic);
                    }
                    Err(err) => warn!(%err, "QUIC connect failed"),
                }
            }
            None => warn!(addr = %quic_addr, "QUIC address did not resolve"),
        }

        self.mqtt = Some(MqttWorker::start(
            &self.config.train_id,
            &self.config.server_host,
            self.config.mqtt_port,
            events_tx.clone(),
            cancel.clone(),
        ));

        anyhow::ensure!(
            !self.controls.is_empty(),
            "no transport reached the relay at {}",
            self.config.server_host
        );
        anyhow::ensure!(self.config.fps > 0, "frame rate must be positive");

        let mut frame_interval =
            tokio::time::interval(Duration::from_micros(1_000_000 / u64::from(self.config.fps)));
        frame_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut telemetry_interval = tokio::time::interval(Duration::from_secs(1));
        telemetry_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_transport_event(event).await,
                    None => break,
                },
                _ = frame_interval.tick() => self.pump_frame().await,
                _ = telemetry_interval.tick() => self.pump_telemetry().await,
            }
        }

        info!("agent stopped");
        Ok(())
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Identified { transport } => {
                info!(?transport, "transport identified");
                self.state = self.state.on_event(AgentStateEvent::HelloReceived);
            }
            TransportEvent::Disconnected { transport } => {
                warn!(?transport, "transport lost");
                self.pacer.detach(transport);
                self.controls.remove(&transport);
                if self.controls.is_empty() {
                    self.state = self.state.on_event(AgentStateEvent::TransportDisconnected);
                }
            }
            TransportEvent::Packet { transport, data } => {
                self.handle_packet(transport, data).await;
            }
        }
    }

    async fn handle_packet(&mut self, transport: TransportId, data: Bytes) {
        let packet = match Packet::decode(&data) {
            Ok(packet) => packet,
            Err(err) => {
                debug!(%err, "undecodable packet from relay");
                return;
            }
        };
        match packet.kind {
            PacketType::Command => match packet.payload_json::<IncomingCommand>() {
                Ok(command) => self.handle_command(command).await,
                Err(err) => warn!(%err, "malformed command payload"),
            },
            PacketType::MapAck => match packet.payload_json::<MapAck>() {
                Ok(ack) => {
                    info!(console_id = %ack.remote_control_id, "console attached; starting clock sync");
                    let probe = self.clock.begin(&ack.remote_control_id, now_ms());
                    self.send_probe(transport, &probe).await;
                }
                Err(err) => warn!(%err, "malformed map_ack payload"),
            },
            PacketType::RttTrain => match packet.payload_json::<RttProbe>() {
                Ok(probe) => self.handle_rtt_echo(transport, probe).await,
                Err(err) => warn!(%err, "malformed rtt echo"),
            },
            PacketType::Keepalive => {
                if let Ok(keepalive) = packet.payload_json::<Keepalive>() {
                    debug!(sequence = keepalive.sequence, "relay keepalive");
                }
            }
            other => debug!(?other, "unhandled packet type from relay"),
        }
    }

    async fn handle_rtt_echo(&mut self, transport: TransportId, probe: RttProbe) {
        let Some(console_id) = probe.remote_control_id.clone() else {
            debug!("rtt echo without console identity");
            return;
        };
        match self.clock.on_echo(&console_id, &probe, now_ms()) {
            EchoOutcome::NextProbe(next) => self.send_probe(transport, &next).await,
            EchoOutcome::Done { offset_ms } => {
                info!(console_id, offset_ms, "clock offset established");
            }
            EchoOutcome::Ignored => debug!(console_id, "stale rtt echo ignored"),
        }
    }

    async fn send_probe(&self, transport: TransportId, probe: &RttProbe) {
        let Ok(packet) = Packet::json(PacketType::RttTrain, probe) else {
            return;
        };
        let data = packet.encode();
        // Prefer the lane the handshake arrived on; fall back to any.
        let sink = self
            .controls
            .get(&transport)
            .or_else(|| self.controls.values().next());
        if let Some(sink) = sink {
            if let Err(err) = sink.send_control(data).await {
                warn!(%err, "rtt probe send failed");
            }
        }
    }

    async fn handle_command(&mut self, command: IncomingCommand) {
        if let IncomingCommand::Drive(drive) = &command {
            let latency = self.clock.one_way_latency(
                &drive.remote_control_id,
                drive.remote_control_timestamp,
                now_ms(),
            );
            info!(
                command_id = %drive.command_id,
                console_id = %drive.remote_control_id,
                instruction = ?drive.instruction,
                latency_ms = latency,
                "command received"
            );
        }

        let drive = match &command {
            IncomingCommand::Drive(drive) => Some(drive.clone()),
            IncomingCommand::Relay(_) => None,
        };
        self.apply_instruction(command.instruction(), drive).await;
    }

    async fn apply_instruction(&mut self, instruction: Instruction, drive: Option<DriveCommand>) {
        match instruction {
            Instruction::ChangeTargetSpeed => {
                let Some(target) = drive.as_ref().and_then(|d| d.target_speed) else {
                    warn!("CHANGE_TARGET_SPEED without target_speed");
                    return;
                };
                self.telemetry.set_target_speed(target);
                self.motor.set_speed(self.telemetry.target_speed());
            }
            Instruction::StartSendingData => {
                self.state = self.state.on_event(AgentStateEvent::StartSending);
                info!(state = ?self.state, "streaming gate opened");
            }
            Instruction::StopSendingData => {
                self.state = self.state.on_event(AgentStateEvent::StopSending);
                info!(state = ?self.state, "streaming gate closed");
            }
            Instruction::PowerOn => {
                self.telemetry.power_on();
                let target = self.telemetry.target_speed().max(30.0);
                self.telemetry.set_target_speed(target);
                self.motor.set_speed(target);
            }
            Instruction::PowerOff => {
                self.state = self.state.on_event(AgentStateEvent::PowerOff);
                self.telemetry.power_off();
                self.motor.stop();
            }
            Instruction::ChangeDirection => {
                let Some(direction) = drive.as_ref().and_then(|d| d.direction) else {
                    warn!("CHANGE_DIRECTION without direction");
                    return;
                };
                self.telemetry.set_direction(direction);
                self.motor.set_direction(direction);
            }
            Instruction::CalculateNetworkSpeed => {
                let base = self.config.http_base();
                tokio::spawn(async move {
                    if let Err(err) = netspeed::measure(&base).await {
                        warn!(%err, "network speed measurement failed");
                    }
                });
            }
            Instruction::ChangeVideoQuality => {
                let Some(quality) = drive.as_ref().and_then(|d| d.quality) else {
                    warn!("CHANGE_VIDEO_QUALITY without quality");
                    return;
                };
                self.encoder.reconfigure(quality);
            }
            Instruction::SwitchProtocol => {
                let Some(protocol) = drive.as_ref().and_then(|d| d.protocol) else {
                    warn!("SWITCH_PROTOCOL without protocol");
                    return;
                };
                match TransportId::for_protocol(protocol) {
                    Some(id) if self.controls.contains_key(&id) => {
                        info!(?protocol, "switching video transport");
                        let _ = self.active_tx.send(id);
                    }
                    Some(id) => warn!(?id, "requested transport not connected"),
                    None => warn!(
                        "WEBRTC is negotiated peer-to-peer via signaling; relay transport unchanged"
                    ),
                }
            }
        }
    }

    async fn pump_frame(&mut self) {
        if self.state != AgentState::Streaming {
            return;
        }
        let Some(raw) = self.source.next_frame() else {
            return;
        };
        let Some(frame) = self.encoder.encode(raw) else {
            return;
        };
        if let Err(err) = self.pacer.send_frame(&frame).await {
            warn!(%err, "frame pacing failed");
        }
    }

    async fn pump_telemetry(&mut self) {
        let report = self.telemetry.tick();
        if self.state != AgentState::Streaming {
            return;
        }
        let Ok(payload) = serde_json::to_vec(&report) else {
            return;
        };
        let packet = telemetry_packet(&payload);
        for sink in self.controls.values() {
            if let Err(err) = sink.send_control(packet.clone()).await {
                debug!(%err, "telemetry send failed");
            }
        }
        if let Some(mqtt) = &self.mqtt {
            if let Err(err) = mqtt.publish_telemetry(&payload).await {
                debug!(%err, "telemetry publish failed");
            }
            self.keepalive_sequence += 1;
            if self.keepalive_sequence % 5 == 0 {
                let heartbeat = Keepalive::new(self.keepalive_sequence, now_ms());
                if let Ok(body) = serde_json::to_vec(&heartbeat) {
                    let _ = mqtt.publish_heartbeat(&body).await;
                }
            }
        }
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn send_path_state_table() {
        use AgentState::*;
        use AgentStateEvent::*;

        assert_eq!(Disconnected.on_event(TransportConnected), Identifying);
        assert_eq!(Identifying.on_event(HelloReceived), Idle);
        assert_eq!(Idle.on_event(StartSending), Streaming);
        assert_eq!(Streaming.on_event(StopSending), Idle);
    }

    #[test]
    fn power_off_always_lands_idle() {
        use AgentState::*;
        use AgentStateEvent::*;

        assert_eq!(Streaming.on_event(PowerOff), Idle);
        assert_eq!(Idle.on_event(PowerOff), Idle);
        assert_eq!(Identifying.on_event(PowerOff), Idle);
    }

    #[test]
    fn disconnect_always_lands_disconnected() {
        use AgentState::*;
        use AgentStateEvent::*;

        for state in [Disconnected, Identifying, Idle, Streaming] {
            assert_eq!(state.on_event(TransportDisconnected), Disconnected);
        }
    }

    #[test]
    fn unrelated_events_leave_state_alone() {
        use AgentState::*;
        use AgentStateEvent::*;

        assert_eq!(Disconnected.on_event(StartSending), Disconnected);
        assert_eq!(Idle.on_event(StopSending), Idle);
        assert_eq!(Streaming.on_event(StartSending), Streaming);
        assert_eq!(Streaming.on_event(HelloReceived), Streaming);
    }

    #[test]
    fn ws_url_reflects_tls() {
        let config = AgentConfig {
            train_id: "T1".into(),
            server_host: "relay.example".into(),
            http_port: 8000,
            quic_port: 4437,
            mqtt_port: 1883,
            tls: false,
            insecure: false,
            fps: 30,
            mtu: 1200,
            initial_transport: TransportId::Quic,
        };
        assert_eq!(config.ws_url(), "ws://relay.example:8000/ws/train/T1");
        assert_eq!(config.http_base(), "http://relay.example:8000");

        let tls_config = AgentConfig { tls: true, ..config };
        assert_eq!(tls_config.ws_url(), "wss://relay.example:8000/ws/train/T1");
    }
}

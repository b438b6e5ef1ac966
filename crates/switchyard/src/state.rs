//! Shared relay state and the registry event pump.

use crate::metrics::{BandwidthMeter, RelayMetrics};
use crate::registry::{RegistryEvent, SessionRegistry};
use crate::router::{DatagramFanout, Router};
use crate::signaling::SignalingHub;
use bytes::Bytes;
use dashmap::DashMap;
use railconf::RelayConfig;
use railproto::{Notification, Packet, PacketType, RelayCommand, TrainEvent};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Operational hooks for the fleet-simulation layer. The relay only defines
/// the trigger points; what they start or stop is out of scope.
#[derive(Default)]
pub struct SimHooks {
    /// A bind was attempted while no physical train was present.
    pub on_first_bind_with_no_train: Option<Box<dyn Fn() + Send + Sync>>,
    /// The last console left the registry.
    pub on_last_console_gone: Option<Box<dyn Fn() + Send + Sync>>,
}

impl SimHooks {
    pub fn fire_bind_with_no_train(&self) {
        if let Some(hook) = &self.on_first_bind_with_no_train {
            hook();
        }
    }

    pub fn fire_last_console_gone(&self) {
        if let Some(hook) = &self.on_last_console_gone {
            hook();
        }
    }
}

/// Everything the transports and the HTTP surface share.
pub struct AppState {
    pub config: RelayConfig,
    pub registry: Arc<SessionRegistry>,
    pub router: Arc<Router>,
    pub metrics: Arc<RelayMetrics>,
    pub fanout: Arc<DatagramFanout>,
    pub signaling: Arc<SignalingHub>,
    pub hooks: SimHooks,
    /// Rolling receive-rate meters, one per train on the QUIC path.
    pub bandwidth: DashMap<String, Arc<BandwidthMeter>>,
    /// Pre-generated opaque payload for the download speed test.
    pub speedtest_blob: Bytes,
}

impl AppState {
    pub fn new(config: RelayConfig) -> Arc<Self> {
        Self::with_hooks(config, SimHooks::default())
    }

    pub fn with_hooks(config: RelayConfig, hooks: SimHooks) -> Arc<Self> {
        let registry = SessionRegistry::new();
        let metrics = Arc::new(RelayMetrics::new());
        let router = Router::new(Arc::clone(&registry), Arc::clone(&metrics));
        let fanout = DatagramFanout::new(config.limits.fanout_queue, Arc::clone(&metrics));

        let mut blob = vec![0u8; config.limits.speedtest_mb * 1024 * 1024];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut blob);

        Arc::new(Self {
            config,
            registry,
            router,
            metrics,
            fanout,
            signaling: SignalingHub::new(),
            hooks,
            bandwidth: DashMap::new(),
            speedtest_blob: Bytes::from(blob),
        })
    }

    pub fn bandwidth_meter(&self, train_id: &str) -> Arc<BandwidthMeter> {
        Arc::clone(
            &self
                .bandwidth
                .entry(train_id.to_string())
                .or_insert_with(|| Arc::new(BandwidthMeter::new())),
        )
    }
}

/// Turns registry events into wire traffic: fleet notifications toward every
/// console, stream gating commands toward trains, and the simulation hooks.
///
/// The subscription is taken before the task is spawned so no event emitted
/// in the meantime is lost.
pub fn spawn_event_pump(
    state: Arc<AppState>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let events = state.registry.subscribe();
    tokio::spawn(pump_loop(state, events, cancel))
}

async fn pump_loop(
    state: Arc<AppState>,
    mut events: tokio::sync::broadcast::Receiver<RegistryEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };
        match event {
            Ok(RegistryEvent::TrainJoined { train_id }) => {
                notify(&state, &train_id, TrainEvent::Connected).await;
            }
            Ok(RegistryEvent::TrainGone { train_id }) => {
                notify(&state, &train_id, TrainEvent::Disconnected).await;
            }
            Ok(RegistryEvent::StartSending { train_id }) => {
                gate(&state, &train_id, RelayCommand::start_sending()).await;
            }
            Ok(RegistryEvent::StopSending { train_id }) => {
                gate(&state, &train_id, RelayCommand::stop_sending()).await;
            }
            Ok(RegistryEvent::ConsoleGone { .. }) => {
                if state.registry.console_count() == 0 {
                    state.hooks.fire_last_console_gone();
                }
            }
            Ok(RegistryEvent::Bound { console_id, train_id }) => {
                debug!(console_id, train_id, "binding installed");
            }
            Ok(RegistryEvent::Unbound { console_id, train_id }) => {
                debug!(console_id, train_id, "binding dissolved");
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "registry event pump lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn notify(state: &AppState, train_id: &str, event: TrainEvent) {
    match Packet::json(PacketType::Notification, &Notification::new(train_id, event)) {
        Ok(packet) => state.router.broadcast_to_consoles(packet.encode()).await,
        Err(err) => warn!(%err, "failed to encode notification"),
    }
}

async fn gate(state: &AppState, train_id: &str, command: RelayCommand) {
    match Packet::json(PacketType::Command, &command) {
        Ok(packet) => state.router.send_to_train(train_id, packet.encode()).await,
        Err(err) => warn!(%err, "failed to encode gating command"),
    }
}

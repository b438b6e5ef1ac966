//! The routing core: registry state applied to every inbound packet.
//!
//! Rules, in the order the receivers hit them:
//!
//! 1. Train video: fan out to every subscriber on its best media transport
//!    (QUIC datagram if available, else the WS queue, else drop). MQTT never
//!    carries media.
//! 2. Train telemetry (and other reliable train output): same fan-out on the
//!    reliable lane, best-effort ordered.
//! 3. Train notifications: broadcast to every console regardless of binding.
//! 4. Console commands: point-route to the bound train's best reliable lane;
//!    no bound or reachable train means the command is dropped and counted.
//! 5. `rtt_train` probes fan out to subscribers like telemetry; the echoed
//!    copy a console sends back is point-routed to its train and never
//!    re-fanned.
//!
//! Errors stay local: a subscriber whose transport fails mid-send is removed
//! from the registry and the sender never hears about it.

use crate::endpoint::{Endpoint, TransportKind};
use crate::metrics::RelayMetrics;
use crate::registry::SessionRegistry;
use bytes::Bytes;
use railproto::packet::peek_type;
use railproto::PacketType;
use std::sync::Arc;
use tracing::{debug, warn};

pub struct Router {
    registry: Arc<SessionRegistry>,
    metrics: Arc<RelayMetrics>,
}

impl Router {
    pub fn new(registry: Arc<SessionRegistry>, metrics: Arc<RelayMetrics>) -> Arc<Self> {
        Arc::new(Self { registry, metrics })
    }

    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Dispatch one packet received from a train.
    pub async fn route_train_packet(&self, train_id: &str, data: Bytes) {
        let kind = match peek_type(&data) {
            Ok(kind) => kind,
            Err(railproto::ProtoError::UnknownType(_)) => {
                self.metrics.incr_unknown_type();
                return;
            }
            Err(_) => {
                self.metrics.incr_codec_errors();
                return;
            }
        };

        match kind {
            PacketType::Video | PacketType::Audio => {
                self.fan_out_media(train_id, data).await;
            }
            PacketType::Notification => {
                self.broadcast_to_consoles(data).await;
            }
            PacketType::Keepalive => {
                // Activity already recorded by the transport receiver.
            }
            _ => {
                // Telemetry, IMU, lidar, rtt probes, speed-test signaling:
                // reliable fan-out to the subscriber set.
                self.fan_out_reliable(train_id, data).await;
            }
        }
    }

    /// Dispatch one packet received from a console.
    pub async fn route_console_packet(&self, console_id: &str, data: Bytes) {
        let kind = match peek_type(&data) {
            Ok(kind) => kind,
            Err(railproto::ProtoError::UnknownType(_)) => {
                self.metrics.incr_unknown_type();
                return;
            }
            Err(_) => {
                self.metrics.incr_codec_errors();
                return;
            }
        };

        let Some(train_id) = self.registry.train_of(console_id) else {
            self.metrics.incr_no_route();
            warn!(console_id, "command dropped: console not bound to a train");
            return;
        };
        let Some(endpoint) = self.registry.train_endpoint(&train_id) else {
            self.metrics.incr_no_route();
            warn!(console_id, train_id, "command dropped: train unreachable");
            return;
        };
        endpoint.queue().push(kind, data).await;
    }

    /// Fan one media packet out to every subscriber of a train. Datagram
    /// lane when the subscriber has one, WS queue otherwise.
    pub async fn fan_out_media(&self, train_id: &str, data: Bytes) {
        for console_id in self.registry.subscribers_of(train_id) {
            let Some(endpoint) = self.registry.console_media_endpoint(&console_id) else {
                continue;
            };
            if endpoint.transport == TransportKind::Quic && endpoint.has_datagram_lane() {
                if let Err(err) = endpoint.send_datagram(data.clone()) {
                    debug!(console_id, %err, "datagram send failed; removing endpoint");
                    endpoint.close("datagram send failure");
                    self.registry.remove_endpoint(&endpoint);
                }
            } else {
                endpoint.queue().push_video(data.clone());
            }
        }
    }

    /// Reliable ordered fan-out (telemetry, rtt probes).
    pub async fn fan_out_reliable(&self, train_id: &str, data: Bytes) {
        for console_id in self.registry.subscribers_of(train_id) {
            if let Some(endpoint) = self.registry.console_media_endpoint(&console_id) {
                endpoint.queue().push_control(data.clone()).await;
            }
        }
    }

    /// Broadcast to every console in the registry irrespective of binding;
    /// used for fleet-list refresh notifications.
    pub async fn broadcast_to_consoles(&self, data: Bytes) {
        for endpoint in self.registry.all_console_media_endpoints() {
            endpoint.queue().push_control(data.clone()).await;
        }
    }

    /// Deliver a relay-originated packet to a train's best reliable lane.
    pub async fn send_to_train(&self, train_id: &str, data: Bytes) {
        if let Some(endpoint) = self.registry.train_endpoint(train_id) {
            let kind = peek_type(&data).unwrap_or(PacketType::Command);
            endpoint.queue().push(kind, data).await;
        } else {
            debug!(train_id, "relay packet dropped: train unreachable");
        }
    }
}

/// Bounded drop-oldest ring feeding the datagram relay task. Multi-writer
/// (every QUIC receiver), single-reader (the relay task); the receive path
/// never blocks on it.
pub struct DatagramFanout {
    ring: std::sync::Mutex<std::collections::VecDeque<(String, Bytes)>>,
    cap: usize,
    readable: tokio::sync::Notify,
    metrics: Arc<RelayMetrics>,
}

impl DatagramFanout {
    pub fn new(cap: usize, metrics: Arc<RelayMetrics>) -> Arc<Self> {
        Arc::new(Self {
            ring: std::sync::Mutex::new(std::collections::VecDeque::with_capacity(cap)),
            cap,
            readable: tokio::sync::Notify::new(),
            metrics,
        })
    }

    /// Non-blocking push; the oldest datagram gives way on overflow.
    pub fn push(&self, train_id: &str, data: Bytes) {
        {
            let mut ring = self.ring.lock().expect("fanout ring poisoned");
            if ring.len() >= self.cap {
                ring.pop_front();
                self.metrics.incr_dropped_datagrams();
            }
            ring.push_back((train_id.to_string(), data));
        }
        self.readable.notify_one();
    }

    pub fn len(&self) -> usize {
        self.ring.lock().expect("fanout ring poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn pop(&self) -> Option<(String, Bytes)> {
        self.ring.lock().expect("fanout ring poisoned").pop_front()
    }

    /// The dedicated relay task: drain the ring, fan each datagram out.
    pub async fn run(
        self: Arc<Self>,
        router: Arc<Router>,
        cancel: tokio_util::sync::CancellationToken,
    ) {
        loop {
            while let Some((train_id, data)) = self.pop() {
                router.fan_out_media(&train_id, data).await;
            }
            tokio::select! {
                _ = self.readable.notified() => {}
                _ = cancel.cancelled() => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::EndpointRole;
    use railproto::video::encode_video;

    fn limits() -> railconf::LimitsConfig {
        railconf::LimitsConfig::default()
    }

    fn setup() -> (Arc<SessionRegistry>, Arc<Router>) {
        let registry = SessionRegistry::new();
        let metrics = Arc::new(RelayMetrics::new());
        let router = Router::new(Arc::clone(&registry), metrics);
        (registry, router)
    }

    fn add_console(registry: &SessionRegistry, id: &str) -> Arc<Endpoint> {
        let endpoint = Endpoint::new(id, EndpointRole::Console, TransportKind::Ws, &limits());
        registry.add_console(id, TransportKind::Ws, Arc::clone(&endpoint));
        endpoint
    }

    fn add_train(registry: &SessionRegistry, id: &str) -> Arc<Endpoint> {
        let endpoint = Endpoint::new(id, EndpointRole::Train, TransportKind::Ws, &limits());
        registry.add_train(id, TransportKind::Ws, Arc::clone(&endpoint));
        endpoint
    }

    #[tokio::test]
    async fn video_reaches_every_subscriber() {
        let (registry, router) = setup();
        add_train(&registry, "T1");
        let c1 = add_console(&registry, "C1");
        let c2 = add_console(&registry, "C2");
        registry.bind("C1", "T1").unwrap();
        registry.bind("C2", "T1").unwrap();

        let packet = encode_video(7, 0, "T1", b"frame", 1, 1).unwrap();
        router.route_train_packet("T1", packet).await;

        assert_eq!(c1.queue().len(), 1);
        assert_eq!(c2.queue().len(), 1);
    }

    #[tokio::test]
    async fn unbound_console_receives_nothing() {
        let (registry, router) = setup();
        add_train(&registry, "T1");
        let c1 = add_console(&registry, "C1");

        let packet = encode_video(7, 0, "T1", b"frame", 1, 1).unwrap();
        router.route_train_packet("T1", packet).await;
        assert!(c1.queue().is_empty());
    }

    #[tokio::test]
    async fn notification_broadcasts_irrespective_of_binding() {
        let (registry, router) = setup();
        add_train(&registry, "T1");
        let c1 = add_console(&registry, "C1");
        let c2 = add_console(&registry, "C2");
        registry.bind("C1", "T1").unwrap();

        let packet = railproto::Packet::json(
            PacketType::Notification,
            &railproto::Notification::new("T1", railproto::TrainEvent::Connected),
        )
        .unwrap()
        .encode();
        router.route_train_packet("T1", packet).await;

        assert_eq!(c1.queue().len(), 1);
        assert_eq!(c2.queue().len(), 1);
    }

    #[tokio::test]
    async fn command_point_routes_to_bound_train() {
        let (registry, router) = setup();
        let t1 = add_train(&registry, "T1");
        add_console(&registry, "C1");
        registry.bind("C1", "T1").unwrap();

        let packet = railproto::Packet::json(
            PacketType::Command,
            &railproto::DriveCommand::simple(
                railproto::Instruction::PowerOn,
                "C1",
                "cmd-1",
                1000,
            ),
        )
        .unwrap()
        .encode();
        router.route_console_packet("C1", packet).await;
        assert_eq!(t1.queue().len(), 1);
    }

    #[tokio::test]
    async fn unbound_command_is_counted_not_delivered() {
        let (registry, router) = setup();
        let t1 = add_train(&registry, "T1");
        add_console(&registry, "C1");

        let packet = railproto::Packet::json(
            PacketType::Command,
            &railproto::DriveCommand::simple(
                railproto::Instruction::PowerOn,
                "C1",
                "cmd-1",
                1000,
            ),
        )
        .unwrap()
        .encode();
        router.route_console_packet("C1", packet).await;

        assert!(t1.queue().is_empty());
        assert_eq!(
            router
                .metrics()
                .no_route
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn unknown_type_counted() {
        let (registry, router) = setup();
        add_train(&registry, "T1");
        router
            .route_train_packet("T1", Bytes::from_static(&[99, 1, 2]))
            .await;
        assert_eq!(
            router
                .metrics()
                .unknown_type
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
    }

    #[tokio::test]
    async fn fanout_ring_drops_oldest() {
        let metrics = Arc::new(RelayMetrics::new());
        let fanout = DatagramFanout::new(2, Arc::clone(&metrics));
        fanout.push("T1", Bytes::from_static(b"a"));
        fanout.push("T1", Bytes::from_static(b"b"));
        fanout.push("T1", Bytes::from_static(b"c"));

        assert_eq!(fanout.len(), 2);
        assert_eq!(
            metrics
                .dropped_datagrams
                .load(std::sync::atomic::Ordering::Relaxed),
            1
        );
        assert_eq!(fanout.pop().unwrap().1.as_ref(), b"b");
    }

    #[tokio::test]
    async fn bind_is_linearisable_with_routing() {
        let (registry, router) = setup();
        add_train(&registry, "T1");
        add_train(&registry, "T2");
        let c1 = add_console(&registry, "C1");
        registry.bind("C1", "T1").unwrap();

        // Packet emitted before the rebind goes to nobody after it.
        registry.bind("C1", "T2").unwrap();
        let from_t1 = encode_video(1, 0, "T1", b"stale", 1, 1).unwrap();
        router.route_train_packet("T1", from_t1).await;
        assert!(c1.queue().is_empty());

        let from_t2 = encode_video(2, 0, "T2", b"fresh", 1, 1).unwrap();
        router.route_train_packet("T2", from_t2).await;
        assert_eq!(c1.queue().len(), 1);
    }
}

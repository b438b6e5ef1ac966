//! Live connection handles and their bounded outbound queues.
//!
//! An `Endpoint` is one identified connection on one transport. Its outbound
//! queue is single-reader (the connection's sender task) and multi-writer
//! (the routing core). Queue policy per packet class:
//!
//! - video: drop-oldest beyond `video_queue` entries, count the drops
//! - control (everything else): pushers wait until the control lane clears
//!
//! A single deque preserves per-endpoint emit order across both classes.

use bytes::Bytes;
use railproto::PacketType;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Which transport a connection arrived on. Ordering is the outbound
/// preference: QUIC > WS > MQTT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TransportKind {
    Mqtt,
    Ws,
    Quic,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::Quic => "quic",
            TransportKind::Ws => "ws",
            TransportKind::Mqtt => "mqtt",
        }
    }

    /// Idle eviction threshold; `None` means the broker owns liveness.
    pub fn idle_timeout(&self, limits: &railconf::LimitsConfig) -> Option<Duration> {
        match self {
            TransportKind::Quic => Some(Duration::from_secs(limits.quic_idle_secs)),
            TransportKind::Ws => Some(Duration::from_secs(limits.ws_idle_secs)),
            TransportKind::Mqtt => None,
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Endpoint role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointRole {
    Train,
    Console,
}

/// Unreliable datagram lane, present on QUIC endpoints only.
pub trait DatagramLane: Send + Sync {
    /// Non-blocking best-effort send; failure means the connection is gone.
    fn send_datagram(&self, data: Bytes) -> Result<(), SendError>;
}

/// Transport-level send failure. The routing core reacts by removing the
/// endpoint, never by surfacing the error to the packet's sender.
#[derive(Debug, thiserror::Error)]
#[error("endpoint send failed: {0}")]
pub struct SendError(pub String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum QueueClass {
    Video,
    Control,
}

fn classify(kind: PacketType) -> QueueClass {
    match kind {
        PacketType::Video | PacketType::Audio => QueueClass::Video,
        _ => QueueClass::Control,
    }
}

struct QueueInner {
    entries: VecDeque<(QueueClass, Bytes)>,
    video_len: usize,
    control_len: usize,
    closed: bool,
}

/// Bounded outbound queue. See module docs for policy.
pub struct OutboundQueue {
    inner: Mutex<QueueInner>,
    video_cap: usize,
    control_cap: usize,
    readable: Notify,
    control_drained: Notify,
    dropped_video: AtomicU64,
}

impl OutboundQueue {
    pub fn new(video_cap: usize, control_cap: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner {
                entries: VecDeque::new(),
                video_len: 0,
                control_len: 0,
                closed: false,
            }),
            video_cap,
            control_cap,
            readable: Notify::new(),
            control_drained: Notify::new(),
            dropped_video: AtomicU64::new(0),
        }
    }

    /// Video packets dropped to keep the queue bounded.
    pub fn dropped_video(&self) -> u64 {
        self.dropped_video.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("queue poisoned").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Push a video packet; evicts the oldest queued video packet when full.
    pub fn push_video(&self, data: Bytes) {
        let mut inner = self.inner.lock().expect("queue poisoned");
        if inner.closed {
            return;
        }
        if inner.video_len >= self.video_cap {
            if let Some(pos) = inner
                .entries
                .iter()
                .position(|(class, _)| *class == QueueClass::Video)
            {
                inner.entries.remove(pos);
                inner.video_len -= 1;
                self.dropped_video.fetch_add(1, Ordering::Relaxed);
            }
        }
        inner.entries.push_back((QueueClass::Video, data));
        inner.video_len += 1;
        drop(inner);
        self.readable.notify_one();
    }

    /// Push a control packet, waiting while the control lane is full.
    pub async fn push_control(&self, data: Bytes) {
        loop {
            {
                let mut inner = self.inner.lock().expect("queue poisoned");
                if inner.closed {
                    return;
                }
                if inner.control_len < self.control_cap {
                    inner.entries.push_back((QueueClass::Control, data));
                    inner.control_len += 1;
                    drop(inner);
                    self.readable.notify_one();
                    return;
                }
            }
            // notify_one stores a permit, so a drain or close that lands
            // before this await still wakes us.
            self.control_drained.notified().await;
            if self.inner.lock().expect("queue poisoned").closed {
                // Pass the close wakeup along to any sibling pusher.
                self.control_drained.notify_one();
                return;
            }
        }
    }

    /// Push by packet class.
    pub async fn push(&self, kind: PacketType, data: Bytes) {
        match classify(kind) {
            QueueClass::Video => self.push_video(data),
            QueueClass::Control => self.push_control(data).await,
        }
    }

    /// Pop the next packet in order; waits while empty, returns `None` once
    /// closed and drained.
    pub async fn pop(&self) -> Option<Bytes> {
        loop {
            {
                let mut inner = self.inner.lock().expect("queue poisoned");
                if let Some((class, data)) = inner.entries.pop_front() {
                    match class {
                        QueueClass::Video => inner.video_len -= 1,
                        QueueClass::Control => {
                            inner.control_len -= 1;
                            self.control_drained.notify_one();
                        }
                    }
                    return Some(data);
                }
                if inner.closed {
                    return None;
                }
            }
            self.readable.notified().await;
        }
    }

    /// Close the queue; pending entries are discarded, waiters wake up.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("queue poisoned");
        inner.closed = true;
        inner.entries.clear();
        inner.video_len = 0;
        inner.control_len = 0;
        drop(inner);
        // Permit-storing wakeups: the queue has a single popper, and blocked
        // pushers cascade the permit among themselves.
        self.readable.notify_one();
        self.control_drained.notify_one();
    }
}

/// One identified live connection.
pub struct Endpoint {
    pub id: String,
    pub role: EndpointRole,
    pub transport: TransportKind,
    queue: OutboundQueue,
    datagram: Option<Box<dyn DatagramLane>>,
    last_activity: Mutex<Instant>,
    cancel: CancellationToken,
}

impl Endpoint {
    pub fn new(
        id: impl Into<String>,
        role: EndpointRole,
        transport: TransportKind,
        limits: &railconf::LimitsConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            role,
            transport,
            queue: OutboundQueue::new(limits.video_queue, limits.control_queue),
            datagram: None,
            last_activity: Mutex::new(Instant::now()),
            cancel: CancellationToken::new(),
        })
    }

    /// QUIC endpoints attach their datagram lane at construction.
    pub fn with_datagram_lane(
        id: impl Into<String>,
        role: EndpointRole,
        transport: TransportKind,
        limits: &railconf::LimitsConfig,
        lane: Box<dyn DatagramLane>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            role,
            transport,
            queue: OutboundQueue::new(limits.video_queue, limits.control_queue),
            datagram: Some(lane),
            last_activity: Mutex::new(Instant::now()),
            cancel: CancellationToken::new(),
        })
    }

    pub fn queue(&self) -> &OutboundQueue {
        &self.queue
    }

    /// Token the connection's tasks watch for cooperative shutdown.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn has_datagram_lane(&self) -> bool {
        self.datagram.is_some()
    }

    /// Best-effort datagram send on the unreliable lane.
    pub fn send_datagram(&self, data: Bytes) -> Result<(), SendError> {
        match &self.datagram {
            Some(lane) => lane.send_datagram(data),
            None => Err(SendError("no datagram lane".into())),
        }
    }

    /// Refresh the idle clock; called on every inbound packet.
    pub fn touch(&self) {
        *self.last_activity.lock().expect("activity clock poisoned") = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .expect("activity clock poisoned")
            .elapsed()
    }

    /// Begin teardown: cancel the connection tasks and discard the queue.
    pub fn close(&self, reason: &str) {
        if !self.cancel.is_cancelled() {
            tracing::debug!(id = %self.id, transport = %self.transport, reason, "closing endpoint");
            self.queue.close();
            self.cancel.cancel();
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("transport", &self.transport)
            .finish()
    }
}

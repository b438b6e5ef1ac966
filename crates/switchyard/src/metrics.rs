//! Relay counters and per-train bandwidth accounting.
//!
//! Errors on the data plane never propagate; they land here instead.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Process-wide drop/error counters. Lock-free reads for status surfaces.
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// Packets with an unparseable header.
    pub codec_errors: AtomicU64,
    /// Packets with a tag byte outside the known range.
    pub unknown_type: AtomicU64,
    /// Video packets dropped by per-endpoint outbound queues.
    pub dropped_video: AtomicU64,
    /// Datagrams dropped by the fan-out ring on overflow.
    pub dropped_datagrams: AtomicU64,
    /// Commands dropped because the console had no routable train.
    pub no_route: AtomicU64,
}

impl RelayMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr_codec_errors(&self) {
        self.codec_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_unknown_type(&self) {
        self.unknown_type.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_dropped_video(&self) {
        self.dropped_video.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_dropped_datagrams(&self) {
        self.dropped_datagrams.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_no_route(&self) {
        self.no_route.fetch_add(1, Ordering::Relaxed);
    }
}

/// Rolling one-second bytes/second meter, one per train on the QUIC
/// receive path.
#[derive(Debug)]
pub struct BandwidthMeter {
    state: Mutex<MeterState>,
}

#[derive(Debug)]
struct MeterState {
    window_start: Instant,
    window_bytes: u64,
    last_rate: u64,
}

impl BandwidthMeter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MeterState {
                window_start: Instant::now(),
                window_bytes: 0,
                last_rate: 0,
            }),
        }
    }

    /// Record received bytes; rolls the window when a second has elapsed.
    pub fn record(&self, bytes: usize) {
        let mut state = self.state.lock().expect("bandwidth meter poisoned");
        let elapsed = state.window_start.elapsed();
        if elapsed.as_secs() >= 1 {
            state.last_rate =
                (state.window_bytes as f64 / elapsed.as_secs_f64()) as u64;
            state.window_start = Instant::now();
            state.window_bytes = 0;
        }
        state.window_bytes += bytes as u64;
    }

    /// Bytes per second over the most recently completed window.
    pub fn bytes_per_sec(&self) -> u64 {
        self.state.lock().expect("bandwidth meter poisoned").last_rate
    }
}

impl Default for BandwidthMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = RelayMetrics::new();
        metrics.incr_codec_errors();
        metrics.incr_codec_errors();
        metrics.incr_no_route();
        assert_eq!(metrics.codec_errors.load(Ordering::Relaxed), 2);
        assert_eq!(metrics.no_route.load(Ordering::Relaxed), 1);
        assert_eq!(metrics.unknown_type.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn meter_rate_is_zero_before_first_window() {
        let meter = BandwidthMeter::new();
        meter.record(1500);
        meter.record(1500);
        assert_eq!(meter.bytes_per_sec(), 0);
    }
}

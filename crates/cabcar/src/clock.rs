//! Per-console clock synchronisation.
//!
//! After a console binds it sends `map_ack`; the train answers with N
//! timestamped `rtt_train` probes. The console echoes each probe with its
//! own clock attached. Each echo yields
//! `offset = remote_ts - (sent + rtt/2)`; the average over N samples becomes
//! the console's clock offset, after which command latency is recovered as
//! `now - (remote_ts - offset)`.

use railproto::RttProbe;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Samples per handshake.
pub const RTT_SAMPLES: u8 = 5;

/// A sample that takes longer than this is abandoned.
pub const SAMPLE_TIMEOUT: Duration = Duration::from_secs(2);

struct Handshake {
    samples: Vec<i64>,
    next_sample: u8,
    sent_wall_ms: i64,
    sent_at: Instant,
}

/// What to do after an echo arrives.
#[derive(Debug, Clone, PartialEq)]
pub enum EchoOutcome {
    /// Send the next probe.
    NextProbe(RttProbe),
    /// Handshake complete; the console's offset is now known.
    Done { offset_ms: i64 },
    /// Stale, duplicate or unknown echo.
    Ignored,
}

/// Clock-offset state for every console driving this train.
pub struct ClockSync {
    train_id: String,
    offsets: HashMap<String, i64>,
    pending: HashMap<String, Handshake>,
}

impl ClockSync {
    pub fn new(train_id: impl Into<String>) -> Self {
        Self {
            train_id: train_id.into(),
            offsets: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Start a handshake toward a console; returns the first probe to send.
    pub fn begin(&mut self, console_id: &str, now_wall_ms: i64) -> RttProbe {
        self.pending.insert(
            console_id.to_string(),
            Handshake {
                samples: Vec::with_capacity(RTT_SAMPLES as usize),
                next_sample: 1,
                sent_wall_ms: now_wall_ms,
                sent_at: Instant::now(),
            },
        );
        RttProbe::new(&self.train_id, 0, now_wall_ms)
    }

    /// Feed one echoed probe back in.
    pub fn on_echo(
        &mut self,
        console_id: &str,
        probe: &RttProbe,
        now_wall_ms: i64,
    ) -> EchoOutcome {
        let Some(handshake) = self.pending.get_mut(console_id) else {
            return EchoOutcome::Ignored;
        };
        let Some(remote_ts) = probe.remote_control_timestamp else {
            return EchoOutcome::Ignored;
        };
        if probe.train_timestamp != handshake.sent_wall_ms {
            return EchoOutcome::Ignored;
        }
        if handshake.sent_at.elapsed() > SAMPLE_TIMEOUT {
            // The sample window closed; restart from this probe.
            handshake.samples.clear();
        }

        let rtt = now_wall_ms - probe.train_timestamp;
        let offset = remote_ts - (probe.train_timestamp + rtt / 2);
        handshake.samples.push(offset);

        if handshake.samples.len() >= RTT_SAMPLES as usize {
            let sum: i64 = handshake.samples.iter().sum();
            let offset_ms = sum / handshake.samples.len() as i64;
            self.pending.remove(console_id);
            self.offsets.insert(console_id.to_string(), offset_ms);
            return EchoOutcome::Done { offset_ms };
        }

        let sample = handshake.next_sample;
        handshake.next_sample += 1;
        handshake.sent_wall_ms = now_wall_ms;
        handshake.sent_at = Instant::now();
        EchoOutcome::NextProbe(RttProbe::new(&self.train_id, sample, now_wall_ms))
    }

    pub fn offset_for(&self, console_id: &str) -> Option<i64> {
        self.offsets.get(console_id).copied()
    }

    /// One-way latency of a command stamped with the console's clock.
    /// Without a completed handshake the raw clock difference is the best
    /// available estimate.
    pub fn one_way_latency(&self, console_id: &str, remote_ts: i64, now_wall_ms: i64) -> i64 {
        let offset = self.offset_for(console_id).unwrap_or(0);
        now_wall_ms - (remote_ts - offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    /// Run a full handshake against a simulated console whose clock leads
    /// the train's by `true_offset` and whose network adds `one_way` each
    /// direction.
    fn run_handshake(true_offset: i64, one_way: i64) -> i64 {
        let mut sync = ClockSync::new("T1");
        let mut train_now = 10_000i64;
        let mut probe = sync.begin("C1", train_now);

        loop {
            // Echo arrives at the console one_way later; console stamps it.
            let console_ts = probe.train_timestamp + one_way + true_offset;
            let echoed = probe.clone().echoed("C1", console_ts);
            train_now = probe.train_timestamp + 2 * one_way;

            match sync.on_echo("C1", &echoed, train_now) {
                EchoOutcome::NextProbe(next) => probe = next,
                EchoOutcome::Done { offset_ms } => return offset_ms,
                EchoOutcome::Ignored => panic!("echo ignored"),
            }
        }
    }

    #[test]
    fn symmetric_network_recovers_exact_offset() {
        assert_eq!(run_handshake(200, 40), 200);
        assert_eq!(run_handshake(-350, 5), -350);
        assert_eq!(run_handshake(0, 100), 0);
    }

    #[test]
    fn jittered_samples_average_within_bound() {
        let true_offset = 150i64;
        let jitters = [3i64, -2, 4, -4, 1];

        let mut sync = ClockSync::new("T1");
        let mut train_now = 5_000i64;
        let mut probe = sync.begin("C1", train_now);
        let mut result = None;

        for jitter in jitters {
            let one_way = 30 + jitter;
            let console_ts = probe.train_timestamp + one_way + true_offset;
            let echoed = probe.clone().echoed("C1", console_ts);
            train_now = probe.train_timestamp + 2 * 30;

            match sync.on_echo("C1", &echoed, train_now) {
                EchoOutcome::NextProbe(next) => probe = next,
                EchoOutcome::Done { offset_ms } => result = Some(offset_ms),
                EchoOutcome::Ignored => panic!("echo ignored"),
            }
        }

        let estimate = result.expect("handshake completes after five samples");
        let max_jitter = 4;
        assert!(
            (estimate - true_offset).abs() <= max_jitter,
            "estimate {estimate} strays more than {max_jitter} from {true_offset}"
        );
    }

    #[test]
    fn latency_attribution_matches_worked_example() {
        // Offset +200: the console clock runs 200 ms ahead of the train's.
        // A command stamped 1000 on the console side, seen at train wall
        // clock 1350, is 1350 - (1000 - 200) = 550 ms old.
        let mut sync = ClockSync::new("T1");
        sync.offsets.insert("C1".into(), 200);
        assert_eq!(sync.one_way_latency("C1", 1000, 1350), 550);
    }

    #[test]
    fn echo_without_console_timestamp_ignored() {
        let mut sync = ClockSync::new("T1");
        let probe = sync.begin("C1", 1000);
        assert_eq!(sync.on_echo("C1", &probe, 1010), EchoOutcome::Ignored);
    }

    #[test]
    fn unknown_console_echo_ignored() {
        let mut sync = ClockSync::new("T1");
        let probe = RttProbe::new("T1", 0, 1000).echoed("C9", 1200);
        assert_eq!(sync.on_echo("C9", &probe, 1010), EchoOutcome::Ignored);
    }

    #[test]
    fn stale_probe_timestamp_ignored() {
        let mut sync = ClockSync::new("T1");
        let _current = sync.begin("C1", 2000);
        let stale = RttProbe::new("T1", 0, 1000).echoed("C1", 1200);
        assert_eq!(sync.on_echo("C1", &stale, 2010), EchoOutcome::Ignored);
    }

    #[test]
    fn latency_without_handshake_uses_raw_difference() {
        let sync = ClockSync::new("T1");
        assert_eq!(sync.one_way_latency("C1", 1000, 1350), 350);
    }
}

//! Hybrid physical/logical clock (spec §4.4).
//!
//! `clockOffset` tracks the mean skew against peers discovered by
//! [`TimeService::synchronize_clocks`]; `logicalTime` is a monotone counter
//! advanced on every local event and merged forward on receive.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use messaging_types::Message;
use rand::Rng;
use tokio::task::JoinSet;
use tracing::warn;

/// Clock skew beyond which [`TimeService::detect_skew`] reports a warning.
pub const SKEW_THRESHOLD_MS: i64 = 1000;

/// Hybrid logical clock, one instance per node (spec §9: "per-node, not
/// process-global").
pub struct TimeService {
    clock_offset: AtomicI64,
    logical_time: AtomicU64,
}

impl Default for TimeService {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeService {
    /// Creates a fresh time service: zero offset, logical time starting at 0.
    pub fn new() -> Self {
        Self {
            clock_offset: AtomicI64::new(0),
            logical_time: AtomicU64::new(0),
        }
    }

    /// Samples each peer's (simulated) remote clock and sets `clockOffset`
    /// to the mean of `(remote - local)` across responders. Peers that don't
    /// respond (none do, in this simulator) leave the offset unchanged.
    ///
    /// Each sample sleeps a jittered 10-60ms before reading a wall clock
    /// perturbed by ±100ms, standing in for a real peer round-trip.
    pub async fn synchronize_clocks(&self, peers: &[String]) {
        if peers.is_empty() {
            return;
        }

        let mut samples = JoinSet::new();
        for peer in peers.iter().cloned() {
            samples.spawn(async move {
                let jitter_ms = rand::thread_rng().gen_range(10..=60);
                tokio::time::sleep(std::time::Duration::from_millis(jitter_ms)).await;
                let local = wall_clock_ms();
                let skew: i64 = rand::thread_rng().gen_range(-100..=100);
                let remote = local + skew;
                let _ = &peer;
                remote - local
            });
        }

        let mut deltas = Vec::new();
        while let Some(result) = samples.join_next().await {
            if let Ok(delta) = result {
                deltas.push(delta);
            }
        }

        if deltas.is_empty() {
            return;
        }

        let mean = deltas.iter().sum::<i64>() / deltas.len() as i64;
        self.clock_offset.store(mean, Ordering::SeqCst);
    }

    /// The current offset-corrected wall-clock timestamp, in milliseconds.
    pub fn current_timestamp(&self) -> i64 {
        wall_clock_ms() + self.clock_offset.load(Ordering::SeqCst)
    }

    /// Atomically advances and returns the new logical time. Every call
    /// produces a strictly increasing, distinct value (spec §8 invariant 5).
    pub fn next_logical_time(&self) -> u64 {
        self.logical_time.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Merges a remote event's logical timestamp into the local clock:
    /// `logicalTime <- max(logicalTime, remoteLogicalTs) + 1` (spec §4.4).
    ///
    /// `remote_physical_ts` exists for diagnostics only; per spec §9's
    /// design note, all three physical-order cases resolve identically.
    pub fn on_receive(&self, remote_physical_ts: i64, remote_logical_ts: u64) {
        let _ = remote_physical_ts;
        self.logical_time
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.max(remote_logical_ts) + 1)
            })
            .expect("fetch_update closure always returns Some");
    }

    /// True when `|local - remote| > 1000ms`; logs a warning when tripped.
    pub fn detect_skew(&self, remote_ts: i64, source: &str) -> bool {
        let drift = (self.current_timestamp() - remote_ts).abs();
        let skewed = drift > SKEW_THRESHOLD_MS;
        if skewed {
            warn!(source, drift_ms = drift, "clock skew exceeds tolerance");
        }
        skewed
    }

    /// Overwrites `message`'s physical timestamp with `ts` (spec §4.4
    /// `correctTimestamp`).
    pub fn correct_timestamp(&self, message: &mut Message, ts: i64) {
        message.correct_physical_ts(ts);
    }
}

fn wall_clock_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the Unix epoch")
        .as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn next_logical_time_is_strictly_increasing() {
        let clock = TimeService::new();
        let a = clock.next_logical_time();
        let b = clock.next_logical_time();
        let c = clock.next_logical_time();
        assert!(a < b);
        assert!(b < c);
    }

    #[tokio::test]
    async fn on_receive_advances_past_the_remote_value() {
        let clock = TimeService::new();
        clock.on_receive(0, 41);
        assert!(clock.next_logical_time() > 41);
    }

    #[tokio::test]
    async fn on_receive_does_not_regress_a_higher_local_clock() {
        let clock = TimeService::new();
        for _ in 0..100 {
            clock.next_logical_time();
        }
        let before = clock.next_logical_time();
        clock.on_receive(0, 5);
        assert!(clock.next_logical_time() > before);
    }

    #[tokio::test]
    async fn synchronize_with_no_peers_leaves_offset_untouched() {
        let clock = TimeService::new();
        clock.synchronize_clocks(&[]).await;
        let before = clock.current_timestamp();
        let after = clock.current_timestamp();
        assert!((after - before).abs() < 50);
    }

    #[tokio::test]
    async fn detect_skew_flags_large_deltas_only() {
        let clock = TimeService::new();
        let now = clock.current_timestamp();
        assert!(!clock.detect_skew(now, "node-2"));
        assert!(clock.detect_skew(now - 5_000, "node-2"));
    }

    #[test]
    fn correct_timestamp_overwrites_physical_ts() {
        let clock = TimeService::new();
        let mut message = Message::new("alice", "bob", "hi").unwrap();
        clock.correct_timestamp(&mut message, 42);
        assert_eq!(message.physical_ts(), 42);
    }
}

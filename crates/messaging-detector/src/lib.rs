//! Debounced peer failure detector (spec §4.3).
//!
//! A single scheduled worker probes every configured peer, sequentially,
//! over a PING/PONG handshake on the application transport, and emits
//! `onNodeUp`/`onNodeDown` only after three consecutive confirmations in
//! the new direction — cheap insurance against a single dropped probe
//! flapping the membership view.

use std::io;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Probe cadence (spec §4.3).
pub const CHECK_INTERVAL: Duration = Duration::from_secs(3);
/// TCP connect timeout for a single probe.
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
/// Read timeout for the greeting + PONG.
pub const READ_TIMEOUT: Duration = Duration::from_millis(800);
/// Consecutive misses required before an UP peer is marked DOWN.
pub const DOWN_THRESHOLD: u32 = 3;
/// Consecutive successes required before a DOWN peer is marked UP.
pub const UP_THRESHOLD: u32 = 1;

/// Receives debounced up/down transitions.
///
/// Invocations are serialized and totally ordered per peer (spec §4.3); a
/// panicking listener is caught and logged, never aborting the scheduler.
pub trait FailureListener: Send + Sync {
    /// A peer debounced from down to up.
    fn on_node_up(&self, peer: &str);
    /// A peer debounced from up to down.
    fn on_node_down(&self, peer: &str);
}

struct NoopListener;
impl FailureListener for NoopListener {
    fn on_node_up(&self, _peer: &str) {}
    fn on_node_down(&self, _peer: &str) {}
}

impl<T: FailureListener> FailureListener for Arc<T> {
    fn on_node_up(&self, peer: &str) {
        T::on_node_up(self, peer);
    }
    fn on_node_down(&self, peer: &str) {
        T::on_node_down(self, peer);
    }
}

#[derive(Debug, Clone, Copy)]
struct PeerState {
    is_up: bool,
    fail_streak: u32,
    ok_streak: u32,
}

impl Default for PeerState {
    fn default() -> Self {
        Self {
            is_up: true,
            fail_streak: 0,
            ok_streak: 0,
        }
    }
}

/// Probes a fixed peer set and emits debounced up/down events.
pub struct FailureDetector {
    peers: Vec<String>,
    state: DashMap<String, PeerState>,
    listener: Box<dyn FailureListener>,
    running: Arc<AtomicBool>,
}

impl FailureDetector {
    /// Creates a detector for `peers` (each `host:port`) with no listener.
    pub fn new(peers: Vec<String>) -> Self {
        Self::with_listener(peers, Box::new(NoopListener))
    }

    /// Creates a detector that notifies `listener` on every transition.
    pub fn with_listener(peers: Vec<String>, listener: Box<dyn FailureListener>) -> Self {
        let state = DashMap::new();
        for peer in &peers {
            state.insert(peer.clone(), PeerState::default());
        }
        Self {
            peers,
            state,
            listener,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Whether `peer` is currently considered up (initially `true`).
    pub fn is_up(&self, peer: &str) -> bool {
        self.state.get(peer).map(|s| s.is_up).unwrap_or(true)
    }

    /// Spawns the scheduled probe loop on the current Tokio runtime.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let detector = Arc::clone(self);
        tokio::spawn(async move {
            while detector.running.load(Ordering::SeqCst) {
                detector.probe_all_once().await;
                tokio::time::sleep(CHECK_INTERVAL).await;
            }
        })
    }

    /// Stops the scheduled probe loop after its current sleep elapses.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Probes every peer once, sequentially, updating debounce state and
    /// firing listener callbacks on transitions. Exposed directly so tests
    /// can drive individual rounds without waiting on the scheduler.
    pub async fn probe_all_once(&self) {
        for peer in &self.peers {
            let success = probe_peer(peer).await.is_ok();
            self.record_probe(peer, success);
        }
    }

    fn record_probe(&self, peer: &str, success: bool) {
        let mut entry = self.state.entry(peer.to_string()).or_default();

        if success {
            entry.ok_streak += 1;
            entry.fail_streak = 0;
            if !entry.is_up && entry.ok_streak >= UP_THRESHOLD {
                entry.is_up = true;
                entry.ok_streak = 0;
                drop(entry);
                info!(peer, "peer transitioned up");
                self.notify_up(peer);
            }
        } else {
            entry.fail_streak += 1;
            entry.ok_streak = 0;
            if entry.is_up && entry.fail_streak >= DOWN_THRESHOLD {
                entry.is_up = false;
                entry.fail_streak = 0;
                drop(entry);
                warn!(peer, "peer transitioned down");
                self.notify_down(peer);
            }
        }
    }

    fn notify_up(&self, peer: &str) {
        if catch_unwind(AssertUnwindSafe(|| self.listener.on_node_up(peer))).is_err() {
            warn!(peer, "on_node_up listener panicked, continuing probe loop");
        }
    }

    fn notify_down(&self, peer: &str) {
        if catch_unwind(AssertUnwindSafe(|| self.listener.on_node_down(peer))).is_err() {
            warn!(peer, "on_node_down listener panicked, continuing probe loop");
        }
    }
}

/// Performs a single PING/PONG handshake against `peer`. Any I/O error or
/// protocol mismatch is a miss.
async fn probe_peer(peer: &str) -> io::Result<()> {
    let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(peer))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;

    let mut reader = BufReader::new(stream);

    let mut greeting = String::new();
    tokio::time::timeout(READ_TIMEOUT, reader.read_line(&mut greeting))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "greeting read timed out"))??;

    reader.get_mut().write_all(b"PING\n").await?;

    let mut reply = String::new();
    tokio::time::timeout(READ_TIMEOUT, reader.read_line(&mut reply))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "pong read timed out"))??;

    if reply.trim().eq_ignore_ascii_case("PONG") {
        debug!(peer, "probe succeeded");
        Ok(())
    } else {
        Err(io::Error::new(io::ErrorKind::InvalidData, "expected PONG"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct RecordingListener {
        ups: Mutex<Vec<String>>,
        downs: Mutex<Vec<String>>,
    }

    impl FailureListener for RecordingListener {
        fn on_node_up(&self, peer: &str) {
            self.ups.lock().unwrap().push(peer.to_string());
        }
        fn on_node_down(&self, peer: &str) {
            self.downs.lock().unwrap().push(peer.to_string());
        }
    }

    async fn spawn_healthy_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else {
                    return;
                };
                tokio::spawn(async move {
                    let _ = socket.write_all(b"READY\n").await;
                    let mut buf = [0u8; 16];
                    let _ = socket.read(&mut buf).await;
                    let _ = socket.write_all(b"PONG\n").await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn s6_three_consecutive_misses_trigger_exactly_one_down_event() {
        // Port 1 is very unlikely to have a listener in the sandbox.
        let dead_peer = "127.0.0.1:1".to_string();
        let listener = Arc::new(RecordingListener::default());
        let detector = FailureDetector::with_listener(vec![dead_peer.clone()], Box::new(listener.clone()));

        detector.probe_all_once().await;
        detector.probe_all_once().await;
        assert!(detector.is_up(&dead_peer));
        assert!(listener.downs.lock().unwrap().is_empty());

        detector.probe_all_once().await;
        assert!(!detector.is_up(&dead_peer));
        assert_eq!(listener.downs.lock().unwrap().as_slice(), [dead_peer.clone()]);

        // A fourth consecutive miss must not re-fire the down event.
        detector.probe_all_once().await;
        assert_eq!(listener.downs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn recovers_and_emits_up_after_success() {
        let addr = spawn_healthy_server().await;
        let detector = Arc::new(FailureDetector::new(vec![addr.clone()]));

        detector.probe_all_once().await;
        assert!(detector.is_up(&addr));
    }
}

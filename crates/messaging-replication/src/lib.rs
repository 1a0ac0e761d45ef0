//! Quorum write/read replication engine (spec §4.2).
//!
//! `N` simulated per-replica stores back a single stabilized store: a write
//! only lands in the stabilized store once a majority of replicas
//! acknowledge it, and a read returns the plurality value seen across a
//! majority of replica responses (falling back to the stabilized store when
//! a replica reports a miss).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Hard deadline for collecting a write or read quorum (spec §4.2/§5).
const QUORUM_DEADLINE: Duration = Duration::from_secs(2);

/// Replica failure probability on both the write and (independently) the
/// read path, per spec §4.2.
const WRITE_FAILURE_PROBABILITY: f64 = 0.08;
const READ_MISS_PROBABILITY: f64 = 0.05;

/// Quorum replication engine for a fixed-size cluster of `N` simulated
/// replicas.
pub struct ReplicationEngine {
    total_nodes: usize,
    write_quorum: usize,
    read_quorum: usize,
    replicas: Vec<Arc<DashMap<String, String>>>,
    stabilized: Arc<DashMap<String, String>>,
    dedup: Arc<DashSet<String>>,
    write_dispatch_count: AtomicUsize,
}

/// `⌊N/2⌋ + 1`: the strict majority required for both write and read
/// quorums (spec §4.2).
pub fn quorum_size(total_nodes: usize) -> usize {
    total_nodes / 2 + 1
}

impl ReplicationEngine {
    /// Builds an engine with `total_nodes` simulated replicas.
    pub fn new(total_nodes: usize) -> Self {
        let replicas = (0..total_nodes.max(1))
            .map(|_| Arc::new(DashMap::new()))
            .collect();
        Self {
            total_nodes: total_nodes.max(1),
            write_quorum: quorum_size(total_nodes.max(1)),
            read_quorum: quorum_size(total_nodes.max(1)),
            replicas,
            stabilized: Arc::new(DashMap::new()),
            dedup: Arc::new(DashSet::new()),
            write_dispatch_count: AtomicUsize::new(0),
        }
    }

    /// Number of messages currently in the stabilized store.
    pub fn stabilized_count(&self) -> usize {
        self.stabilized.len()
    }

    /// Total simulated write dispatches issued so far (test observability
    /// for spec §8 scenario S2: a deduped write issues zero dispatches).
    pub fn write_dispatch_count(&self) -> usize {
        self.write_dispatch_count.load(Ordering::SeqCst)
    }

    /// Quorum write (spec §4.2 `writeMessage`).
    ///
    /// Rejects a blank id; is idempotent for ids already deduped; otherwise
    /// dispatches `N` simulated writes and stabilizes on a majority.
    pub async fn write_message(&self, id: &str, content: &str) -> bool {
        if id.trim().is_empty() {
            warn!("rejecting write with blank message id");
            return false;
        }

        if self.dedup.contains(id) {
            debug!(id, "duplicate write accepted idempotently");
            return true;
        }

        let (tx, mut rx) = mpsc::channel(self.total_nodes);
        for replica in &self.replicas {
            let replica = Arc::clone(replica);
            let tx = tx.clone();
            let id = id.to_string();
            let content = content.to_string();
            self.write_dispatch_count.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                let ok = simulate_write(&replica, &id, &content).await;
                let _ = tx.send(ok).await;
            });
        }
        drop(tx);

        let write_quorum = self.write_quorum;
        let quorum_met = tokio::time::timeout(QUORUM_DEADLINE, async move {
            let mut successes = 0;
            while successes < write_quorum {
                match rx.recv().await {
                    Some(true) => successes += 1,
                    Some(false) => {}
                    None => break,
                }
            }
            successes >= write_quorum
        })
        .await
        .unwrap_or(false);

        if quorum_met {
            self.stabilized.insert(id.to_string(), content.to_string());
            self.dedup.insert(id.to_string());
            debug!(id, "write quorum met, stabilized");
            true
        } else {
            warn!(id, "write quorum not met within deadline");
            false
        }
    }

    /// Quorum read (spec §4.2 `readMessage`): returns the plurality value
    /// across a majority of replica responses, or `None` if a majority
    /// couldn't be collected within the deadline.
    pub async fn read_message(&self, id: &str) -> Option<String> {
        let (tx, mut rx) = mpsc::channel(self.total_nodes);
        for replica in &self.replicas {
            let replica = Arc::clone(replica);
            let stabilized = Arc::clone(&self.stabilized);
            let tx = tx.clone();
            let id = id.to_string();
            tokio::spawn(async move {
                let value = simulate_read(&replica, &stabilized, &id).await;
                let _ = tx.send(value).await;
            });
        }
        drop(tx);

        let read_quorum = self.read_quorum;
        let responses = tokio::time::timeout(QUORUM_DEADLINE, async move {
            let mut responses = Vec::new();
            while responses.len() < read_quorum {
                match rx.recv().await {
                    Some(Some(value)) => responses.push(value),
                    Some(None) => {}
                    None => break,
                }
            }
            responses
        })
        .await
        .unwrap_or_default();

        if responses.len() < self.read_quorum {
            warn!(id, collected = responses.len(), "read quorum not met within deadline");
            return None;
        }

        Some(plurality(&responses))
    }
}

/// Returns the most frequent value in `responses`; ties are broken by
/// first-seen order (spec §4.2).
fn plurality(responses: &[String]) -> String {
    let mut counts: Vec<(String, usize)> = Vec::new();
    for response in responses {
        if let Some(entry) = counts.iter_mut().find(|(value, _)| value == response) {
            entry.1 += 1;
        } else {
            counts.push((response.clone(), 1));
        }
    }
    // `Iterator::max_by_key` returns the *last* maximum on a tie, which
    // would break first-seen order; fold with a strict `>` instead so the
    // first-inserted max wins.
    let mut best: Option<(String, usize)> = None;
    for (value, count) in counts {
        match &best {
            Some((_, best_count)) if count <= *best_count => {}
            _ => best = Some((value, count)),
        }
    }
    best.map(|(value, _)| value).expect("responses is non-empty")
}

async fn simulate_write(replica: &DashMap<String, String>, id: &str, content: &str) -> bool {
    let jitter_ms = rand::thread_rng().gen_range(40..=160);
    tokio::time::sleep(Duration::from_millis(jitter_ms)).await;

    if rand::thread_rng().gen_bool(WRITE_FAILURE_PROBABILITY) {
        return false;
    }

    replica.insert(id.to_string(), content.to_string());
    true
}

async fn simulate_read(
    replica: &DashMap<String, String>,
    stabilized: &DashMap<String, String>,
    id: &str,
) -> Option<String> {
    let jitter_ms = rand::thread_rng().gen_range(25..=120);
    tokio::time::sleep(Duration::from_millis(jitter_ms)).await;

    if rand::thread_rng().gen_bool(READ_MISS_PROBABILITY) {
        return None;
    }

    match replica.get(id) {
        Some(value) => Some(value.clone()),
        // Eventual-consistency fallback (spec §4.2, §9 design note): a
        // replica that never participated in the write can still "see" the
        // value through the stabilized store.
        None => stabilized.get(id).map(|value| value.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn s1_quorum_write_then_read_majority() {
        let engine = ReplicationEngine::new(3);
        assert!(engine.write_message("m1", "hi").await);
        assert_eq!(engine.stabilized_count(), 1);
        assert_eq!(engine.read_message("m1").await.as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn s2_duplicate_write_is_idempotent_and_dispatch_free() {
        let engine = ReplicationEngine::new(3);
        assert!(engine.write_message("m1", "hi").await);
        let dispatches_before = engine.write_dispatch_count();
        let stabilized_before = engine.stabilized_count();

        assert!(engine.write_message("m1", "hi").await);

        assert_eq!(engine.stabilized_count(), stabilized_before);
        assert_eq!(engine.write_dispatch_count(), dispatches_before);
    }

    #[tokio::test]
    async fn rejects_blank_message_id() {
        let engine = ReplicationEngine::new(3);
        assert!(!engine.write_message("", "hi").await);
        assert_eq!(engine.stabilized_count(), 0);
    }

    #[tokio::test]
    async fn read_of_unknown_id_eventually_returns_none_or_fallback() {
        let engine = ReplicationEngine::new(3);
        // Nothing written and nothing stabilized: every replica misses or
        // returns nothing from the stabilized store, so quorum cannot form.
        let result = engine.read_message("never-written").await;
        assert!(result.is_none());
    }

    #[test]
    fn quorum_size_is_strict_majority() {
        assert_eq!(quorum_size(1), 1);
        assert_eq!(quorum_size(2), 2);
        assert_eq!(quorum_size(3), 2);
        assert_eq!(quorum_size(5), 3);
    }

    #[test]
    fn plurality_breaks_ties_by_first_seen_order() {
        let responses = vec!["b".to_string(), "a".to_string(), "b".to_string(), "a".to_string()];
        // "b" and "a" are tied at 2 each; "b" was seen first.
        assert_eq!(plurality(&responses), "b");
    }

    #[test]
    fn plurality_picks_the_strict_majority_value() {
        let responses = vec!["x".to_string(), "y".to_string(), "x".to_string()];
        assert_eq!(plurality(&responses), "x");
    }
}

//! Leader election and live-membership tracking on an external coordination
//! service (spec §4.1).
//!
//! Each node creates an `EPHEMERAL_SEQUENTIAL` child of `/leader`; the node
//! whose child has the smallest sequence suffix is leader. Followers watch
//! only their immediate predecessor, so exactly one node re-evaluates per
//! predecessor departure (the "watch-predecessor" pattern, after Apache
//! Curator's `LeaderSelector`).

mod error;
mod state;

pub use error::{Error, Result};
pub use state::CoordinatorState;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Mutex as AsyncMutex, Notify};
use tracing::{debug, info, warn};
use zookeeper::{Acl, CreateMode, WatchedEvent, WatchedEventType, Watcher, ZkError, ZkState, ZooKeeper};

const ROOT: &str = "/messaging-system";
const NODES_PATH: &str = "/messaging-system/nodes";
const LEADER_PATH: &str = "/messaging-system/leader";
const MESSAGES_PATH: &str = "/messaging-system/messages";
const CONFIG_PATH: &str = "/messaging-system/config";
const LEADER_CANDIDATE_PREFIX: &str = "node-";

/// Coordinates leader election, membership, and leader-only metadata writes
/// for one node against an external ZooKeeper-compatible coordination
/// service.
pub struct Coordinator {
    node_id: String,
    coord_address: String,
    session_timeout: Duration,

    zk: AsyncMutex<Option<Arc<ZooKeeper>>>,
    state: AsyncMutex<CoordinatorState>,
    own_candidate_path: AsyncMutex<Option<String>>,
    current_leader: AsyncMutex<Option<String>>,

    leader_signaled: AtomicBool,
    leader_notify: Notify,

    election_events: AsyncMutex<Option<mpsc::UnboundedReceiver<()>>>,
    election_tx: mpsc::UnboundedSender<()>,

    session_events: AsyncMutex<Option<mpsc::UnboundedReceiver<()>>>,
    session_tx: mpsc::UnboundedSender<()>,
}

impl Coordinator {
    /// Creates a coordinator for `node_id` against the coordination service
    /// at `coord_address` (e.g. `localhost:2181`).
    pub fn new(node_id: impl Into<String>, coord_address: impl Into<String>) -> Arc<Self> {
        let (election_tx, election_rx) = mpsc::unbounded_channel();
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            node_id: node_id.into(),
            coord_address: coord_address.into(),
            session_timeout: Duration::from_secs(10),
            zk: AsyncMutex::new(None),
            state: AsyncMutex::new(CoordinatorState::Disconnected),
            own_candidate_path: AsyncMutex::new(None),
            current_leader: AsyncMutex::new(None),
            leader_signaled: AtomicBool::new(false),
            leader_notify: Notify::new(),
            election_events: AsyncMutex::new(Some(election_rx)),
            election_tx,
            session_events: AsyncMutex::new(Some(session_rx)),
            session_tx,
        })
    }

    /// Establishes a session, creates base paths if missing, registers this
    /// node, and enters the election.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        self.open_session().await?;
        self.register_and_enter_election(true).await?;
        self.spawn_election_watcher();
        self.spawn_session_watcher();
        Ok(())
    }

    /// Opens (or re-opens) the coordination-service session and ensures the
    /// base paths exist.
    async fn open_session(self: &Arc<Self>) -> Result<()> {
        *self.state.lock().await = CoordinatorState::Connecting;

        let coord_address = self.coord_address.clone();
        let session_timeout = self.session_timeout;
        let tx = self.session_tx.clone();
        let zk = tokio::task::spawn_blocking(move || {
            ZooKeeper::connect(&coord_address, session_timeout, SessionWatcher { tx })
        })
        .await
        .map_err(|e| Error::Session(e.to_string()))?
        .map_err(|e| Error::Session(e.to_string()))?;
        let zk = Arc::new(zk);
        *self.zk.lock().await = Some(Arc::clone(&zk));

        for path in [ROOT, NODES_PATH, LEADER_PATH, MESSAGES_PATH, CONFIG_PATH] {
            create_persistent_idempotent(&zk, path).await?;
        }

        Ok(())
    }

    /// Registers this node's ephemeral znode, creates a fresh election
    /// candidate, and evaluates the election. Used both by the initial
    /// `connect` and by `reconnect` after a session expiry (spec §7
    /// `CoordinationSessionLoss`).
    async fn register_and_enter_election(self: &Arc<Self>, is_initial: bool) -> Result<()> {
        let zk = self
            .zk
            .lock()
            .await
            .clone()
            .ok_or_else(|| Error::Session("no active session".to_string()))?;

        let node_path = format!("{NODES_PATH}/{}", self.node_id);
        let node_id = self.node_id.clone();
        let zk_for_register = Arc::clone(&zk);
        tokio::task::spawn_blocking(move || {
            zk_for_register.create(
                &node_path,
                node_id.into_bytes(),
                Acl::open_unsafe().clone(),
                CreateMode::Ephemeral,
            )
        })
        .await
        .map_err(|e| Error::Session(e.to_string()))?
        .map(|_| ())
        .or_else(ignore_node_exists)
        .map_err(|e| Error::Session(e.to_string()))?;

        *self.state.lock().await = CoordinatorState::Registered;

        let candidate_prefix = format!("{LEADER_PATH}/{LEADER_CANDIDATE_PREFIX}");
        let node_id = self.node_id.clone();
        let zk_for_candidate = Arc::clone(&zk);
        let candidate_path = tokio::task::spawn_blocking(move || {
            zk_for_candidate.create(
                &candidate_prefix,
                node_id.into_bytes(),
                Acl::open_unsafe().clone(),
                CreateMode::EphemeralSequential,
            )
        })
        .await
        .map_err(|e| Error::Session(e.to_string()))?
        .map_err(|e| Error::Session(e.to_string()))?;
        *self.own_candidate_path.lock().await = Some(candidate_path);

        self.evaluate_election(is_initial).await
    }

    /// Handles a session-expired notification: closes the stale session,
    /// opens a new one, recreates base paths, re-registers, and re-enters
    /// election. The leader latch is **not** re-armed (spec §9 design note).
    async fn reconnect(self: &Arc<Self>) -> Result<()> {
        warn!(node = %self.node_id, "coordination session lost, reconnecting");
        self.zk.lock().await.take();
        *self.state.lock().await = CoordinatorState::Disconnected;

        self.open_session().await?;
        self.register_and_enter_election(false).await
    }

    fn spawn_session_watcher(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut rx = match coordinator.session_events.lock().await.take() {
                Some(rx) => rx,
                None => return,
            };
            while rx.recv().await.is_some() {
                if let Err(err) = coordinator.reconnect().await {
                    warn!(error = %err, "session reconnect failed");
                }
            }
        });
    }

    /// Blocks until the initial election has produced an authoritative
    /// leader (self or another node). Per spec §9, the latch is signaled at
    /// most once per process lifetime; a second call never blocks.
    pub async fn wait_for_leadership(&self) {
        if self.leader_signaled.load(Ordering::SeqCst) {
            return;
        }
        self.leader_notify.notified().await;
    }

    /// True if this node is the current leader.
    pub async fn is_leader(&self) -> bool {
        let state = *self.state.lock().await;
        state == CoordinatorState::Leader
    }

    /// The current leader's node id, if known.
    pub async fn current_leader(&self) -> Option<String> {
        self.current_leader.lock().await.clone()
    }

    /// A snapshot of currently-registered node ids.
    pub async fn live_nodes(&self) -> Vec<String> {
        let Some(zk) = self.zk.lock().await.clone() else {
            return Vec::new();
        };
        tokio::task::spawn_blocking(move || zk.get_children(NODES_PATH, false))
            .await
            .ok()
            .and_then(|r| r.ok())
            .unwrap_or_default()
    }

    /// Writes `/messages/<messageId>` with the given payload. Callable only
    /// when this node is leader; otherwise a silent no-op (spec §4.1/§7
    /// `LeaderMutationFromNonLeader`). A duplicate write is a benign no-op.
    pub async fn store_message_metadata(&self, message_id: &str, payload: &str) {
        if !self.is_leader().await {
            debug!(message_id, "skipping metadata write: not leader");
            return;
        }
        let Some(zk) = self.zk.lock().await.clone() else {
            warn!("skipping metadata write: no active session");
            return;
        };

        let path = format!("{MESSAGES_PATH}/{message_id}");
        let payload = payload.as_bytes().to_vec();
        let result = tokio::task::spawn_blocking(move || {
            zk.create(&path, payload, Acl::open_unsafe().clone(), CreateMode::Persistent)
        })
        .await;

        match result {
            Ok(Ok(_)) => debug!(message_id, "stored message metadata"),
            Ok(Err(ZkError::NodeExists)) => debug!(message_id, "message metadata already stored"),
            Ok(Err(err)) => warn!(message_id, error = %err, "failed to store message metadata"),
            Err(err) => warn!(message_id, error = %err, "metadata write task panicked"),
        }
    }

    /// Best-effort deletion of owned ephemerals, then session close.
    pub async fn close(&self) {
        let Some(zk) = self.zk.lock().await.take() else {
            return;
        };

        let node_path = format!("{NODES_PATH}/{}", self.node_id);
        let candidate_path = self.own_candidate_path.lock().await.clone();

        let _ = tokio::task::spawn_blocking({
            let zk = Arc::clone(&zk);
            move || zk.delete(&node_path, None)
        })
        .await;

        if let Some(candidate_path) = candidate_path {
            let _ = tokio::task::spawn_blocking({
                let zk = Arc::clone(&zk);
                move || zk.delete(&candidate_path, None)
            })
            .await;
        }

        let _ = tokio::task::spawn_blocking(move || zk.close()).await;
        *self.state.lock().await = CoordinatorState::Closed;
    }

    fn spawn_election_watcher(self: &Arc<Self>) {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut rx = match coordinator.election_events.lock().await.take() {
                Some(rx) => rx,
                None => return,
            };
            while rx.recv().await.is_some() {
                if let Err(err) = coordinator.evaluate_election(false).await {
                    warn!(error = %err, "election re-evaluation failed");
                }
            }
        });
    }

    /// Re-lists `/leader`'s children, sorts by sequence suffix, and
    /// determines whether this node is now leader. If not, (re-)arms a
    /// watch on the immediate predecessor only.
    async fn evaluate_election(self: &Arc<Self>, is_initial: bool) -> Result<()> {
        let Some(zk) = self.zk.lock().await.clone() else {
            return Ok(());
        };

        let children = tokio::task::spawn_blocking(move || zk.get_children(LEADER_PATH, false))
            .await
            .map_err(|e| Error::Session(e.to_string()))?
            .map_err(|e| Error::Session(e.to_string()))?;

        let mut ordered = children;
        ordered.sort();

        let own_candidate_path = self.own_candidate_path.lock().await.clone();
        let own_child = own_candidate_path
            .as_deref()
            .and_then(|p| p.rsplit('/').next())
            .map(str::to_string);

        let Some(own_child) = own_child else {
            return Err(Error::OwnCandidateMissing);
        };

        let Some(own_index) = ordered.iter().position(|c| *c == own_child) else {
            warn!("own election candidate missing from /leader children, rejoining");
            return Err(Error::OwnCandidateMissing);
        };

        if own_index == 0 {
            *self.state.lock().await = CoordinatorState::Leader;
            *self.current_leader.lock().await = Some(self.node_id.clone());
            info!(node = %self.node_id, "elected leader");
        } else {
            let leader_child = ordered[0].clone();
            let leader_id = self.read_candidate_data(&leader_child).await;
            *self.state.lock().await = CoordinatorState::Follower;
            *self.current_leader.lock().await = leader_id.clone();
            info!(node = %self.node_id, leader = ?leader_id, "following");

            let predecessor_child = ordered[own_index - 1].clone();
            self.watch_predecessor(&predecessor_child).await;
        }

        if is_initial && self.leader_signaled.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok() {
            self.leader_notify.notify_waiters();
        }

        Ok(())
    }

    async fn read_candidate_data(&self, child: &str) -> Option<String> {
        let zk = self.zk.lock().await.clone()?;
        let path = format!("{LEADER_PATH}/{child}");
        tokio::task::spawn_blocking(move || zk.get_data(&path, false))
            .await
            .ok()?
            .ok()
            .map(|(data, _stat)| String::from_utf8_lossy(&data).into_owned())
    }

    async fn watch_predecessor(&self, child: &str) {
        let Some(zk) = self.zk.lock().await.clone() else {
            return;
        };
        let path = format!("{LEADER_PATH}/{child}");
        let tx = self.election_tx.clone();
        let _ = tokio::task::spawn_blocking(move || {
            zk.exists_w(&path, move |event: WatchedEvent| {
                if event.event_type == WatchedEventType::NodeDeleted {
                    let _ = tx.send(());
                }
            })
        })
        .await;
    }
}

/// Forwards the coordination service's session-expired notification into a
/// channel so the reconnect path can be driven from async context (spec §7
/// `CoordinationSessionLoss`).
struct SessionWatcher {
    tx: mpsc::UnboundedSender<()>,
}

impl Watcher for SessionWatcher {
    fn handle(&self, event: WatchedEvent) {
        if event.keeper_state == ZkState::Expired {
            let _ = self.tx.send(());
        }
    }
}

async fn create_persistent_idempotent(zk: &Arc<ZooKeeper>, path: &str) -> Result<()> {
    let zk = Arc::clone(zk);
    let owned_path = path.to_string();
    let task_path = owned_path.clone();
    let result = tokio::task::spawn_blocking(move || {
        zk.create(&task_path, Vec::new(), Acl::open_unsafe().clone(), CreateMode::Persistent)
    })
    .await
    .map_err(|e| Error::Session(e.to_string()))?;

    result.map(|_| ()).or_else(ignore_node_exists).map_err(|e| Error::BasePath {
        path: owned_path,
        source: e.to_string(),
    })
}

fn ignore_node_exists(err: ZkError) -> std::result::Result<(), ZkError> {
    match err {
        ZkError::NodeExists => Ok(()),
        other => Err(other),
    }
}

/// Shape of the live-nodes-to-address mapping used by CLI bootstrap (spec
/// §6): `node-<k>` maps to `localhost:(7200+k)`.
pub fn default_peer_address(node_id: &str) -> Option<String> {
    let id: messaging_types::NodeId = node_id.parse().ok()?;
    Some(format!("localhost:{}", id.default_port()))
}

/// Builds the `node-id -> address` map for a live-node snapshot, skipping
/// any malformed ids (defensive against a stale/foreign registration).
pub fn peer_addresses(live_nodes: &[String]) -> HashMap<String, String> {
    live_nodes
        .iter()
        .filter_map(|id| default_peer_address(id).map(|addr| (id.clone(), addr)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_peer_address_maps_node_k_to_720k_port() {
        assert_eq!(default_peer_address("node-1").as_deref(), Some("localhost:7201"));
        assert_eq!(default_peer_address("node-3").as_deref(), Some("localhost:7203"));
        assert_eq!(default_peer_address("garbage"), None);
    }

    #[test]
    fn peer_addresses_skips_malformed_ids() {
        let live = vec!["node-1".to_string(), "not-a-node".to_string(), "node-2".to_string()];
        let addrs = peer_addresses(&live);
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs.get("node-1").map(String::as_str), Some("localhost:7201"));
    }
}

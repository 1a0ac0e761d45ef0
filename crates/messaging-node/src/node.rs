//! The node aggregate: owns one instance of each core component and
//! implements the write/forward data flow (spec §2).
//!
//! Wire format for client- and follower-submitted content lines:
//! `<sender>|<receiver>|<content>`, matching the pipe-delimited convention
//! used elsewhere on this transport (spec §6).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use messaging_clock::TimeService;
use messaging_coordinator::Coordinator;
use messaging_detector::FailureDetector;
use messaging_replication::ReplicationEngine;
use messaging_sequencer::{DeliveryListener, Sequencer};
use messaging_transport::{MessageHandler, TransportServer};
use messaging_types::{conversation_id, Message, NodeId};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{info, warn};

use crate::config::NodeConfig;

/// Timeout for a follower's forward-to-leader hop (spec §4.6).
const FORWARD_TIMEOUT: Duration = Duration::from_millis(800);

struct DeliveryLogger;
impl DeliveryListener for DeliveryLogger {
    fn on_deliver(&self, message: &Message) {
        info!(
            id = message.id(),
            conversation = %conversation_id(message.sender(), message.receiver()),
            logical_ts = message.logical_ts(),
            "message delivered"
        );
    }
}

/// Owns one instance each of the clock, sequencer, replication engine, and
/// failure detector, plus an optional coordinator and the node's transport
/// server. Per spec §9 these are per-node state, never shared globally
/// across a process hosting multiple nodes.
pub struct Node {
    node_id: NodeId,
    config: NodeConfig,
    time: Arc<TimeService>,
    sequencer: Arc<Sequencer>,
    replication: Arc<ReplicationEngine>,
    detector: AsyncMutex<Option<Arc<FailureDetector>>>,
    coordinator: Option<Arc<Coordinator>>,
    transport: AsyncMutex<Option<TransportServer>>,
    accepting: AtomicBool,
}

impl Node {
    /// Builds (but does not start) a node from resolved configuration.
    pub fn new(config: NodeConfig) -> Arc<Self> {
        let node_id = config.node_id;
        let coordinator = config
            .coord_address
            .as_ref()
            .map(|addr| Coordinator::new(node_id.to_string(), addr.clone()));

        Arc::new(Self {
            node_id,
            replication: Arc::new(ReplicationEngine::new(config.total_nodes)),
            sequencer: Arc::new(Sequencer::with_listener(Box::new(DeliveryLogger))),
            time: Arc::new(TimeService::new()),
            coordinator,
            detector: AsyncMutex::new(None),
            config,
            transport: AsyncMutex::new(None),
            accepting: AtomicBool::new(true),
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The peer address set to probe and synchronize clocks against: when a
    /// coordinator is configured, discovered from its live-nodes list by
    /// mapping `node-<k>` to `localhost:(7200+k)` (spec §6); otherwise the
    /// operator-supplied static peer list.
    async fn discover_peers(&self) -> Vec<String> {
        let Some(coordinator) = &self.coordinator else {
            return self.config.static_peers.clone();
        };
        let live_nodes = coordinator.live_nodes().await;
        messaging_coordinator::peer_addresses(&live_nodes)
            .into_values()
            .collect()
    }

    /// Binds the transport server, connects to the coordination service (if
    /// configured), discovers peers (spec §6), synchronizes clocks against
    /// them, and starts the failure detector's scheduled probe loop.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        let addr = format!("0.0.0.0:{}", self.config.port);
        let handler = Arc::clone(self) as Arc<dyn MessageHandler>;
        let (server, bound_addr) = TransportServer::bind(addr, handler).await?;
        *self.transport.lock().await = Some(server);
        info!(node = %self.node_id, addr = %bound_addr, "transport listening");

        if let Some(coordinator) = &self.coordinator {
            coordinator.connect().await?;
            coordinator.wait_for_leadership().await;
            info!(
                node = %self.node_id,
                leader = ?coordinator.current_leader().await,
                "election settled"
            );
        }

        let peers = self.discover_peers().await;
        self.time.synchronize_clocks(&peers).await;

        let detector = Arc::new(FailureDetector::new(peers));
        detector.start();
        *self.detector.lock().await = Some(detector);

        Ok(())
    }

    /// Whether this node currently believes itself to be the leader. With no
    /// coordinator configured, every node acts as its own leader (spec §9:
    /// standalone mode has no follower role).
    pub async fn is_leader(&self) -> bool {
        match &self.coordinator {
            Some(coordinator) => coordinator.is_leader().await,
            None => true,
        }
    }

    /// The current leader's node id, if known. In standalone mode (no
    /// coordinator configured) this node always considers itself leader.
    pub async fn current_leader(&self) -> Option<String> {
        match &self.coordinator {
            Some(coordinator) => coordinator.current_leader().await,
            None => Some(self.node_id.to_string()),
        }
    }

    /// The resolved address of the current leader, if this node is a
    /// follower and the leader is known and reachable via the default port
    /// convention (spec §6).
    async fn leader_address(&self) -> Option<String> {
        let coordinator = self.coordinator.as_ref()?;
        let leader_id = coordinator.current_leader().await?;
        messaging_coordinator::default_peer_address(&leader_id)
    }

    /// Submits a new message for `receiver` from `sender`. On the leader (or
    /// in standalone mode) this stamps, replicates, records metadata, and
    /// sequences the message locally. On a follower it forwards the raw
    /// content to the leader over the transport (spec §2).
    pub async fn submit(&self, sender: &str, receiver: &str, content: &str) -> anyhow::Result<bool> {
        if self.is_leader().await {
            self.ingest(sender, receiver, content).await;
            return Ok(true);
        }

        let Some(leader_addr) = self.leader_address().await else {
            warn!(node = %self.node_id, "no known leader to forward to");
            return Ok(false);
        };

        let line = format!("{sender}|{receiver}|{content}");
        messaging_transport::send_message(&leader_addr, &line, FORWARD_TIMEOUT).await?;
        Ok(true)
    }

    /// Leader-side ingestion: stamp with physical+logical time, replicate to
    /// quorum, record metadata in the coordination service, then sequence
    /// for in-order delivery (spec §2).
    async fn ingest(&self, sender: &str, receiver: &str, content: &str) {
        let mut message = match Message::new(sender, receiver, content) {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "rejected malformed message");
                return;
            }
        };

        let physical_ts = self.time.current_timestamp();
        self.time.correct_timestamp(&mut message, physical_ts);
        message.set_logical_ts(self.time.next_logical_time());

        self.replication
            .write_message(message.id(), message.content())
            .await;

        if let Some(coordinator) = &self.coordinator {
            coordinator
                .store_message_metadata(message.id(), &metadata_payload(&message))
                .await;
        }

        self.sequencer.queue_message(message);
    }

    /// Reads a message's replicated content via the quorum read path.
    pub async fn read(&self, message_id: &str) -> Option<String> {
        self.replication.read_message(message_id).await
    }

    /// Whether `peer` (a node id or a raw `host:port` address) is currently
    /// considered reachable by the failure detector.
    pub async fn is_peer_up(&self, peer: &str) -> bool {
        let addr = messaging_coordinator::default_peer_address(peer).unwrap_or_else(|| peer.to_string());
        match self.detector.lock().await.as_ref() {
            Some(detector) => detector.is_up(&addr),
            None => true,
        }
    }

    /// Number of messages currently stabilized in the replication engine.
    pub fn stabilized_count(&self) -> usize {
        self.replication.stabilized_count()
    }

    /// A snapshot of currently-registered node ids, via the coordination
    /// service if configured, otherwise the static peer list.
    pub async fn live_nodes(&self) -> Vec<String> {
        match &self.coordinator {
            Some(coordinator) => coordinator.live_nodes().await,
            None => self.config.static_peers.clone(),
        }
    }

    /// Graceful shutdown: stops accepting new connections, stops the failure
    /// detector's scheduled worker, and closes the coordinator session
    /// (spec §1).
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        if let Some(detector) = self.detector.lock().await.as_ref() {
            detector.stop();
        }
        if let Some(server) = self.transport.lock().await.take() {
            server.stop();
        }
        if let Some(coordinator) = &self.coordinator {
            coordinator.close().await;
        }
        info!(node = %self.node_id, "node shut down");
    }
}

impl MessageHandler for Node {
    /// Handles one raw content line received over the transport: either a
    /// client submission or a follower's forwarded write. Errors are logged
    /// and swallowed — the transport layer has already sent `ACK` by the
    /// time this runs synchronously inside the connection task (spec §7:
    /// never throw to callers).
    fn handle(&self, line: &str) {
        let Some((sender, rest)) = line.split_once('|') else {
            warn!(line, "malformed content line, expected sender|receiver|content");
            return;
        };
        let Some((receiver, content)) = rest.split_once('|') else {
            warn!(line, "malformed content line, expected sender|receiver|content");
            return;
        };

        let sender = sender.to_string();
        let receiver = receiver.to_string();
        let content = content.to_string();

        // Ingestion is async but `handle` is a synchronous callback invoked
        // from within a Tokio task; spawn the ingestion so a slow quorum
        // write never blocks the connection's read loop.
        let replication = Arc::clone(&self.replication);
        let sequencer = Arc::clone(&self.sequencer);
        let time = Arc::clone(&self.time);
        let coordinator = self.coordinator.clone();
        let node_id = self.node_id;

        tokio::spawn(async move {
            let mut message = match Message::new(&sender, &receiver, &content) {
                Ok(message) => message,
                Err(err) => {
                    warn!(node = %node_id, error = %err, "rejected malformed forwarded message");
                    return;
                }
            };

            let physical_ts = time.current_timestamp();
            time.correct_timestamp(&mut message, physical_ts);
            message.set_logical_ts(time.next_logical_time());

            replication.write_message(message.id(), message.content()).await;

            if let Some(coordinator) = &coordinator {
                coordinator
                    .store_message_metadata(message.id(), &metadata_payload(&message))
                    .await;
            }

            sequencer.queue_message(message);
        });
    }
}

/// Formats the `/messages/<id>` metadata payload the coordinator stores:
/// `"<sender>-><receiver>:<physicalTs>"` (spec §6 "External Interfaces").
fn metadata_payload(message: &Message) -> String {
    format!("{}->{}:{}", message.sender(), message.receiver(), message.physical_ts())
}

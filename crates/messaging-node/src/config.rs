//! Node configuration and CLI argument surface (spec §6 bootstrap
//! contract).

use clap::Parser;
use messaging_types::NodeId;

/// `<nodeId> <port> [<coordAddress>]` — spec §6.
#[derive(Parser, Debug)]
#[command(name = "messaging-node", about = "Fault-tolerant distributed messaging cluster node")]
pub struct Cli {
    /// This node's id, e.g. `node-1`.
    pub node_id: String,

    /// TCP port for the line-oriented transport.
    pub port: u32,

    /// Coordination-service address (e.g. `localhost:2181`). When omitted,
    /// the node runs standalone against operator-supplied static peers.
    pub coord_address: Option<String>,

    /// Static peer addresses, used only when `coord_address` is omitted.
    #[arg(long = "peer")]
    pub peers: Vec<String>,

    /// Total nodes in the cluster, used to size replication/read quorums.
    #[arg(long, default_value_t = 3)]
    pub total_nodes: usize,
}

/// Resolved configuration for one running node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: NodeId,
    pub port: u32,
    pub coord_address: Option<String>,
    pub static_peers: Vec<String>,
    pub total_nodes: usize,
}

impl NodeConfig {
    /// Validates and builds a `NodeConfig` from parsed CLI arguments.
    pub fn from_cli(cli: Cli) -> anyhow::Result<Self> {
        let node_id: NodeId = cli.node_id.parse()?;
        messaging_types::validate_port(cli.port)?;

        Ok(Self {
            node_id,
            port: cli.port,
            coord_address: cli.coord_address,
            static_peers: cli.peers,
            total_nodes: cli.total_nodes,
        })
    }
}

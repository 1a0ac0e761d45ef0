//! Bootstrap entry point: `messaging-node <nodeId> <port> [<coordAddress>]`
//! (spec §6).

mod banner;
mod config;
mod menu;
mod node;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use config::{Cli, NodeConfig};
use node::Node;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = NodeConfig::from_cli(cli)?;
    banner::print(&config.node_id.to_string(), config.port);

    let node = Node::new(config);
    node.start().await?;

    menu::run(node.clone()).await;

    node.shutdown().await;
    Ok(())
}

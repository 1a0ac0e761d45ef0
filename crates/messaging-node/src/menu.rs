//! Interactive operator menu (SPEC_FULL.md §2 — supplemented, out of scope
//! for the core algorithms but needed for a runnable binary).

use std::sync::Arc;

use dialoguer::{Input, Select};

use crate::node::Node;

const OPTIONS: &[&str] = &[
    "Send message",
    "Show leader",
    "Show live nodes",
    "Show stabilized message count",
    "Quit",
];

/// Runs the operator menu until the operator selects "Quit" or stdin closes.
pub async fn run(node: Arc<Node>) {
    loop {
        let choice = Select::new()
            .with_prompt(format!("{} — choose an action", node.node_id()))
            .items(OPTIONS)
            .default(0)
            .interact_opt();

        let Ok(Some(choice)) = choice else {
            break;
        };

        match choice {
            0 => send_message(&node).await,
            1 => show_leader(&node).await,
            2 => show_live_nodes(&node).await,
            3 => println!("stabilized messages: {}", node.stabilized_count()),
            _ => break,
        }
    }
}

async fn send_message(node: &Arc<Node>) {
    let sender: String = match Input::new().with_prompt("sender").interact_text() {
        Ok(v) => v,
        Err(_) => return,
    };
    let receiver: String = match Input::new().with_prompt("receiver").interact_text() {
        Ok(v) => v,
        Err(_) => return,
    };
    let content: String = match Input::new().with_prompt("content").interact_text() {
        Ok(v) => v,
        Err(_) => return,
    };

    match node.submit(&sender, &receiver, &content).await {
        Ok(true) => println!("accepted"),
        Ok(false) => println!("rejected: no leader available"),
        Err(err) => println!("error: {err}"),
    }
}

async fn show_leader(node: &Arc<Node>) {
    if node.is_leader().await {
        println!("this node ({}) is the leader", node.node_id());
    } else {
        match node.current_leader().await {
            Some(leader) => println!("leader: {leader}"),
            None => println!("leader: unknown"),
        }
    }
}

async fn show_live_nodes(node: &Arc<Node>) {
    let nodes = node.live_nodes().await;
    if nodes.is_empty() {
        println!("no live nodes known");
    } else {
        for peer in nodes {
            let up = node.is_peer_up(&peer).await;
            println!("{peer} — {}", if up { "up" } else { "down" });
        }
    }
}

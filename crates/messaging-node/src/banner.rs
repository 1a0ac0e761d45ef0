//! Startup banner (spec §1: out-of-scope core logic, but part of process
//! bootstrap).

use console::style;

/// Prints the startup banner for `node_id` listening on `port`.
pub fn print(node_id: &str, port: u32) {
    println!(
        "{}",
        style("=======================================================").dim()
    );
    println!(
        "  {} {}",
        style("Messaging Cluster").bold().cyan(),
        style(format!("— {node_id} on port {port}")).dim()
    );
    println!(
        "{}",
        style("=======================================================").dim()
    );
}

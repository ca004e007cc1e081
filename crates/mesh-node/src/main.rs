//! mesh-node: self-organizing WebSocket mesh daemon.
//!
//! Listens for peers, dials the configured seeds, and keeps discovering
//! until every reachable node is connected to every other.

use anyhow::Result;
use clap::Parser;
use mesh_node::{MeshNode, NodeSettings};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "mesh-node")]
#[command(about = "Self-organizing WebSocket mesh node")]
struct Args {
    /// Address to listen on and advertise to peers
    #[arg(long, env = "ADDRESS", default_value = "127.0.0.1")]
    address: String,

    /// First port to try; taken ports are skipped
    #[arg(short, long, env = "PORT", default_value_t = 20000)]
    port: u16,

    /// Whitespace-separated host:port list of peers to dial at startup
    #[arg(long, env = "NODES", default_value = "")]
    nodes: String,

    /// Initial node id
    #[arg(long, env = "NODE_ID", default_value_t = 0)]
    node_id: u64,

    /// Heartbeat interval in milliseconds
    #[arg(long, default_value_t = 1000)]
    heartbeat_ms: u64,

    /// Window after each heartbeat in which pongs count toward the epoch
    #[arg(long, default_value_t = 200)]
    epoch_window_ms: u64,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,mesh_node=debug,mesh_core=debug"
    } else {
        "info,mesh_node=info,mesh_core=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let settings = NodeSettings::new(
        args.address,
        args.port,
        args.node_id,
        &args.nodes,
        args.heartbeat_ms,
        args.epoch_window_ms,
    )?;

    info!("Starting mesh-node");
    info!("Seeds: {}", settings.seeds.len());

    let node = MeshNode::bind(settings).await?;
    info!("Listening on {}", node.config());

    let handle = node.spawn();

    info!("Node running. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    info!("Shutdown signal received");
    handle.shutdown().await?;
    Ok(())
}

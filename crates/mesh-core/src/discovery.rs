//! Mesh discovery protocol.
//!
//! A gossip-until-fixpoint handshake run on every connection:
//!
//! ```text
//! dialer                          acceptor
//!   |---- node(config) ------------>|  attach config, reply with known peers
//!   |<--- node_response([...]) -----|
//!   |<--- node(config) -------------|  acceptor introduces itself once
//!   |---- node_response([...]) ---->|
//!   ...
//!   |---- ready(config) ----------->|  sent once a node_response brings nothing new
//!   |<--- ready_response -----------|
//! ```
//!
//! Every handler takes the local node state and the registry explicitly;
//! nothing in here owns state of its own. Side effects that need the network
//! (dialing) are returned as [`DiscoveryOutcome`]s for the caller to carry out.

use crate::protocol::{Command, Frame};
use crate::registry::{ConnId, DataPatch, Registry};
use crate::transport::Link;
use crate::NodeConfig;
use tracing::{debug, info};

/// This node's own endpoint and advisory id.
#[derive(Debug, Clone)]
pub struct LocalNode {
    config: NodeConfig,
}

impl LocalNode {
    pub fn new(config: NodeConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn node_id(&self) -> u64 {
        self.config.node_id
    }

    pub fn is_self(&self, config: &NodeConfig) -> bool {
        self.config.same_endpoint(config)
    }

    /// Raise the local id past `observed` if it is strictly larger.
    ///
    /// Returns `(from, to)` when the id changed. The id never decreases.
    pub fn observe_node_id(&mut self, observed: u64) -> Option<(u64, u64)> {
        if observed <= self.config.node_id {
            return None;
        }
        let from = self.config.node_id;
        self.config.node_id = observed.saturating_add(1);
        Some((from, self.config.node_id))
    }
}

/// Follow-up the caller must act on after a command was handled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// A previously unknown peer was learned; open a connection to it.
    Dial(NodeConfig),
    NodeIdRaised { from: u64, to: u64 },
    /// A `node_response` introduced nothing new; `ready` was broadcast.
    Converged,
    /// The connection was marked ready after receiving `ready`.
    PeerReady,
}

/// Send our `node` introduction on `conn` and remember that we did.
pub fn introduce<L: Link>(local: &LocalNode, registry: &mut Registry<L>, conn: ConnId) -> bool {
    let sent = registry.send_command(conn, Command::Node(local.config().clone()));
    if sent {
        registry.set_data(conn, DataPatch::introduced());
    }
    sent
}

/// Distinct peer configs of open connections, minus `except`'s endpoint.
pub fn known_peers<L: Link>(registry: &Registry<L>, except: Option<&NodeConfig>) -> Vec<NodeConfig> {
    let mut peers: Vec<NodeConfig> = Vec::new();

    for (conn, info) in registry.connections() {
        let Some(config) = info.data.config.as_ref() else {
            continue;
        };
        if !registry.is_open(conn) {
            continue;
        }
        if except.is_some_and(|e| e.same_endpoint(config)) {
            continue;
        }
        if peers.iter().any(|p| p.same_endpoint(config)) {
            continue;
        }
        peers.push(config.clone());
    }

    peers
}

/// Handle one discovery command received on `conn`.
pub fn handle_command<L: Link>(
    local: &mut LocalNode,
    registry: &mut Registry<L>,
    conn: ConnId,
    command: &Command,
) -> Vec<DiscoveryOutcome> {
    match command {
        Command::Node(peer) => {
            on_node(local, registry, conn, peer);
            Vec::new()
        }
        Command::NodeResponse(peers) => on_node_response(local, registry, conn, peers),
        Command::Ready(_) => {
            registry.set_data(conn, DataPatch::ready());
            registry.send_command(conn, Command::ReadyResponse);
            debug!(%conn, "peer ready");
            vec![DiscoveryOutcome::PeerReady]
        }
        Command::ReadyResponse => {
            registry.set_data(conn, DataPatch::ready());
            debug!(%conn, "ready acknowledged");
            Vec::new()
        }
        Command::JoinRoom(_) | Command::LeaveRoom(_) => Vec::new(),
        Command::Unrecognized { name, .. } => {
            debug!(%conn, command = name.as_str(), "ignoring unrecognized command");
            Vec::new()
        }
    }
}

fn on_node<L: Link>(local: &LocalNode, registry: &mut Registry<L>, conn: ConnId, peer: &NodeConfig) {
    debug!(%conn, peer = %peer, node_id = peer.node_id, "node introduced itself");

    registry.set_data(conn, DataPatch::config(peer.clone()));

    let peers = known_peers(registry, Some(peer));
    registry.send_command(conn, Command::NodeResponse(peers));

    let introduced = registry
        .get_info(conn)
        .is_some_and(|info| info.data.introduced);
    if !introduced {
        introduce(local, registry, conn);
    }
}

fn on_node_response<L: Link>(
    local: &mut LocalNode,
    registry: &mut Registry<L>,
    conn: ConnId,
    peers: &[NodeConfig],
) -> Vec<DiscoveryOutcome> {
    let mut outcomes = Vec::new();

    for peer in peers {
        if local.is_self(peer) || registry.has_connection_to(&peer.address, peer.port) {
            continue;
        }
        if outcomes
            .iter()
            .any(|o| matches!(o, DiscoveryOutcome::Dial(c) if c.same_endpoint(peer)))
        {
            continue;
        }

        if let Some((from, to)) = local.observe_node_id(peer.node_id) {
            info!(from, to, "raised local node id");
            outcomes.push(DiscoveryOutcome::NodeIdRaised { from, to });
        }

        debug!(%conn, peer = %peer, "learned new peer");
        outcomes.push(DiscoveryOutcome::Dial(peer.clone()));
    }

    if outcomes.is_empty() {
        let sent = registry.broadcast(&Frame::Command(Command::Ready(local.config().clone())));
        info!(%conn, sent, "no new peers, broadcasting ready");
        outcomes.push(DiscoveryOutcome::Converged);
    }

    outcomes
}

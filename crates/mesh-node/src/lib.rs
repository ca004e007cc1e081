//! mesh-node library: the WebSocket transport and node event loop.
//!
//! A thin layer over mesh-core, exposed as a library so integration tests
//! can run several nodes in one process.

pub mod config;
pub mod connection;
pub mod node;
pub mod outgoing;
pub mod server;

// Re-export key types for convenience
pub use config::{ConfigError, NodeSettings};
pub use connection::{ConnectionEvent, LinkState, WsLink, MAX_FRAME_SIZE};
pub use node::{MeshNode, NodeError, NodeHandle, NodeStatus, PeerStatus};

//! mesh-core: transport-agnostic core of a self-organizing WebSocket mesh.
//!
//! This crate provides:
//! - The wire codec for control commands and application messages
//! - A connection registry with rooms and a two-strikes heartbeat
//! - The peer discovery handshake and node id merge
//! - Per-epoch sampling of ready peers for a work stage
//!
//! Nothing here performs IO. Time is passed in as Unix milliseconds and
//! transports plug in through the [`Link`] trait.

pub mod discovery;
pub mod epoch;
pub mod events;
pub mod heartbeat;
pub mod node_config;
pub mod protocol;
pub mod registry;
pub mod transport;

#[cfg(test)]
mod testing;

pub use discovery::{DiscoveryOutcome, LocalNode};
pub use epoch::{EpochSampler, EpochSnapshot, LogWorkStage, ReadyPeer, WorkStage};
pub use events::{EventBus, MeshEvent, RegistryEvent, Subscription};
pub use heartbeat::{HeartbeatConfig, TickReport};
pub use node_config::{parse_address_list, AddressParseError, NodeConfig};
pub use protocol::{CodecError, Command, Frame};
pub use registry::{ConnId, DataPatch, Direction, LocalId, Registry, SocketData, SocketInfo};
pub use transport::{Link, LinkError};

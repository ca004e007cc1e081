//! The mesh node event loop.
//!
//! One task owns the registry, the discovery state and the epoch sampler.
//! Socket tasks, timers and the application handle all talk to it through
//! channels, so every mutation happens on that single task.

use crate::config::{ConfigError, NodeSettings};
use crate::connection::{link_pair, ConnectionEvent, WsLink};
use crate::outgoing::spawn_dial;
use crate::server::{bind_first_free, spawn_accepted};
use mesh_core::discovery::{self, DiscoveryOutcome, LocalNode};
use mesh_core::heartbeat::{delay_to_next_second, unix_millis};
use mesh_core::{
    ConnId, Direction, EpochSampler, EventBus, Frame, HeartbeatConfig, LocalId, LogWorkStage,
    MeshEvent, NodeConfig, Registry, RegistryEvent, SocketData, WorkStage,
};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Invalid settings: {0}")]
    Config(#[from] ConfigError),
    #[error("Failed to bind {address}:{port}: {source}")]
    Bind {
        address: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("Node has stopped")]
    Stopped,
}

/// Snapshot of one connection, as reported by [`NodeHandle::status`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatus {
    pub conn: ConnId,
    pub local_id: LocalId,
    pub direction: Direction,
    pub open: bool,
    pub alive: bool,
    pub ready: bool,
    pub config: Option<NodeConfig>,
    pub last_seen_at: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    /// Local endpoint with the current node id.
    pub config: NodeConfig,
    pub connections: Vec<PeerStatus>,
    pub rooms: BTreeMap<String, Vec<ConnId>>,
}

impl NodeStatus {
    /// Open connections whose peer endpoint is known.
    pub fn peers(&self) -> impl Iterator<Item = &PeerStatus> {
        self.connections
            .iter()
            .filter(|p| p.open && p.config.is_some())
    }

    pub fn is_connected_to(&self, config: &NodeConfig) -> bool {
        self.peers()
            .any(|p| p.config.as_ref().is_some_and(|c| c.same_endpoint(config)))
    }
}

enum NodeCommand {
    Connect {
        target: NodeConfig,
        reply: oneshot::Sender<Option<ConnId>>,
    },
    Broadcast {
        value: Value,
        reply: oneshot::Sender<usize>,
    },
    SendToRoom {
        rooms: Vec<String>,
        value: Value,
        reply: oneshot::Sender<usize>,
    },
    Status {
        reply: oneshot::Sender<NodeStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to a running node.
#[derive(Clone)]
pub struct NodeHandle {
    config: NodeConfig,
    commands: mpsc::UnboundedSender<NodeCommand>,
    events: Arc<EventBus>,
}

impl NodeHandle {
    /// Endpoint the node is listening on. The node id is the initial one.
    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.events)
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> NodeCommand,
    ) -> Result<T, NodeError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(build(tx))
            .map_err(|_| NodeError::Stopped)?;
        rx.await.map_err(|_| NodeError::Stopped)
    }

    /// Dial a peer. Returns `None` if the endpoint is this node or is
    /// already connected.
    pub async fn connect(&self, address: &str, port: u16) -> Result<Option<ConnId>, NodeError> {
        let target = NodeConfig::new(address, port);
        self.request(|reply| NodeCommand::Connect { target, reply })
            .await
    }

    /// Send an application message to every connection.
    pub async fn broadcast(&self, value: Value) -> Result<usize, NodeError> {
        self.request(|reply| NodeCommand::Broadcast { value, reply })
            .await
    }

    /// Send an application message to the members of the given rooms.
    pub async fn send_to_room<S: Into<String>>(
        &self,
        rooms: impl IntoIterator<Item = S>,
        value: Value,
    ) -> Result<usize, NodeError> {
        let rooms = rooms.into_iter().map(Into::into).collect();
        self.request(|reply| NodeCommand::SendToRoom {
            rooms,
            value,
            reply,
        })
        .await
    }

    pub async fn status(&self) -> Result<NodeStatus, NodeError> {
        self.request(|reply| NodeCommand::Status { reply }).await
    }

    /// Close every connection and stop the event loop.
    pub async fn shutdown(&self) -> Result<(), NodeError> {
        self.request(|reply| NodeCommand::Shutdown { reply }).await
    }
}

/// State owned by the event loop task.
struct Mesh {
    local: LocalNode,
    registry: Registry<WsLink>,
    sampler: EpochSampler,
    heartbeat: HeartbeatConfig,
    work: Box<dyn WorkStage>,
    bus: Arc<EventBus>,
    conn_tx: mpsc::UnboundedSender<ConnectionEvent>,
}

/// A bound, not yet running, mesh node.
pub struct MeshNode {
    mesh: Mesh,
    seeds: Vec<NodeConfig>,
    listener: TcpListener,
    conn_rx: mpsc::UnboundedReceiver<ConnectionEvent>,
}

impl MeshNode {
    /// Acquire a listening port and prepare the node.
    pub async fn bind(settings: NodeSettings) -> Result<Self, NodeError> {
        settings.validate()?;

        let (listener, port) = bind_first_free(&settings.address, settings.port)
            .await
            .map_err(|source| NodeError::Bind {
                address: settings.address.clone(),
                port: settings.port,
                source,
            })?;

        let config = NodeConfig::new(settings.address, port).with_node_id(settings.node_id);
        let (conn_tx, conn_rx) = mpsc::unbounded_channel();

        let mesh = Mesh {
            local: LocalNode::new(config),
            registry: Registry::new(),
            sampler: EpochSampler::new(settings.heartbeat.epoch_window.as_millis() as u64),
            heartbeat: settings.heartbeat,
            work: Box::new(LogWorkStage),
            bus: Arc::new(EventBus::new()),
            conn_tx,
        };

        Ok(Self {
            mesh,
            seeds: settings.seeds,
            listener,
            conn_rx,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        self.mesh.local.config()
    }

    /// Event bus; subscribe before spawning to see every event.
    pub fn events(&self) -> Arc<EventBus> {
        Arc::clone(&self.mesh.bus)
    }

    /// Replace the default logging work stage.
    pub fn with_work_stage(mut self, stage: impl WorkStage + 'static) -> Self {
        self.mesh.work = Box::new(stage);
        self
    }

    /// Run the event loop on a new task.
    pub fn spawn(self) -> NodeHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = NodeHandle {
            config: self.config().clone(),
            commands: tx,
            events: self.events(),
        };
        tokio::spawn(self.run(rx));
        handle
    }

    async fn run(self, mut commands: mpsc::UnboundedReceiver<NodeCommand>) {
        let MeshNode {
            mut mesh,
            seeds,
            listener,
            mut conn_rx,
        } = self;

        info!(config = %mesh.local.config(), node_id = mesh.local.node_id(), "mesh node started");

        for seed in seeds {
            mesh.connect(seed);
        }
        mesh.pump();

        let first_tick = Instant::now() + delay_to_next_second(unix_millis());
        let mut heartbeat = tokio::time::interval_at(first_tick, mesh.heartbeat.interval);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let epoch_timer = tokio::time::sleep(mesh.heartbeat.epoch_window);
        tokio::pin!(epoch_timer);
        let mut epoch_armed = false;

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => mesh.accept(stream, addr),
                        Err(e) => error!("Failed to accept connection: {}", e),
                    }
                }

                Some(event) = conn_rx.recv() => {
                    mesh.on_connection_event(event);
                }

                _ = heartbeat.tick() => {
                    mesh.registry.heartbeat(unix_millis());
                    epoch_timer.as_mut().reset(Instant::now() + mesh.heartbeat.epoch_window);
                    epoch_armed = true;
                }

                () = &mut epoch_timer, if epoch_armed => {
                    epoch_armed = false;
                    mesh.close_epoch();
                }

                command = commands.recv() => {
                    match command {
                        Some(NodeCommand::Shutdown { reply }) => {
                            mesh.shutdown();
                            let _ = reply.send(());
                            break;
                        }
                        Some(command) => mesh.on_command(command),
                        None => {
                            mesh.shutdown();
                            break;
                        }
                    }
                }
            }

            mesh.pump();
        }

        info!("mesh node stopped");
    }
}

impl Mesh {
    fn accept(&mut self, stream: TcpStream, addr: SocketAddr) {
        let (link, task) = link_pair();
        let conn = self
            .registry
            .register(link, Direction::Inbound, SocketData::default(), unix_millis());
        spawn_accepted(conn, task, stream, addr, self.conn_tx.clone());
    }

    /// Dial `target` unless it is us or already connected (or dialing).
    fn connect(&mut self, target: NodeConfig) -> Option<ConnId> {
        if self.local.is_self(&target) {
            debug!(target = %target, "not dialing our own endpoint");
            return None;
        }
        if self.registry.has_connection_to(&target.address, target.port) {
            debug!(target = %target, "already connected");
            return None;
        }

        let (link, task) = link_pair();
        let conn = self.registry.register(
            link,
            Direction::Outbound,
            SocketData::with_config(target.clone()),
            unix_millis(),
        );
        self.bus.emit(MeshEvent::Dialing {
            conn,
            config: target.clone(),
        });
        spawn_dial(conn, task, target, self.conn_tx.clone());
        Some(conn)
    }

    fn on_connection_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Opened { conn } => {
                let outbound = self
                    .registry
                    .get_info(conn)
                    .is_some_and(|info| info.direction == Direction::Outbound);
                if outbound {
                    discovery::introduce(&self.local, &mut self.registry, conn);
                }
            }
            ConnectionEvent::Failed { conn, error } => {
                if let Some(info) = self.registry.deregister(conn) {
                    if let (Direction::Outbound, Some(config)) = (info.direction, info.data.config) {
                        warn!(%conn, target = %config, "Failed to connect: {}", error);
                        self.bus.emit(MeshEvent::DialFailed { config, error });
                    }
                }
            }
            ConnectionEvent::Frame { conn, text } => self.registry.receive(conn, &text),
            ConnectionEvent::Pong { conn } => {
                self.registry.on_pong(conn, unix_millis());
            }
            ConnectionEvent::Closed { conn } => {
                if self.registry.deregister(conn).is_some() {
                    info!(%conn, "Peer disconnected");
                }
            }
        }
    }

    fn on_command(&mut self, command: NodeCommand) {
        match command {
            NodeCommand::Connect { target, reply } => {
                let _ = reply.send(self.connect(target));
            }
            NodeCommand::Broadcast { value, reply } => {
                let _ = reply.send(self.registry.broadcast(&Frame::Message(value)));
            }
            NodeCommand::SendToRoom {
                rooms,
                value,
                reply,
            } => {
                let _ = reply.send(self.registry.send_to_room(&Frame::Message(value), &rooms));
            }
            NodeCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            // Handled by the loop, which has to stop afterwards.
            NodeCommand::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    /// Publish queued registry events and react to them. Reactions can queue
    /// more events, so this runs until the queue stays empty.
    fn pump(&mut self) {
        loop {
            let events = self.registry.drain_events();
            if events.is_empty() {
                break;
            }

            for event in events {
                self.bus.emit(MeshEvent::Registry(event.clone()));

                match event {
                    RegistryEvent::PingCycleStarted { at_ms } => {
                        self.sampler.start(at_ms);
                    }
                    RegistryEvent::Pong { conn, info } => {
                        self.sampler.on_pong(conn, &info, info.last_seen_at);
                    }
                    RegistryEvent::Command { conn, command } => {
                        let outcomes = discovery::handle_command(
                            &mut self.local,
                            &mut self.registry,
                            conn,
                            &command,
                        );
                        self.apply(conn, outcomes);
                    }
                    RegistryEvent::Disconnected { conn, .. } => {
                        self.sampler.remove(conn);
                    }
                    _ => {}
                }
            }
        }
    }

    fn apply(&mut self, conn: ConnId, outcomes: Vec<DiscoveryOutcome>) {
        for outcome in outcomes {
            match outcome {
                DiscoveryOutcome::Dial(target) => {
                    self.connect(target);
                }
                DiscoveryOutcome::NodeIdRaised { from, to } => {
                    self.bus.emit(MeshEvent::NodeIdRaised { from, to });
                }
                DiscoveryOutcome::Converged => {
                    self.bus.emit(MeshEvent::Converged { conn });
                }
                DiscoveryOutcome::PeerReady => {
                    self.bus.emit(MeshEvent::PeerReady { conn });
                }
            }
        }
    }

    fn close_epoch(&mut self) {
        let snapshot = self.sampler.close(self.registry.ready_count());
        self.work.run(&snapshot);
        self.bus.emit(MeshEvent::EpochClosed(snapshot));
    }

    fn status(&self) -> NodeStatus {
        let connections = self
            .registry
            .connections()
            .map(|(conn, info)| PeerStatus {
                conn,
                local_id: info.local_id.clone(),
                direction: info.direction,
                open: self.registry.is_open(conn),
                alive: info.alive,
                ready: info.data.ready,
                config: info.data.config.clone(),
                last_seen_at: info.last_seen_at,
            })
            .collect();

        let rooms = self
            .registry
            .rooms()
            .map(|(room, members)| (room.to_string(), members.to_vec()))
            .collect();

        NodeStatus {
            config: self.local.config().clone(),
            connections,
            rooms,
        }
    }

    fn shutdown(&mut self) {
        info!(connections = self.registry.len(), "Shutting down");
        self.registry.close_all();
        self.pump();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_connect_skips_self_and_duplicates() {
        let node = MeshNode::bind(NodeSettings::local(0)).await.unwrap();
        let port = node.config().port;
        let handle = node.spawn();

        assert_eq!(handle.connect("127.0.0.1", port).await.unwrap(), None);

        let first = handle.connect("127.0.0.1", 1).await.unwrap();
        assert!(first.is_some());

        handle.shutdown().await.unwrap();
        assert!(matches!(handle.status().await, Err(NodeError::Stopped)));
    }

    #[tokio::test]
    async fn test_bind_rejects_invalid_heartbeat() {
        let zero = NodeSettings::local(0).with_heartbeat(HeartbeatConfig {
            interval: Duration::ZERO,
            epoch_window: Duration::from_millis(200),
        });
        assert!(matches!(
            MeshNode::bind(zero).await,
            Err(NodeError::Config(ConfigError::ZeroInterval))
        ));

        let wide = NodeSettings::local(0).with_heartbeat(HeartbeatConfig {
            interval: Duration::from_millis(500),
            epoch_window: Duration::from_millis(500),
        });
        assert!(matches!(
            MeshNode::bind(wide).await,
            Err(NodeError::Config(ConfigError::EpochWindow { .. }))
        ));
    }
}

//! Connection registry.
//!
//! Owns every live link, its per-connection metadata, and room membership.
//! Connections are addressed by a `ConnId` issued at registration time; the
//! transport object itself is never used as a key.
//!
//! The registry is single-threaded by construction: the node loop is its only
//! caller, so no locking is needed. State changes are queued as
//! `RegistryEvent`s and picked up with [`Registry::drain_events`].

use crate::events::RegistryEvent;
use crate::protocol::{room_joined, Command, Frame};
use crate::transport::Link;
use crate::NodeConfig;
use rand::Rng;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Display, Formatter};
use tracing::{debug, trace};

/// Opaque handle for one registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ConnId(u64);

impl Display for ConnId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Random connection-local id. Never sent over the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct LocalId(String);

impl LocalId {
    /// 128 random bits as 32 hex chars.
    pub fn generate() -> Self {
        let bits: u128 = rand::rng().random();
        Self(format!("{:032x}", bits))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for LocalId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Attributes attached to a connection over its lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketData {
    /// The peer's endpoint, once learned (dial target or `node` command).
    pub config: Option<NodeConfig>,
    /// Both ends finished the discovery handshake on this link.
    pub ready: bool,
    /// We already sent our own `node` introduction on this link.
    pub introduced: bool,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub extra: Map<String, Value>,
}

impl SocketData {
    pub fn with_config(config: NodeConfig) -> Self {
        Self {
            config: Some(config),
            ..Default::default()
        }
    }

    /// Shallow merge: every field set in the patch overwrites ours.
    pub fn apply(&mut self, patch: DataPatch) {
        if let Some(config) = patch.config {
            self.config = Some(config);
        }
        if let Some(ready) = patch.ready {
            self.ready = ready;
        }
        if let Some(introduced) = patch.introduced {
            self.introduced = introduced;
        }
        self.extra.extend(patch.extra);
    }
}

/// Partial update for [`SocketData`], applied by [`Registry::set_data`].
#[derive(Debug, Clone, Default)]
pub struct DataPatch {
    pub config: Option<NodeConfig>,
    pub ready: Option<bool>,
    pub introduced: Option<bool>,
    pub extra: Map<String, Value>,
}

impl DataPatch {
    pub fn config(config: NodeConfig) -> Self {
        Self {
            config: Some(config),
            ..Default::default()
        }
    }

    pub fn ready() -> Self {
        Self {
            ready: Some(true),
            ..Default::default()
        }
    }

    pub fn introduced() -> Self {
        Self {
            introduced: Some(true),
            ..Default::default()
        }
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }
}

/// Per-connection record.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SocketInfo {
    pub local_id: LocalId,
    pub direction: Direction,
    /// Last registration or pong, in milliseconds since Unix epoch.
    pub last_seen_at: u64,
    /// Cleared when a ping is sent, set again by the pong.
    pub alive: bool,
    pub data: SocketData,
}

pub(crate) struct Entry<L> {
    pub(crate) link: L,
    pub(crate) info: SocketInfo,
}

/// Registry of live connections and rooms.
pub struct Registry<L> {
    pub(crate) sockets: BTreeMap<ConnId, Entry<L>>,
    /// Room name to members, in join order.
    pub(crate) rooms: BTreeMap<String, Vec<ConnId>>,
    next_conn_id: u64,
    pub(crate) events: Vec<RegistryEvent>,
}

impl<L> Default for Registry<L> {
    fn default() -> Self {
        Self {
            sockets: BTreeMap::new(),
            rooms: BTreeMap::new(),
            next_conn_id: 1,
            events: Vec::new(),
        }
    }
}

impl<L: Link> Registry<L> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a freshly accepted or dialed link.
    ///
    /// The new connection starts `alive` with `last_seen_at = now_ms`.
    pub fn register(
        &mut self,
        link: L,
        direction: Direction,
        data: SocketData,
        now_ms: u64,
    ) -> ConnId {
        let conn = ConnId(self.next_conn_id);
        self.next_conn_id += 1;

        let info = SocketInfo {
            local_id: LocalId::generate(),
            direction,
            last_seen_at: now_ms,
            alive: true,
            data,
        };

        debug!(%conn, local_id = %info.local_id, ?direction, "connection registered");

        self.events.push(RegistryEvent::Connected {
            conn,
            info: info.clone(),
        });
        self.sockets.insert(conn, Entry { link, info });
        conn
    }

    /// Remove a connection from the registry and from every room.
    ///
    /// Returns the removed record, or `None` if it was already gone.
    pub fn deregister(&mut self, conn: ConnId) -> Option<SocketInfo> {
        let entry = self.sockets.remove(&conn)?;

        let mut emptied = Vec::new();
        for (room, members) in self.rooms.iter_mut() {
            if let Some(index) = members.iter().position(|m| *m == conn) {
                members.remove(index);
                self.events.push(RegistryEvent::LeftRoom {
                    room: room.clone(),
                    conn,
                });
                if members.is_empty() {
                    emptied.push(room.clone());
                }
            }
        }
        for room in emptied {
            self.rooms.remove(&room);
        }

        debug!(%conn, local_id = %entry.info.local_id, "connection deregistered");

        self.events.push(RegistryEvent::Disconnected {
            conn,
            local_id: entry.info.local_id.clone(),
        });
        Some(entry.info)
    }

    /// Encode and send a frame. Returns false if the connection is unknown,
    /// closing, or the transport refused the frame.
    pub fn send(&self, conn: ConnId, frame: &Frame) -> bool {
        let Some(entry) = self.sockets.get(&conn) else {
            return false;
        };

        if !entry.link.is_open() {
            return false;
        }

        match entry.link.send_text(frame.encode()) {
            Ok(()) => {
                trace!(%conn, local_id = %entry.info.local_id, "sending data");
                true
            }
            Err(e) => {
                debug!(%conn, "send failed: {}", e);
                false
            }
        }
    }

    pub fn send_command(&self, conn: ConnId, command: Command) -> bool {
        self.send(conn, &Frame::Command(command))
    }

    /// Send to every registered connection. Individual failures are skipped.
    ///
    /// Returns how many connections accepted the frame.
    pub fn broadcast(&self, frame: &Frame) -> usize {
        self.sockets
            .keys()
            .filter(|conn| self.send(**conn, frame))
            .count()
    }

    /// Add `conn` to `room`. Joining twice is a no-op.
    ///
    /// Only the joining connection receives the confirmation message.
    pub fn join_room(&mut self, room: &str, conn: ConnId) -> bool {
        let Some(entry) = self.sockets.get(&conn) else {
            return false;
        };

        let members = self.rooms.entry(room.to_string()).or_default();
        if members.contains(&conn) {
            return false;
        }
        members.push(conn);

        debug!(%conn, local_id = %entry.info.local_id, room, "joined room");

        self.send(conn, &room_joined(room));
        self.events.push(RegistryEvent::JoinedRoom {
            room: room.to_string(),
            conn,
        });
        true
    }

    /// Remove `conn` from `room`. Leaving a room you are not in is a no-op.
    pub fn leave_room(&mut self, room: &str, conn: ConnId) -> bool {
        let Some(members) = self.rooms.get_mut(room) else {
            return false;
        };
        let Some(index) = members.iter().position(|m| *m == conn) else {
            return false;
        };

        members.remove(index);
        if members.is_empty() {
            self.rooms.remove(room);
        }

        debug!(%conn, room, "left room");

        self.events.push(RegistryEvent::LeftRoom {
            room: room.to_string(),
            conn,
        });
        true
    }

    /// Send to the union of members of the named rooms. Unknown rooms
    /// contribute nothing.
    pub fn send_to_room<S: AsRef<str>>(&self, frame: &Frame, rooms: &[S]) -> usize {
        let targets: BTreeSet<ConnId> = rooms
            .iter()
            .filter_map(|room| self.rooms.get(room.as_ref()))
            .flatten()
            .copied()
            .collect();

        targets
            .into_iter()
            .filter(|conn| self.send(*conn, frame))
            .count()
    }

    /// Decode an inbound frame and route it.
    ///
    /// Room commands are handled here; other commands and application
    /// messages are queued as events. Malformed frames are dropped.
    pub fn receive(&mut self, conn: ConnId, text: &str) {
        if !self.sockets.contains_key(&conn) {
            debug!(%conn, "dropping frame from unregistered connection");
            return;
        }

        match Frame::decode(text) {
            Ok(Frame::Command(Command::JoinRoom(room))) => {
                self.join_room(&room, conn);
            }
            Ok(Frame::Command(Command::LeaveRoom(room))) => {
                self.leave_room(&room, conn);
            }
            Ok(Frame::Command(command)) => {
                debug!(%conn, command = command.name(), "command received");
                self.events.push(RegistryEvent::Command { conn, command });
            }
            Ok(Frame::Message(value)) => {
                trace!(%conn, "message received");
                self.events.push(RegistryEvent::Message { conn, value });
            }
            Err(e) => {
                debug!(%conn, "unable to parse incoming message: {}", e);
            }
        }
    }

    /// Drop room members that are no longer registered or no longer open,
    /// and delete rooms that end up empty.
    pub fn cleanup(&mut self) {
        let sockets = &self.sockets;
        let events = &mut self.events;

        self.rooms.retain(|room, members| {
            members.retain(|conn| {
                let live = sockets.get(conn).is_some_and(|e| e.link.is_open());
                if !live {
                    debug!(%conn, room = room.as_str(), "removing dead member from room");
                    events.push(RegistryEvent::LeftRoom {
                        room: room.clone(),
                        conn: *conn,
                    });
                }
                live
            });
            !members.is_empty()
        });
    }

    pub fn get_info(&self, conn: ConnId) -> Option<&SocketInfo> {
        self.sockets.get(&conn).map(|e| &e.info)
    }

    pub fn is_alive(&self, conn: ConnId) -> bool {
        self.get_info(conn).is_some_and(|info| info.alive)
    }

    pub fn is_open(&self, conn: ConnId) -> bool {
        self.sockets.get(&conn).is_some_and(|e| e.link.is_open())
    }

    /// Whether any registered connection carries a config for this endpoint.
    pub fn has_connection_to(&self, address: &str, port: u16) -> bool {
        self.sockets.values().any(|e| {
            e.info
                .data
                .config
                .as_ref()
                .is_some_and(|c| c.is_endpoint(address, port))
        })
    }

    /// Merge `patch` into the connection's data.
    pub fn set_data(&mut self, conn: ConnId, patch: DataPatch) -> Option<&SocketInfo> {
        let entry = self.sockets.get_mut(&conn)?;
        entry.info.data.apply(patch);
        Some(&entry.info)
    }

    /// Registered connections in registration order.
    pub fn connections(&self) -> impl Iterator<Item = (ConnId, &SocketInfo)> {
        self.sockets.iter().map(|(conn, e)| (*conn, &e.info))
    }

    pub fn len(&self) -> usize {
        self.sockets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.is_empty()
    }

    /// Number of connections whose data has `ready == true`.
    pub fn ready_count(&self) -> usize {
        self.sockets.values().filter(|e| e.info.data.ready).count()
    }

    pub fn room_members(&self, room: &str) -> &[ConnId] {
        self.rooms.get(room).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn rooms(&self) -> impl Iterator<Item = (&str, &[ConnId])> {
        self.rooms.iter().map(|(r, m)| (r.as_str(), m.as_slice()))
    }

    /// Take all events queued since the last call.
    pub fn drain_events(&mut self) -> Vec<RegistryEvent> {
        std::mem::take(&mut self.events)
    }

    /// Terminate every link and empty the registry.
    pub fn close_all(&mut self) {
        let conns: Vec<ConnId> = self.sockets.keys().copied().collect();
        for conn in conns {
            if let Some(entry) = self.sockets.get(&conn) {
                entry.link.terminate();
            }
            self.deregister(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeLink;
    use serde_json::json;

    fn registry_with(n: usize) -> (Registry<FakeLink>, Vec<(ConnId, FakeLink)>) {
        let mut registry = Registry::new();
        let conns = (0..n)
            .map(|_| {
                let link = FakeLink::new();
                let conn =
                    registry.register(link.clone(), Direction::Inbound, SocketData::default(), 0);
                (conn, link)
            })
            .collect();
        registry.drain_events();
        (registry, conns)
    }

    #[test]
    fn test_register_assigns_fresh_ids() {
        let mut registry = Registry::new();
        let a = registry.register(FakeLink::new(), Direction::Inbound, SocketData::default(), 5);
        let b = registry.register(FakeLink::new(), Direction::Outbound, SocketData::default(), 5);

        assert_ne!(a, b);
        let info_a = registry.get_info(a).unwrap();
        let info_b = registry.get_info(b).unwrap();
        assert_ne!(info_a.local_id, info_b.local_id);
        assert_eq!(info_a.local_id.as_str().len(), 32);
        assert!(info_a.alive);
        assert_eq!(info_a.last_seen_at, 5);

        let events = registry.drain_events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], RegistryEvent::Connected { conn, .. } if conn == a));
    }

    #[test]
    fn test_deregister_is_idempotent() {
        let (mut registry, conns) = registry_with(1);
        let (conn, _) = conns[0];
        registry.join_room("lobby", conn);
        registry.drain_events();

        assert!(registry.deregister(conn).is_some());
        let events = registry.drain_events();
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], RegistryEvent::LeftRoom { room, .. } if room == "lobby"));
        assert!(matches!(events[1], RegistryEvent::Disconnected { .. }));
        assert!(registry.room_members("lobby").is_empty());

        assert!(registry.deregister(conn).is_none());
        assert!(registry.drain_events().is_empty());
    }

    #[test]
    fn test_send_to_closed_or_unknown_returns_false() {
        let (mut registry, conns) = registry_with(1);
        let (conn, link) = conns[0].clone();
        let frame = Frame::Message(json!({"hello": 1}));

        assert!(registry.send(conn, &frame));
        assert_eq!(link.sent(), vec![r#"{"hello":1}"#.to_string()]);

        link.close();
        assert!(!registry.send(conn, &frame));

        registry.deregister(conn);
        assert!(!registry.send(conn, &frame));
    }

    #[test]
    fn test_broadcast_skips_failures() {
        let (registry, conns) = registry_with(3);
        conns[0].1.close();
        conns[1].1.fail_sends();

        let sent = registry.broadcast(&Frame::Message(json!("hi")));

        assert_eq!(sent, 1);
        assert_eq!(conns[2].1.sent(), vec!["\"hi\"".to_string()]);
    }

    #[test]
    fn test_join_room_twice_confirms_once() {
        let (mut registry, conns) = registry_with(2);
        let (conn, link) = conns[0].clone();

        assert!(registry.join_room("lobby", conn));
        assert!(!registry.join_room("lobby", conn));

        assert_eq!(registry.room_members("lobby"), &[conn]);
        assert_eq!(
            link.sent(),
            vec![r#"{"room":"lobby","topic":"joined room"}"#.to_string()]
        );
        assert!(conns[1].1.sent().is_empty(), "only the joiner is told");

        let joined = registry
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, RegistryEvent::JoinedRoom { .. }))
            .count();
        assert_eq!(joined, 1);
    }

    #[test]
    fn test_leave_room_not_member_is_noop() {
        let (mut registry, conns) = registry_with(2);
        registry.join_room("lobby", conns[0].0);
        registry.drain_events();

        assert!(!registry.leave_room("lobby", conns[1].0));
        assert!(!registry.leave_room("nowhere", conns[0].0));
        assert!(registry.drain_events().is_empty());

        assert!(registry.leave_room("lobby", conns[0].0));
        assert_eq!(registry.rooms().count(), 0, "empty room is destroyed");
    }

    #[test]
    fn test_send_to_room_union() {
        let (mut registry, conns) = registry_with(3);
        registry.join_room("a", conns[0].0);
        registry.join_room("a", conns[1].0);
        registry.join_room("b", conns[1].0);
        for (_, link) in &conns {
            link.clear();
        }

        let sent = registry.send_to_room(&Frame::Message(json!(1)), &["a", "b", "missing"]);

        assert_eq!(sent, 2);
        assert_eq!(conns[0].1.sent().len(), 1);
        assert_eq!(conns[1].1.sent().len(), 1, "member of both rooms gets one copy");
        assert!(conns[2].1.sent().is_empty());
    }

    #[test]
    fn test_cleanup_removes_dead_members() {
        let (mut registry, conns) = registry_with(2);
        registry.join_room("lobby", conns[0].0);
        registry.join_room("lobby", conns[1].0);
        registry.join_room("solo", conns[0].0);
        registry.drain_events();

        conns[0].1.close();
        registry.cleanup();

        assert_eq!(registry.room_members("lobby"), &[conns[1].0]);
        assert!(registry.room_members("solo").is_empty());
        let left = registry
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, RegistryEvent::LeftRoom { .. }))
            .count();
        assert_eq!(left, 2);
    }

    #[test]
    fn test_receive_routes_frames() {
        let (mut registry, conns) = registry_with(1);
        let conn = conns[0].0;

        registry.receive(conn, r#"{"__command__":"join_room","__value__":"lobby"}"#);
        registry.receive(conn, r#"{"__command__":"ready_response"}"#);
        registry.receive(conn, r#"{"topic":"chat"}"#);
        registry.receive(conn, "garbage{");

        let events = registry.drain_events();
        assert_eq!(events.len(), 3);
        assert!(matches!(events[0], RegistryEvent::JoinedRoom { .. }));
        assert!(matches!(
            events[1],
            RegistryEvent::Command {
                command: Command::ReadyResponse,
                ..
            }
        ));
        assert!(matches!(&events[2], RegistryEvent::Message { value, .. } if value["topic"] == "chat"));
    }

    #[test]
    fn test_has_connection_to_and_set_data() {
        let mut registry = Registry::new();
        let conn = registry.register(
            FakeLink::new(),
            Direction::Outbound,
            SocketData::with_config(NodeConfig::new("127.0.0.1", 20001)),
            0,
        );

        assert!(registry.has_connection_to("127.0.0.1", 20001));
        assert!(!registry.has_connection_to("127.0.0.1", 20002));

        registry.set_data(conn, DataPatch::ready().with_extra("role", json!("worker")));
        registry.set_data(conn, DataPatch::default().with_extra("role", json!("leader")));

        let data = &registry.get_info(conn).unwrap().data;
        assert!(data.ready);
        assert_eq!(data.extra["role"], json!("leader"));
        assert_eq!(data.config, Some(NodeConfig::new("127.0.0.1", 20001)));
        assert_eq!(registry.ready_count(), 1);
    }

    #[test]
    fn test_close_all_terminates_links() {
        let (mut registry, conns) = registry_with(2);
        registry.close_all();

        assert!(registry.is_empty());
        assert!(conns.iter().all(|(_, link)| link.terminated()));
    }
}

//! Event infrastructure for mesh-core.
//!
//! `RegistryEvent`s are queued by the registry and drained by the node loop,
//! which reacts to them and republishes everything as `MeshEvent`s on an
//! `EventBus` for logging and monitoring subscribers.

use crate::epoch::EpochSnapshot;
use crate::protocol::Command;
use crate::registry::{ConnId, LocalId, SocketInfo};
use crate::NodeConfig;
use serde::Serialize;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// State changes reported by the connection registry.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RegistryEvent {
    /// A socket was registered (accepted or dialed).
    Connected { conn: ConnId, info: SocketInfo },
    /// A socket was removed from the registry.
    Disconnected { conn: ConnId, local_id: LocalId },
    /// A heartbeat tick finished its cleanup pass and is about to ping.
    PingCycleStarted { at_ms: u64 },
    /// A ping was handed to a socket.
    Ping { conn: ConnId },
    /// A socket answered the current cycle's ping.
    Pong { conn: ConnId, info: SocketInfo },
    /// A control command the registry does not consume itself.
    Command { conn: ConnId, command: Command },
    /// An application message.
    Message { conn: ConnId, value: Value },
    JoinedRoom { room: String, conn: ConnId },
    LeftRoom { room: String, conn: ConnId },
}

/// Everything observable about a running node.
#[derive(Debug, Clone, Serialize)]
#[serde(
    tag = "type",
    content = "event",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum MeshEvent {
    Registry(RegistryEvent),
    /// Outbound connection attempt started.
    Dialing { conn: ConnId, config: NodeConfig },
    /// Outbound connection attempt failed; the socket was deregistered.
    DialFailed { config: NodeConfig, error: String },
    /// Local node id was raised after observing a larger one.
    NodeIdRaised { from: u64, to: u64 },
    /// A `node_response` introduced no new peers; `ready` was broadcast.
    Converged { conn: ConnId },
    /// A connection reached `ready=true` on this end.
    PeerReady { conn: ConnId },
    /// The epoch window closed and the ready set was handed to the work stage.
    EpochClosed(EpochSnapshot),
}

impl From<RegistryEvent> for MeshEvent {
    fn from(event: RegistryEvent) -> Self {
        MeshEvent::Registry(event)
    }
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(MeshEvent) + Send + Sync>;

/// Event bus for publishing mesh events to subscribers.
///
/// Thread-safe so a handle can subscribe while the node runs on a Tokio
/// worker. Wrap in `Arc` to enable subscriptions.
#[derive(Default)]
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(MeshEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds a read lock.
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: MeshEvent) {
        // Snapshot the list so a callback may subscribe without deadlocking.
        let callbacks: Vec<_> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn ping_cycle(at_ms: u64) -> MeshEvent {
        RegistryEvent::PingCycleStarted { at_ms }.into()
    }

    #[test]
    fn test_subscribe_and_emit() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        let _sub = bus.subscribe(move |_event| {
            count_clone.fetch_add(1, Ordering::Relaxed);
        });

        bus.emit(ping_cycle(1000));

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_subscription_unsubscribes_on_drop() {
        let bus = Arc::new(EventBus::new());
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);

        {
            let _sub = bus.subscribe(move |_event| {
                count_clone.fetch_add(1, Ordering::Relaxed);
            });
            bus.emit(ping_cycle(1000));
            assert_eq!(count.load(Ordering::Relaxed), 1);
        }

        bus.emit(ping_cycle(2000));

        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_events_delivered_in_order() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);

        let _sub = bus.subscribe(move |event| {
            if let MeshEvent::NodeIdRaised { to, .. } = event {
                seen_clone.lock().unwrap().push(to);
            }
        });

        bus.emit(MeshEvent::NodeIdRaised { from: 0, to: 4 });
        bus.emit(MeshEvent::NodeIdRaised { from: 4, to: 9 });

        assert_eq!(*seen.lock().unwrap(), vec![4, 9]);
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_value(ping_cycle(1234)).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "registry",
                "event": {"type": "pingCycleStarted", "atMs": 1234}
            })
        );

        let json = serde_json::to_value(MeshEvent::NodeIdRaised { from: 3, to: 8 }).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"type": "nodeIdRaised", "event": {"from": 3, "to": 8}})
        );
    }
}

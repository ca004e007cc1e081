//! Heartbeat liveness engine.
//!
//! Each tick first prunes dead room members, then walks every registered
//! connection: a connection still waiting for the previous tick's pong is
//! terminated and deregistered, every other connection is re-armed and
//! pinged. A peer is therefore evicted only after missing two consecutive
//! ticks.
//!
//! Like the rest of mesh-core this is sans-IO: callers pass the current wall
//! clock in milliseconds and drive the ticks from their own timer.

use crate::events::RegistryEvent;
use crate::registry::{ConnId, Registry};
use crate::transport::Link;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Timing for the heartbeat and the epoch window that follows each tick.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Time between heartbeat ticks.
    pub interval: Duration,
    /// How long after a tick pongs still count toward the epoch ready set.
    pub epoch_window: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(1000),
            epoch_window: Duration::from_millis(200),
        }
    }
}

/// What one heartbeat tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub pinged: Vec<ConnId>,
    pub evicted: Vec<ConnId>,
}

/// Milliseconds since the Unix epoch. A clock before 1970 reads as 0.
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Delay from `now_ms` until the next whole wall-clock second.
///
/// Exactly on a boundary this is a full second, never zero.
pub fn delay_to_next_second(now_ms: u64) -> Duration {
    Duration::from_millis(1000 - now_ms % 1000)
}

impl<L: Link> Registry<L> {
    /// Run one heartbeat tick.
    pub fn heartbeat(&mut self, now_ms: u64) -> TickReport {
        self.cleanup();

        self.events
            .push(RegistryEvent::PingCycleStarted { at_ms: now_ms });

        let mut report = TickReport::default();
        let conns: Vec<ConnId> = self.sockets.keys().copied().collect();

        for conn in conns {
            let Some(entry) = self.sockets.get_mut(&conn) else {
                continue;
            };

            if !entry.info.alive {
                info!(%conn, local_id = %entry.info.local_id, "connection missed a heartbeat, terminating");
                entry.link.terminate();
                self.deregister(conn);
                report.evicted.push(conn);
                continue;
            }

            entry.info.alive = false;
            match entry.link.ping() {
                Ok(()) => {
                    self.events.push(RegistryEvent::Ping { conn });
                    report.pinged.push(conn);
                }
                Err(e) => warn!(%conn, "failed to send ping: {}", e),
            }
        }

        report
    }

    /// Record a pong. Returns false for unknown connections.
    pub fn on_pong(&mut self, conn: ConnId, now_ms: u64) -> bool {
        let Some(entry) = self.sockets.get_mut(&conn) else {
            return false;
        };

        entry.info.alive = true;
        entry.info.last_seen_at = now_ms;
        debug!(%conn, "pong");

        self.events.push(RegistryEvent::Pong {
            conn,
            info: entry.info.clone(),
        });
        true
    }
}

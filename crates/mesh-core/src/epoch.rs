//! Epoch ready-set sampling.
//!
//! Each heartbeat tick opens a new epoch. Pongs that arrive within the
//! epoch window from connections already marked ready are collected; when
//! the window closes the set is frozen into an [`EpochSnapshot`] and handed
//! to a [`WorkStage`]. Sampling never affects eviction.

use crate::registry::{ConnId, SocketInfo};
use crate::NodeConfig;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// A ready peer that answered quickly enough for this epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyPeer {
    pub conn: ConnId,
    pub config: Option<NodeConfig>,
}

/// Frozen ready set for one epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EpochSnapshot {
    pub epoch: u64,
    pub started_at_ms: u64,
    pub peers: Vec<ReadyPeer>,
    /// All connections with `ready == true` when the window closed.
    pub ready_connections: usize,
}

#[derive(Debug)]
pub struct EpochSampler {
    window_ms: u64,
    epoch: u64,
    started_at_ms: u64,
    peers: BTreeMap<ConnId, Option<NodeConfig>>,
}

impl EpochSampler {
    pub fn new(window_ms: u64) -> Self {
        Self {
            window_ms,
            epoch: 0,
            started_at_ms: 0,
            peers: BTreeMap::new(),
        }
    }

    /// Begin a new epoch at `now_ms`, discarding the previous ready set.
    pub fn start(&mut self, now_ms: u64) -> u64 {
        self.epoch += 1;
        self.started_at_ms = now_ms;
        self.peers.clear();
        debug!(epoch = self.epoch, "epoch started");
        self.epoch
    }

    /// Consider a pong for the current epoch. Returns true if the peer was
    /// added to the ready set.
    pub fn on_pong(&mut self, conn: ConnId, info: &SocketInfo, now_ms: u64) -> bool {
        if self.epoch == 0 {
            return false;
        }
        if now_ms >= self.started_at_ms.saturating_add(self.window_ms) {
            debug!(%conn, epoch = self.epoch, "pong arrived after epoch window");
            return false;
        }
        if !info.data.ready {
            return false;
        }
        self.peers.insert(conn, info.data.config.clone());
        true
    }

    /// Forget a connection that went away mid-window.
    pub fn remove(&mut self, conn: ConnId) {
        self.peers.remove(&conn);
    }

    /// Freeze the current set.
    pub fn close(&self, ready_connections: usize) -> EpochSnapshot {
        EpochSnapshot {
            epoch: self.epoch,
            started_at_ms: self.started_at_ms,
            peers: self
                .peers
                .iter()
                .map(|(conn, config)| ReadyPeer {
                    conn: *conn,
                    config: config.clone(),
                })
                .collect(),
            ready_connections,
        }
    }
}

/// Consumer of the per-epoch ready set.
pub trait WorkStage: Send {
    fn run(&mut self, snapshot: &EpochSnapshot);
}

/// Work stage that only reports what it was given.
#[derive(Debug, Default)]
pub struct LogWorkStage;

impl WorkStage for LogWorkStage {
    fn run(&mut self, snapshot: &EpochSnapshot) {
        info!(
            epoch = snapshot.epoch,
            ready_connections = snapshot.ready_connections,
            "{} peers ready for work",
            snapshot.peers.len()
        );
    }
}

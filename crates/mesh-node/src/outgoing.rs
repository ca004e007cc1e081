//! Outgoing connections to peers we learned about.

use crate::connection::{ConnectionEvent, LinkTask};
use mesh_core::{ConnId, NodeConfig};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, info};

/// Give up on a dial after this long.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Dial `target` and drive the resulting socket on a new task.
///
/// Failure is reported as `ConnectionEvent::Failed`; there is no retry.
pub fn spawn_dial(
    conn: ConnId,
    task: LinkTask,
    target: NodeConfig,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    let url = target.websocket_url();

    tokio::spawn(async move {
        debug!(%conn, "Connecting to {}", url);

        match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str())).await {
            Ok(Ok((ws, _response))) => {
                info!(%conn, "Connected to {}", url);
                task.run(conn, ws, events).await;
            }
            Ok(Err(e)) => task.fail(conn, e.to_string(), &events),
            Err(_) => task.fail(conn, format!("timed out connecting to {}", url), &events),
        }
    });
}

//! Listening side: port acquisition and inbound WebSocket upgrades.

use crate::connection::{ConnectionEvent, LinkTask};
use mesh_core::ConnId;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::accept_async;
use tracing::{debug, info, warn};

/// Bind to `address:port`, moving up one port at a time until a bind
/// succeeds. Every bind error is retried; past 65535 the search wraps back
/// to the base port.
///
/// Port 0 asks the OS for a free port.
pub async fn bind_first_free(address: &str, port: u16) -> std::io::Result<(TcpListener, u16)> {
    let base = port;
    let mut port = port;
    loop {
        match TcpListener::bind((address, port)).await {
            Ok(listener) => {
                let bound = listener.local_addr()?.port();
                info!("WebSocket server listening on {}:{}", address, bound);
                return Ok((listener, bound));
            }
            Err(e) => {
                warn!("Unable to bind {}:{} ({}), trying next port", address, port, e);
                port = next_port(port, base);
                tokio::task::yield_now().await;
            }
        }
    }
}

/// Port to try after `port`, wrapping from 65535 back to `base`.
pub fn next_port(port: u16, base: u16) -> u16 {
    port.checked_add(1).unwrap_or(base)
}

/// Upgrade an accepted TCP stream and drive it on a new task.
pub fn spawn_accepted(
    conn: ConnId,
    task: LinkTask,
    stream: TcpStream,
    addr: SocketAddr,
    events: mpsc::UnboundedSender<ConnectionEvent>,
) {
    tokio::spawn(async move {
        match accept_async(stream).await {
            Ok(ws) => {
                info!(%conn, "New connection from {}", addr);
                task.run(conn, ws, events).await;
            }
            Err(e) => {
                // Port scanners connect and hang up without a handshake.
                debug!(%conn, "WebSocket upgrade failed for {}: {}", addr, e);
                task.fail(conn, e.to_string(), &events);
            }
        }
    });
}

//! WebSocket links.
//!
//! A `WsLink` is the registry's handle on one WebSocket: sends are queued on
//! an unbounded channel and written by a per-connection task, which also
//! forwards inbound frames and pongs to the node loop as `ConnectionEvent`s.
//! The link is registered before the WebSocket handshake finishes, so frames
//! queued while connecting are flushed once the socket opens.

use futures::{SinkExt, StreamExt};
use mesh_core::transport::{Link, LinkError, Result};
use mesh_core::ConnId;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    tungstenite::{Error as WsError, Message},
    WebSocketStream,
};
use tracing::{debug, error, warn};

/// Inbound frames above this size are dropped (16 MiB).
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const CONNECTING: u8 = 0;
const OPEN: u8 = 1;
const CLOSING: u8 = 2;
const CLOSED: u8 = 3;

/// Lifecycle of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Work queued for a connection's writer.
#[derive(Debug)]
pub enum Outbound {
    Text(String),
    Ping,
    Close,
}

/// Event emitted by a connection task.
#[derive(Debug)]
pub enum ConnectionEvent {
    /// WebSocket handshake completed.
    Opened { conn: ConnId },
    /// Handshake or dial failed; the socket never opened.
    Failed { conn: ConnId, error: String },
    /// A text frame (or UTF-8 binary frame) arrived.
    Frame { conn: ConnId, text: String },
    Pong { conn: ConnId },
    /// Connection was closed
    Closed { conn: ConnId },
}

/// Registry-side handle for one WebSocket.
#[derive(Debug, Clone)]
pub struct WsLink {
    outbox: mpsc::UnboundedSender<Outbound>,
    state: Arc<AtomicU8>,
}

/// Task-side half of a link: the outbox receiver plus shared state.
pub struct LinkTask {
    outbox: mpsc::UnboundedReceiver<Outbound>,
    state: Arc<AtomicU8>,
}

/// Create a connecting link and the task half that will drive it.
pub fn link_pair() -> (WsLink, LinkTask) {
    let (tx, rx) = mpsc::unbounded_channel();
    let state = Arc::new(AtomicU8::new(CONNECTING));
    (
        WsLink {
            outbox: tx,
            state: Arc::clone(&state),
        },
        LinkTask { outbox: rx, state },
    )
}

impl WsLink {
    pub fn state(&self) -> LinkState {
        match self.state.load(Ordering::Acquire) {
            CONNECTING => LinkState::Connecting,
            OPEN => LinkState::Open,
            CLOSING => LinkState::Closing,
            _ => LinkState::Closed,
        }
    }

    fn queue(&self, item: Outbound) -> Result<()> {
        if !self.is_open() {
            return Err(LinkError::Closed);
        }
        self.outbox.send(item).map_err(|_| LinkError::Closed)
    }
}

impl Link for WsLink {
    fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) < CLOSING
    }

    fn send_text(&self, text: String) -> Result<()> {
        self.queue(Outbound::Text(text))
    }

    fn ping(&self) -> Result<()> {
        self.queue(Outbound::Ping)
    }

    fn terminate(&self) {
        let previous = self.state.fetch_max(CLOSING, Ordering::AcqRel);
        if previous < CLOSING {
            let _ = self.outbox.send(Outbound::Close);
        }
    }
}

impl LinkTask {
    /// Mark the link closed and report why it never opened.
    pub fn fail(
        self,
        conn: ConnId,
        error: String,
        events: &mpsc::UnboundedSender<ConnectionEvent>,
    ) {
        self.state.store(CLOSED, Ordering::Release);
        let _ = events.send(ConnectionEvent::Failed { conn, error });
    }

    /// Pump a freshly opened WebSocket until either side closes it.
    pub async fn run<S>(
        mut self,
        conn: ConnId,
        ws: WebSocketStream<S>,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (mut write, mut read) = ws.split();

        // Terminated while the handshake was still in flight.
        if self
            .state
            .compare_exchange(CONNECTING, OPEN, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            let _ = write.send(Message::Close(None)).await;
            self.state.store(CLOSED, Ordering::Release);
            let _ = events.send(ConnectionEvent::Closed { conn });
            return;
        }

        let _ = events.send(ConnectionEvent::Opened { conn });

        loop {
            tokio::select! {
                item = self.outbox.recv() => {
                    let result = match item {
                        Some(Outbound::Text(text)) => write.send(Message::text(text)).await,
                        Some(Outbound::Ping) => write.send(Message::Ping(Vec::new())).await,
                        Some(Outbound::Close) | None => {
                            self.state.store(CLOSING, Ordering::Release);
                            let _ = write.send(Message::Close(None)).await;
                            break;
                        }
                    };
                    if let Err(e) = result {
                        debug!(%conn, "write failed: {}", e);
                        break;
                    }
                }
                msg = read.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => forward(conn, text, &events),
                        Some(Ok(Message::Binary(data))) => forward_binary(conn, data, &events),
                        Some(Ok(Message::Pong(_))) => {
                            let _ = events.send(ConnectionEvent::Pong { conn });
                        }
                        // tungstenite queues the pong reply itself
                        Some(Ok(Message::Ping(_))) | Some(Ok(Message::Frame(_))) => {}
                        Some(Ok(Message::Close(_))) => {
                            debug!(%conn, "received close frame");
                            break;
                        }
                        Some(Err(e)) => {
                            match e {
                                WsError::ConnectionClosed | WsError::AlreadyClosed => {
                                    debug!(%conn, "connection closed");
                                }
                                _ => error!(%conn, "WebSocket error: {}", e),
                            }
                            break;
                        }
                        None => {
                            debug!(%conn, "stream ended");
                            break;
                        }
                    }
                }
            }
        }

        self.state.store(CLOSED, Ordering::Release);
        let _ = events.send(ConnectionEvent::Closed { conn });
    }
}

fn forward(conn: ConnId, text: String, events: &mpsc::UnboundedSender<ConnectionEvent>) {
    if text.len() > MAX_FRAME_SIZE {
        warn!(
            %conn,
            "frame exceeds max size ({} > {}), dropping",
            text.len(),
            MAX_FRAME_SIZE
        );
        return;
    }
    let _ = events.send(ConnectionEvent::Frame { conn, text });
}

/// Binary frames are accepted when they hold UTF-8 text.
fn forward_binary(conn: ConnId, data: Vec<u8>, events: &mpsc::UnboundedSender<ConnectionEvent>) {
    match String::from_utf8(data) {
        Ok(text) => forward(conn, text, events),
        Err(_) => debug!(%conn, "dropping non UTF-8 binary frame"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connecting_link_accepts_sends() {
        let (link, mut task) = link_pair();

        assert_eq!(link.state(), LinkState::Connecting);
        assert!(link.is_open());
        link.send_text("hello".into()).unwrap();
        link.ping().unwrap();

        assert!(matches!(task.outbox.try_recv(), Ok(Outbound::Text(t)) if t == "hello"));
        assert!(matches!(task.outbox.try_recv(), Ok(Outbound::Ping)));
    }

    #[test]
    fn test_terminate_closes_once() {
        let (link, mut task) = link_pair();

        link.terminate();
        link.terminate();

        assert_eq!(link.state(), LinkState::Closing);
        assert!(!link.is_open());
        assert!(matches!(link.send_text("late".into()), Err(LinkError::Closed)));
        assert!(matches!(task.outbox.try_recv(), Ok(Outbound::Close)));
        assert!(task.outbox.try_recv().is_err());
    }

    #[test]
    fn test_failed_link_reports_closed() {
        let (link, task) = link_pair();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = test_conn();

        task.fail(conn, "refused".into(), &tx);

        assert_eq!(link.state(), LinkState::Closed);
        assert!(matches!(link.ping(), Err(LinkError::Closed)));
        assert!(matches!(
            rx.try_recv(),
            Ok(ConnectionEvent::Failed { error, .. }) if error == "refused"
        ));
    }

    #[test]
    fn test_oversized_frame_dropped() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = test_conn();

        forward(conn, "x".repeat(MAX_FRAME_SIZE + 1), &tx);
        assert!(rx.try_recv().is_err());

        forward(conn, "x".repeat(MAX_FRAME_SIZE), &tx);
        assert!(matches!(
            rx.try_recv(),
            Ok(ConnectionEvent::Frame { text, .. }) if text.len() == MAX_FRAME_SIZE
        ));
    }

    #[test]
    fn test_binary_frames_need_utf8() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = test_conn();

        forward_binary(conn, br#"{"hello":1}"#.to_vec(), &tx);
        assert!(matches!(
            rx.try_recv(),
            Ok(ConnectionEvent::Frame { text, .. }) if text == r#"{"hello":1}"#
        ));

        forward_binary(conn, vec![0xff, 0xfe], &tx);
        assert!(rx.try_recv().is_err());
    }

    fn test_conn() -> ConnId {
        use mesh_core::{Direction, Registry, SocketData};
        let (link, _task) = link_pair();
        Registry::new().register(link, Direction::Inbound, SocketData::default(), 0)
    }
}

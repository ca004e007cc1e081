//! Link trait: the registry's view of one transport connection.
//!
//! Implementations:
//! - WebSocket link in mesh-node (frames queued to a per-connection writer task)
//! - In-memory fake links in the unit tests

use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("Link is closed")]
    Closed,

    #[error("Link error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, LinkError>;

/// One bidirectional connection as seen by the registry.
///
/// All calls are non-blocking. Sends are fire-and-forget: `Ok` means the
/// frame was handed to the transport, not that the peer received it.
pub trait Link {
    /// False once the link is closing or closed.
    fn is_open(&self) -> bool;

    /// Queue a text frame.
    fn send_text(&self, text: String) -> Result<()>;

    /// Queue a protocol-level ping.
    fn ping(&self) -> Result<()>;

    /// Close the link immediately. Safe to call more than once.
    fn terminate(&self);
}

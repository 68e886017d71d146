//! Event-channel transports.
//!
//! The sync layer talks to the room authority through a [`Channel`]: a
//! fire-and-forget send plus a connected flag. Inbound traffic and the
//! connect/disconnect lifecycle arrive separately as a stream of
//! [`ChannelEvent`](crate::protocol::ChannelEvent)s handed to the session.
//!
//! - [`ws`]: WebSocket client with automatic reconnection
//! - [`loopback`]: in-memory channel for embedding and tests

pub mod loopback;
pub mod ws;

pub use loopback::LoopbackChannel;
pub use ws::{ChannelConfig, WsChannel};

use crate::protocol::{ClientMessage, ProtocolError};
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum ChannelError {
    #[error("channel is not connected")]
    NotConnected,
    #[error("channel is closed")]
    Closed,
    #[error("outgoing buffer is full")]
    Backpressure,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("send failed: {0}")]
    SendFailed(String),
}

/// Bidirectional message channel to the room authority.
///
/// `send` never blocks: the message is handed to a writer and the outcome
/// of the request arrives later as a notification.
pub trait Channel: Send + Sync {
    fn send(&self, message: ClientMessage) -> Result<(), ChannelError>;

    /// Whether the logical session is currently established.
    fn is_connected(&self) -> bool;
}

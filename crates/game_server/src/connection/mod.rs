//! Connection handles for client sessions.
//!
//! The session layer never touches sockets directly. It talks to a
//! [`Connection`], a minimal capability interface that the TCP transport
//! implements with [`ClientConnection`] and tests implement with an
//! in-memory recorder.

pub mod client;
#[cfg(test)]
pub(crate) mod testing;

pub use client::ClientConnection;

use crate::error::ConnectionError;
use crate::protocol::Frame;
use std::net::SocketAddr;

/// Type alias for connection identifiers.
///
/// Connection IDs are used to uniquely identify client connections
/// throughout their lifecycle on the server.
pub type ConnectionId = u64;

/// Capabilities the session layer needs from a live connection.
pub trait Connection: Send + Sync + std::fmt::Debug {
    /// Process-unique id of this connection.
    fn id(&self) -> ConnectionId;

    /// Whether the connection can still carry outbound frames.
    fn is_active(&self) -> bool;

    /// Queues a frame for delivery. Never blocks.
    fn send(&self, frame: Frame) -> Result<(), ConnectionError>;

    /// Closes the connection. Calling it more than once is harmless.
    fn close(&self);

    /// The peer address.
    fn remote_address(&self) -> SocketAddr;
}

/// Lifecycle of a single connection: `Accepted → Active → Closed`.
///
/// Reader idleness closes the connection outright; there is no warning state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Accepted = 0,
    Active = 1,
    Closed = 2,
}

impl ConnectionState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Accepted,
            1 => ConnectionState::Active,
            _ => ConnectionState::Closed,
        }
    }
}

/// Why a connection ended. Reported once, by whichever trigger fired first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer closed the socket
    PeerClosed,
    /// No inbound data within the idle window
    IdleTimeout,
    /// The peer sent an invalid frame
    ProtocolViolation(String),
    /// Socket read failed
    IoError(String),
    /// The server closed the connection (eviction, kick or shutdown)
    ServerClosed,
}

impl std::fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DisconnectReason::PeerClosed => write!(f, "peer closed"),
            DisconnectReason::IdleTimeout => write!(f, "idle timeout"),
            DisconnectReason::ProtocolViolation(e) => write!(f, "protocol violation: {e}"),
            DisconnectReason::IoError(e) => write!(f, "i/o error: {e}"),
            DisconnectReason::ServerClosed => write!(f, "closed by server"),
        }
    }
}

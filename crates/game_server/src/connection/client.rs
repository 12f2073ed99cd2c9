//! TCP client connection handle.
//!
//! This module defines the structure and behavior of individual client
//! connections, tracking their state and metadata. Outbound frames go
//! through a bounded queue drained by the connection's writer task, so
//! sending never blocks the caller and never holds a lock across a socket
//! write.

use super::{Connection, ConnectionId, ConnectionState};
use crate::error::ConnectionError;
use crate::protocol::Frame;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::SystemTime;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

/// Represents an individual client connection to the server.
///
/// # Fields
///
/// * `id` - Unique connection id assigned at accept time
/// * `remote_addr` - The network address of the connected client
/// * `connected_at` - Timestamp when the connection was established
/// * `outbound` - Queue feeding the writer task
/// * `close_token` - Cancelled exactly when the connection is closed
#[derive(Debug)]
pub struct ClientConnection {
    id: ConnectionId,
    remote_addr: SocketAddr,
    connected_at: SystemTime,
    outbound: mpsc::Sender<Frame>,
    close_token: CancellationToken,
    state: AtomicU8,
}

impl ClientConnection {
    /// Creates a new client connection in the `Accepted` state.
    ///
    /// # Arguments
    ///
    /// * `id` - The connection id
    /// * `remote_addr` - The network address of the connecting client
    /// * `outbound` - Sender half of the writer task's queue
    /// * `close_token` - Token the reader and writer tasks watch for closure
    pub fn new(
        id: ConnectionId,
        remote_addr: SocketAddr,
        outbound: mpsc::Sender<Frame>,
        close_token: CancellationToken,
    ) -> Self {
        Self {
            id,
            remote_addr,
            connected_at: SystemTime::now(),
            outbound,
            close_token,
            state: AtomicU8::new(ConnectionState::Accepted as u8),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Moves `Accepted → Active`. No effect once closed.
    pub fn mark_active(&self) {
        let _ = self.state.compare_exchange(
            ConnectionState::Accepted as u8,
            ConnectionState::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// When the connection was accepted.
    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    /// Resolves once [`Connection::close`] has been called.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.close_token.cancelled()
    }
}

impl Connection for ClientConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_active(&self) -> bool {
        self.state() != ConnectionState::Closed
            && !self.close_token.is_cancelled()
            && !self.outbound.is_closed()
    }

    fn send(&self, frame: Frame) -> Result<(), ConnectionError> {
        if self.state() == ConnectionState::Closed {
            return Err(ConnectionError::Closed(self.id));
        }
        self.outbound.try_send(frame).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConnectionError::QueueFull(self.id),
            mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed(self.id),
        })
    }

    fn close(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
        self.close_token.cancel();
    }

    fn remote_address(&self) -> SocketAddr {
        self.remote_addr
    }
}

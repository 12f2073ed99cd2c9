//! In-memory connection used by unit tests.

use super::{Connection, ConnectionId};
use crate::error::ConnectionError;
use crate::protocol::Frame;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Records every frame sent to it.
#[derive(Debug)]
pub(crate) struct RecordingConnection {
    id: ConnectionId,
    active: AtomicBool,
    fail_sends: AtomicBool,
    sent: Mutex<Vec<Frame>>,
}

impl RecordingConnection {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            active: AtomicBool::new(true),
            fail_sends: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        })
    }

    /// Makes every subsequent send fail as if the socket were broken.
    pub(crate) fn break_sends(&self) {
        self.fail_sends.store(true, Ordering::Relaxed);
    }

    pub(crate) fn sent(&self) -> Vec<Frame> {
        self.sent.lock().unwrap().clone()
    }

    pub(crate) fn sent_ids(&self) -> Vec<u32> {
        self.sent().iter().map(|f| f.message_id).collect()
    }
}

impl Connection for RecordingConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    fn send(&self, frame: Frame) -> Result<(), ConnectionError> {
        if !self.is_active() || self.fail_sends.load(Ordering::Relaxed) {
            return Err(ConnectionError::Closed(self.id));
        }
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    fn close(&self) {
        self.active.store(false, Ordering::Relaxed);
    }

    fn remote_address(&self) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40_000 + (self.id % 20_000) as u16))
    }
}

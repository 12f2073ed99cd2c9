//! Session identity and state.
//!
//! A [`Session`] is the server-side half of one client connection. It is
//! shared as `Arc<Session>` between the connection task that owns it, the
//! [`SessionRegistry`](super::SessionRegistry) and message handlers.
//! [`SessionData`] is the serializable projection written to the session
//! store; it carries no connection handle and cannot be turned back into a
//! live session.

use crate::connection::Connection;
use crate::error::ConnectionError;
use crate::protocol::Frame;
use crate::utils::current_timestamp_ms;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

const COUNTER_BITS: u32 = 48;
const COUNTER_MASK: u64 = (1 << COUNTER_BITS) - 1;

/// Identifier of a session.
///
/// The high 16 bits hold the issuing process's node tag and the low 48 bits
/// a monotonic counter, so ids never repeat within a process and are
/// distinct across instances with overwhelming probability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Node tag portion of the id.
    pub fn node_tag(self) -> u16 {
        (self.0 >> COUNTER_BITS) as u16
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for SessionId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>().map(SessionId)
    }
}

/// Lock-free generator of [`SessionId`]s.
#[derive(Debug)]
pub struct SessionIdGenerator {
    node_tag: u64,
    counter: AtomicU64,
}

impl SessionIdGenerator {
    /// Creates a generator with a random node tag.
    pub fn new() -> Self {
        Self::with_node_tag((Uuid::new_v4().as_u128() & 0xFFFF) as u16)
    }

    /// Creates a generator with a fixed node tag.
    pub fn with_node_tag(node_tag: u16) -> Self {
        Self {
            node_tag: u64::from(node_tag) << COUNTER_BITS,
            counter: AtomicU64::new(0),
        }
    }

    /// Returns the next id. Never repeats within the generator's lifetime.
    pub fn next_id(&self) -> SessionId {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        SessionId(self.node_tag | (seq & COUNTER_MASK))
    }
}

impl Default for SessionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Server-side state for one client connection.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    node_id: Uuid,
    connection: Arc<dyn Connection>,
    user_id: RwLock<Option<String>>,
    authenticated: AtomicBool,
    created_at: Instant,
    created_at_ms: u64,
    /// Milliseconds since `created_at` of the latest activity.
    last_active_offset_ms: AtomicU64,
    attributes: DashMap<String, Value>,
}

impl Session {
    /// Creates an anonymous session bound to `connection`.
    pub fn new(id: SessionId, node_id: Uuid, connection: Arc<dyn Connection>) -> Self {
        Self {
            id,
            node_id,
            connection,
            user_id: RwLock::new(None),
            authenticated: AtomicBool::new(false),
            created_at: Instant::now(),
            created_at_ms: current_timestamp_ms(),
            last_active_offset_ms: AtomicU64::new(0),
            attributes: DashMap::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Instance that owns this session's connection.
    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.connection
    }

    pub fn user_id(&self) -> Option<String> {
        self.user_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    /// Records the user binding. Returns the previously bound user, if any.
    ///
    /// Only the session registry calls this, so the user index stays in step.
    pub(crate) fn bind(&self, user_id: &str) -> Option<String> {
        let mut guard = self.user_id.write().unwrap_or_else(PoisonError::into_inner);
        let previous = guard.replace(user_id.to_string());
        self.authenticated.store(true, Ordering::Release);
        previous
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Monotonic time of the latest inbound or outbound activity.
    pub fn last_active(&self) -> Instant {
        self.created_at + Duration::from_millis(self.last_active_offset_ms.load(Ordering::Acquire))
    }

    /// Wall-clock milliseconds of the latest activity.
    pub fn last_active_ms(&self) -> u64 {
        self.created_at_ms + self.last_active_offset_ms.load(Ordering::Acquire)
    }

    /// Marks the session as active now.
    pub fn touch(&self) {
        let offset = self.created_at.elapsed().as_millis() as u64;
        self.last_active_offset_ms.fetch_max(offset, Ordering::AcqRel);
    }

    /// Time since the latest activity.
    pub fn idle_for(&self) -> Duration {
        Instant::now().saturating_duration_since(self.last_active())
    }

    /// True when the session has been idle longer than `timeout`.
    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.idle_for() > timeout
    }

    pub fn is_active(&self) -> bool {
        self.connection.is_active()
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.connection.remote_address()
    }

    /// Sends a frame to the client and counts it as activity.
    pub fn send(&self, frame: Frame) -> Result<(), ConnectionError> {
        self.connection.send(frame)?;
        self.touch();
        Ok(())
    }

    /// Encodes and sends a protobuf message.
    pub fn send_message<M: prost::Message>(
        &self,
        message_id: crate::protocol::MessageId,
        message: &M,
    ) -> Result<(), ConnectionError> {
        self.send(Frame::from_message(message_id, message))
    }

    /// Closes the underlying connection.
    pub fn close(&self) {
        self.connection.close();
    }

    pub fn get_attribute(&self, key: &str) -> Option<Value> {
        self.attributes.get(key).map(|v| v.value().clone())
    }

    /// Sets an attribute and returns the previous value.
    pub fn set_attribute(&self, key: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.attributes.insert(key.into(), value.into())
    }

    pub fn remove_attribute(&self, key: &str) -> Option<Value> {
        self.attributes.remove(key).map(|(_, v)| v)
    }

    /// Point-in-time copy of all attributes.
    pub fn attributes(&self) -> HashMap<String, Value> {
        self.attributes
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    /// Serializable projection of this session.
    pub fn to_data(&self) -> SessionData {
        SessionData {
            session_id: self.id,
            node_id: self.node_id,
            user_id: self.user_id(),
            authenticated: self.is_authenticated(),
            remote_addr: self.remote_address(),
            created_at_ms: self.created_at_ms,
            last_active_ms: self.last_active_ms(),
            attributes: self.attributes(),
        }
    }
}

/// Session state as stored locally and in the distributed backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionData {
    pub session_id: SessionId,
    pub node_id: Uuid,
    pub user_id: Option<String>,
    pub authenticated: bool,
    pub remote_addr: SocketAddr,
    pub created_at_ms: u64,
    pub last_active_ms: u64,
    #[serde(default)]
    pub attributes: HashMap<String, Value>,
}

impl SessionData {
    /// True when `now_ms - last_active_ms` exceeds `timeout`.
    pub fn is_expired_at(&self, now_ms: u64, timeout: Duration) -> bool {
        now_ms.saturating_sub(self.last_active_ms) > timeout.as_millis() as u64
    }

    /// Same as [`SessionData::is_expired_at`] using the current wall clock.
    pub fn is_expired(&self, timeout: Duration) -> bool {
        self.is_expired_at(current_timestamp_ms(), timeout)
    }
}

//! Server configuration types and defaults.
//!
//! This module contains the server configuration structure and default values
//! used to initialize and customize the game server behavior. Every section
//! deserializes with `#[serde(default)]`, so a partial TOML table only needs
//! to name the values it changes.

use crate::error::ServerError;
use crate::health::CircuitBreakerConfig;
use crate::protocol::MAX_FRAME_BYTES;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

/// Configuration structure for the game server.
///
/// Contains all necessary parameters to configure server behavior including
/// network settings, framing limits, session lifetimes and the session store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// The socket address to bind the server to
    pub bind_address: SocketAddr,

    /// Number of accept loops. 0 means one per CPU core when
    /// `use_reuse_port` is set, otherwise a single loop.
    pub acceptor_count: usize,

    /// Whether to use SO_REUSEPORT for multi-threaded accept loops
    pub use_reuse_port: bool,

    /// Maximum number of concurrent connections allowed
    pub max_connections: usize,

    /// Reader idle timeout in milliseconds
    pub idle_timeout_ms: u64,

    /// Largest accepted frame payload in bytes; clamped to 1 MiB
    pub max_frame_bytes: usize,

    /// Capacity of each connection's outbound frame queue
    pub outbound_queue_size: usize,

    /// Listening socket options
    pub socket: SocketConfig,

    /// Session lifetime settings
    pub session: SessionConfig,

    /// Two-tier session store settings
    pub store: StoreConfig,
}

/// Options applied to each listening socket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    /// SO_RCVBUF in bytes (0 leaves the OS default)
    pub recv_buffer_size: u32,
    /// SO_SNDBUF in bytes (0 leaves the OS default)
    pub send_buffer_size: u32,
    /// TCP_NODELAY on accepted streams
    pub nodelay: bool,
    /// Listen backlog
    pub backlog: u32,
}

/// Session sweeper settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How often the sweeper looks for inactive sessions, in milliseconds
    pub sweep_interval_ms: u64,
    /// Inactivity after which a session is evicted, in milliseconds
    pub session_timeout_ms: u64,
}

/// Which distributed backend sits behind the local session cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendKind {
    /// In-process backend; useful for single-node deployments and tests
    Memory,
    /// Redis at `endpoint`
    Redis,
    /// Local cache only
    None,
}

/// Two-tier session store settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackendKind,
    /// Backend endpoint, e.g. `redis://127.0.0.1:6379`
    pub endpoint: String,
    /// Upper bound on any single backend call, in milliseconds
    pub call_timeout_ms: u64,
    /// Expiry of distributed session records, in seconds
    pub distributed_ttl_secs: u64,
    /// Prefix of every distributed key
    pub key_prefix: String,
    /// Capacity of the local cache
    pub local_max_entries: usize,
    /// Expiry of local cache entries, in milliseconds
    pub local_ttl_ms: u64,
    /// Concurrent background activity-time writes
    pub write_behind_concurrency: usize,
    pub circuit_breaker: CircuitBreakerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 8080)),
            acceptor_count: 0,
            use_reuse_port: false,
            max_connections: 10_000,
            idle_timeout_ms: 60_000,
            max_frame_bytes: MAX_FRAME_BYTES,
            outbound_queue_size: 1024,
            socket: SocketConfig::default(),
            session: SessionConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            recv_buffer_size: 0,
            send_buffer_size: 0,
            nodelay: true,
            backlog: 1024,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 60_000,
            session_timeout_ms: 30 * 60 * 1000,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackendKind::Memory,
            endpoint: "redis://127.0.0.1:6379".to_string(),
            call_timeout_ms: 200,
            distributed_ttl_secs: 30 * 60,
            key_prefix: "game".to_string(),
            local_max_entries: 100_000,
            local_ttl_ms: 30 * 60 * 1000,
            write_behind_concurrency: 64,
            circuit_breaker: CircuitBreakerConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Effective frame limit after clamping to the protocol maximum.
    pub fn frame_limit(&self) -> usize {
        self.max_frame_bytes.min(MAX_FRAME_BYTES)
    }

    /// Number of accept loops to run.
    pub fn acceptors(&self) -> usize {
        match (self.acceptor_count, self.use_reuse_port) {
            (0, true) => num_cpus::get().max(1),
            (0, false) => 1,
            (n, true) => n,
            (_, false) => 1,
        }
    }

    /// Rejects values the server cannot run with.
    pub fn validate(&self) -> Result<(), ServerError> {
        if self.max_connections == 0 {
            return Err(ServerError::Config("max_connections must be greater than 0".into()));
        }
        if self.idle_timeout_ms == 0 {
            return Err(ServerError::Config("idle_timeout_ms must be greater than 0".into()));
        }
        if self.max_frame_bytes == 0 {
            return Err(ServerError::Config("max_frame_bytes must be greater than 0".into()));
        }
        if self.outbound_queue_size == 0 {
            return Err(ServerError::Config("outbound_queue_size must be greater than 0".into()));
        }
        if self.session.sweep_interval_ms == 0 || self.session.session_timeout_ms == 0 {
            return Err(ServerError::Config(
                "session sweep interval and timeout must be greater than 0".into(),
            ));
        }
        self.store.validate()
    }
}

impl SessionConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }
}

impl StoreConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    pub fn distributed_ttl(&self) -> Duration {
        Duration::from_secs(self.distributed_ttl_secs)
    }

    pub fn local_ttl(&self) -> Duration {
        Duration::from_millis(self.local_ttl_ms)
    }

    pub fn validate(&self) -> Result<(), ServerError> {
        if self.local_max_entries == 0 {
            return Err(ServerError::Config("store.local_max_entries must be greater than 0".into()));
        }
        if self.write_behind_concurrency == 0 {
            return Err(ServerError::Config(
                "store.write_behind_concurrency must be greater than 0".into(),
            ));
        }
        if self.backend != StoreBackendKind::None {
            if self.call_timeout_ms == 0 {
                return Err(ServerError::Config("store.call_timeout_ms must be greater than 0".into()));
            }
            if self.distributed_ttl_secs == 0 {
                return Err(ServerError::Config(
                    "store.distributed_ttl_secs must be greater than 0".into(),
                ));
            }
        }
        if self.backend == StoreBackendKind::Redis && self.endpoint.is_empty() {
            return Err(ServerError::Config("store.endpoint is required for the redis backend".into()));
        }
        Ok(())
    }
}

//! Utility functions and helper methods for the game server.
//!
//! This module provides convenient factory functions for creating server
//! instances and the wall-clock helper used for persisted timestamps.

use crate::{config::ServerConfig, error::ServerError, server::GameServer};
use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
///
/// Only used for values that leave the process (persisted session times,
/// heartbeat replies); in-process expiry uses the monotonic clock.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Creates a new game server with default configuration.
///
/// This is a convenience function for quickly setting up a server
/// with sensible defaults for development and testing.
///
/// # Example
///
/// ```rust
/// # #[tokio::main]
/// # async fn main() {
/// use game_server::create_server;
///
/// let server = create_server().unwrap();
/// # }
/// ```
pub fn create_server() -> Result<GameServer, ServerError> {
    GameServer::new(ServerConfig::default())
}

/// Creates a new game server with custom configuration.
///
/// # Example
///
/// ```rust
/// # #[tokio::main]
/// # async fn main() {
/// use game_server::{create_server_with_config, ServerConfig};
///
/// let config = ServerConfig {
///     bind_address: "0.0.0.0:9000".parse().unwrap(),
///     max_connections: 5000,
///     ..Default::default()
/// };
///
/// let server = create_server_with_config(config).unwrap();
/// # }
/// ```
pub fn create_server_with_config(config: ServerConfig) -> Result<GameServer, ServerError> {
    GameServer::new(config)
}

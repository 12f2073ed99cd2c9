//! Configuration management for the gateway.
//!
//! This module handles loading, validation, and conversion of the gateway
//! configuration from TOML files and command-line arguments.

use crate::cli::CliArgs;
use game_server::config::{SessionConfig, SocketConfig, StoreBackendKind, StoreConfig};
use game_server::protocol::MAX_FRAME_BYTES;
use game_server::ServerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Application configuration loaded from TOML file.
///
/// Engine sections (`[server.socket]`, `[session]`, `[store]`) use the
/// engine's own configuration types, so every engine option can be set
/// from the file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Listener and connection settings
    pub server: ServerSettings,
    /// Session sweeper settings
    #[serde(default)]
    pub session: SessionConfig,
    /// Two-tier session store settings
    #[serde(default)]
    pub store: StoreConfig,
    /// Tokio runtime settings
    #[serde(default)]
    pub runtime: RuntimeSettings,
    /// Login handling
    #[serde(default)]
    pub auth: AuthSettings,
    /// Logging configuration settings
    pub logging: LoggingSettings,
}

/// Server-specific configuration settings.
///
/// Controls network binding, connection limits, timeouts and framing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Network address to bind the server to (e.g., "127.0.0.1:8080")
    pub bind_address: String,
    /// Maximum number of concurrent client connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Reader idle timeout in milliseconds
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    /// Largest accepted frame payload in bytes (at most 1 MiB)
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Capacity of each connection's outbound queue
    #[serde(default = "default_outbound_queue_size")]
    pub outbound_queue_size: usize,
    /// Whether to use SO_REUSEPORT for multi-threaded accept loops
    #[serde(default)]
    pub use_reuse_port: bool,
    /// Number of accept loops (0 means one per CPU core with `use_reuse_port`)
    #[serde(default)]
    pub acceptor_count: usize,
    /// Listening socket options
    #[serde(default)]
    pub socket: SocketConfig,
}

fn default_max_connections() -> usize {
    10_000
}

fn default_idle_timeout_ms() -> u64 {
    60_000
}

fn default_max_frame_bytes() -> usize {
    MAX_FRAME_BYTES
}

fn default_outbound_queue_size() -> usize {
    1024
}

/// Tokio runtime configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeSettings {
    /// Worker threads; 0 uses one per CPU core
    pub worker_threads: usize,
}

/// Login configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthSettings {
    /// Registers a login handler that trusts any non-empty user id.
    /// Disable in production and register a real login handler instead.
    pub dev_login: bool,
}

impl Default for AuthSettings {
    fn default() -> Self {
        Self { dev_login: true }
    }
}

/// Logging system configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSettings {
    /// Log level filter (trace, debug, info, warn, error)
    pub level: String,
    /// Whether to output logs in JSON format
    pub json_format: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerSettings {
                bind_address: "127.0.0.1:8080".to_string(),
                max_connections: default_max_connections(),
                idle_timeout_ms: default_idle_timeout_ms(),
                max_frame_bytes: default_max_frame_bytes(),
                outbound_queue_size: default_outbound_queue_size(),
                use_reuse_port: false,
                acceptor_count: 0,
                socket: SocketConfig::default(),
            },
            session: SessionConfig::default(),
            store: StoreConfig::default(),
            runtime: RuntimeSettings::default(),
            auth: AuthSettings::default(),
            logging: LoggingSettings {
                level: "info".to_string(),
                json_format: false,
            },
        }
    }
}

impl AppConfig {
    /// Loads configuration from a TOML file.
    ///
    /// If the file doesn't exist, creates a default configuration file at
    /// the specified path and returns the default configuration.
    pub async fn load_from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        if path.exists() {
            let content = tokio::fs::read_to_string(path).await?;
            let config: AppConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            let default_config = AppConfig::default();
            let toml_content = toml::to_string_pretty(&default_config)?;
            tokio::fs::write(path, toml_content).await?;
            info!("Created default configuration file: {}", path.display());
            Ok(default_config)
        }
    }

    /// Reads only `runtime.worker_threads`, before any runtime exists.
    /// Missing or unreadable files yield 0.
    pub fn peek_worker_threads(path: &Path) -> usize {
        #[derive(Deserialize, Default)]
        struct Peek {
            #[serde(default)]
            runtime: RuntimeSettings,
        }

        std::fs::read_to_string(path)
            .ok()
            .and_then(|content| toml::from_str::<Peek>(&content).ok())
            .unwrap_or_default()
            .runtime
            .worker_threads
    }

    /// Applies command-line overrides on top of the file values.
    pub fn apply_cli(&mut self, args: &CliArgs) {
        if let Some(bind_address) = &args.bind_address {
            self.server.bind_address = bind_address.clone();
        }
        if let Some(log_level) = &args.log_level {
            self.logging.level = log_level.clone();
        }
        if args.json_logs {
            self.logging.json_format = true;
        }
        if let Some(workers) = args.workers {
            self.runtime.worker_threads = workers;
        }
    }

    /// Converts the application configuration to a game server configuration.
    pub fn to_server_config(&self) -> Result<ServerConfig, Box<dyn std::error::Error>> {
        Ok(ServerConfig {
            bind_address: self.server.bind_address.parse()?,
            acceptor_count: self.server.acceptor_count,
            use_reuse_port: self.server.use_reuse_port,
            max_connections: self.server.max_connections,
            idle_timeout_ms: self.server.idle_timeout_ms,
            max_frame_bytes: self.server.max_frame_bytes,
            outbound_queue_size: self.server.outbound_queue_size,
            socket: self.server.socket.clone(),
            session: self.session.clone(),
            store: self.store.clone(),
        })
    }

    /// Validates the configuration for consistency and correctness.
    ///
    /// # Returns
    ///
    /// `Ok(())` if the configuration is valid, or an error string describing the issue.
    pub fn validate(&self) -> Result<(), String> {
        if self.server.bind_address.parse::<std::net::SocketAddr>().is_err() {
            return Err(format!("Invalid bind address: {}", &self.server.bind_address));
        }

        if self.server.max_frame_bytes > MAX_FRAME_BYTES {
            return Err(format!(
                "server.max_frame_bytes {} exceeds the protocol limit of {MAX_FRAME_BYTES}",
                self.server.max_frame_bytes
            ));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(format!(
                "Invalid log level: {}. Must be one of: {valid_levels:?}",
                &self.logging.level
            ));
        }

        if self.store.backend != StoreBackendKind::None
            && self.store.local_ttl_ms > self.store.distributed_ttl_secs * 1000
        {
            return Err("store.local_ttl_ms must not exceed store.distributed_ttl_secs".to_string());
        }

        let server_config = self.to_server_config().map_err(|e| e.to_string())?;
        server_config.validate().map_err(|e| e.to_string())
    }
}

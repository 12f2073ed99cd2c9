//! # Game Gateway - Main Entry Point
//!
//! Standalone process around the [`game_server`] engine. This crate handles
//! CLI parsing, configuration loading, logging setup and the application
//! lifecycle; all connection, session and protocol work happens in the
//! engine.
//!
//! ## Quick Start
//!
//! ```bash
//! # Run with default configuration
//! gateway
//!
//! # Specify custom configuration
//! gateway --config production.toml
//!
//! # Override specific settings
//! gateway --bind 0.0.0.0:7000 --log-level debug --workers 8
//!
//! # JSON logging for production
//! gateway --json-logs
//! ```
//!
//! ## Configuration
//!
//! The gateway loads configuration from a TOML file (default: `config.toml`).
//! If the file doesn't exist, a default configuration will be created.
//!
//! ## Signal Handling
//!
//! The gateway shuts down gracefully on:
//! - SIGINT (Ctrl+C)
//! - SIGTERM (Unix systems)
//!
//! A second signal during shutdown exits immediately.

pub mod app;
pub mod cli;
pub mod config;
pub mod logging;
pub mod login;
pub mod signals;

pub use app::Application;
pub use cli::CliArgs;
pub use config::{AppConfig, AuthSettings, LoggingSettings, RuntimeSettings, ServerSettings};

/// Loads configuration, initializes logging and runs the gateway until a
/// shutdown signal arrives.
///
/// # Process
///
/// 1. Load the configuration file (created with defaults if missing)
/// 2. Apply command-line overrides
/// 3. Initialize logging
/// 4. Create and run the application
pub async fn init(args: CliArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = match AppConfig::load_from_file(&args.config_path).await {
        Ok(config) => config,
        Err(e) => {
            eprintln!(
                "❌ Failed to load configuration from {}: {e}",
                args.config_path.display()
            );
            return Err(e);
        }
    };
    config.apply_cli(&args);

    logging::setup_logging(&config.logging, args.json_logs)
        .map_err(|e| format!("Failed to setup logging: {e}"))?;

    Application::new(config)?.run().await
}

/// Builds the multi-threaded runtime. `workers == 0` keeps tokio's default
/// of one worker per CPU core.
pub fn build_runtime(workers: usize) -> std::io::Result<tokio::runtime::Runtime> {
    let mut builder = tokio::runtime::Builder::new_multi_thread();
    builder.enable_all().thread_name("gateway-worker");
    if workers > 0 {
        builder.worker_threads(workers);
    }
    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_default_config_converts() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());

        let server_config = config
            .to_server_config()
            .expect("Default config should convert to ServerConfig");
        assert_eq!(server_config.max_connections, config.server.max_connections);
        assert_eq!(server_config.idle_timeout_ms, config.server.idle_timeout_ms);
    }

    #[test]
    fn test_cli_overrides_reach_config() {
        let args = CliArgs {
            config_path: PathBuf::from("test.toml"),
            bind_address: Some("127.0.0.1:9000".to_string()),
            log_level: Some("debug".to_string()),
            json_logs: true,
            workers: Some(2),
        };

        let mut config = AppConfig::default();
        config.apply_cli(&args);
        assert_eq!(config.server.bind_address, "127.0.0.1:9000");
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json_format);
        assert_eq!(config.runtime.worker_threads, 2);
    }

    #[test]
    fn test_build_runtime_with_fixed_workers() {
        let runtime = build_runtime(2).unwrap();
        assert_eq!(runtime.block_on(async { 7 }), 7);
    }

    #[tokio::test]
    async fn test_init_fails_on_unparseable_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        tokio::fs::write(&path, "server = [not toml").await.unwrap();

        let args = CliArgs {
            config_path: path,
            bind_address: None,
            log_level: None,
            json_logs: false,
            workers: None,
        };
        assert!(init(args).await.is_err());
    }
}

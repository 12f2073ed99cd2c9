//! Main application logic and lifecycle management.
//!
//! This module contains the `Application` struct that orchestrates server
//! startup, periodic monitoring, and graceful shutdown.

use crate::{
    config::AppConfig,
    login::register_dev_login,
    logging::display_banner,
    signals::{spawn_force_exit_handler, wait_for_shutdown_signal},
};
use game_server::health::{HealthStatus, StatsSnapshot};
use game_server::GameServer;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Interval between periodic health reports.
const MONITOR_INTERVAL: Duration = Duration::from_secs(60);

/// Main application struct.
///
/// The `Application` struct manages the complete lifecycle of the gateway:
/// server initialization, health monitoring and graceful shutdown.
pub struct Application {
    /// Validated application configuration
    config: AppConfig,
    /// Game server instance
    server: Arc<GameServer>,
}

impl Application {
    /// Creates a new application from an already loaded configuration.
    ///
    /// # Process
    ///
    /// 1. Validate the configuration
    /// 2. Display startup banner
    /// 3. Initialize the game server
    /// 4. Register the development login handler when enabled
    pub fn new(config: AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        if let Err(e) = config.validate() {
            return Err(format!("Configuration validation failed: {e}").into());
        }
        info!("✅ Configuration validated successfully");

        display_banner(&config);

        let server = GameServer::new(config.to_server_config()?)?;
        if config.auth.dev_login {
            register_dev_login(&server);
        }

        Ok(Self {
            config,
            server: Arc::new(server),
        })
    }

    /// The server this application runs.
    pub fn server(&self) -> Arc<GameServer> {
        self.server.clone()
    }

    /// Runs the application until a shutdown signal arrives.
    pub async fn run(self) -> Result<(), Box<dyn std::error::Error>> {
        self.run_until(wait_for_shutdown_signal()).await
    }

    /// Runs the application until `shutdown` completes.
    ///
    /// # Shutdown Phases
    ///
    /// 1. Stop the monitoring task
    /// 2. Shut the server down (listeners, sessions, dispatch, connections)
    /// 3. Log final statistics
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), Box<dyn std::error::Error>>
    where
        F: std::future::Future<Output = Result<(), Box<dyn std::error::Error>>>,
    {
        info!("🌟 Starting Game Gateway Application");
        self.log_configuration_summary();

        let local_addr = self.server.start().await?;

        let monitoring_handle = {
            let server = self.server.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(MONITOR_INTERVAL);
                interval.tick().await;
                let mut last_frames = 0u64;

                loop {
                    interval.tick().await;
                    let health = server.health().await;
                    let frames_this_period = health.stats.frames_received - last_frames;
                    last_frames = health.stats.frames_received;

                    info!(
                        "📊 System Health - {:?} | {} sessions | {} connections | {} frames/min",
                        health.status,
                        health.active_sessions,
                        health.stats.connections_active,
                        frames_this_period
                    );
                    if health.status == HealthStatus::Degraded {
                        warn!(
                            "⚠️ Session store degraded ({} failed backend operations); sessions are local-only",
                            health.stats.store_degraded_ops
                        );
                    }
                }
            })
        };

        info!("✅ Game Gateway is now running!");
        info!("🎮 Ready to accept connections on {}", local_addr);
        info!("🔍 Health monitoring active - stats every {}s", MONITOR_INTERVAL.as_secs());
        info!("🛑 Press Ctrl+C to gracefully shutdown");

        if let Err(e) = shutdown.await {
            warn!("Shutdown signal handling failed: {e}; shutting down");
        }
        spawn_force_exit_handler();

        info!("📡 Phase 1: Stopping monitoring...");
        monitoring_handle.abort();

        info!("🧹 Phase 2: Shutting down the server...");
        self.server.shutdown().await;

        log_final_statistics(&self.server.stats().snapshot());
        info!("✅ Game Gateway shutdown complete");
        Ok(())
    }

    /// Logs the configuration summary at startup.
    fn log_configuration_summary(&self) {
        info!("📋 Configuration Summary:");
        info!("  🌐 Bind address: {}", self.config.server.bind_address);
        info!("  👥 Max connections: {}", self.config.server.max_connections);
        info!("  ⏱️ Idle timeout: {}ms", self.config.server.idle_timeout_ms);
        info!("  📦 Max frame: {} bytes", self.config.server.max_frame_bytes);
        info!(
            "  🗄️ Session store: {:?} (local cache {} entries)",
            self.config.store.backend, self.config.store.local_max_entries
        );
        info!(
            "  🔓 Dev login: {}",
            if self.config.auth.dev_login { "enabled" } else { "disabled" }
        );
    }
}

/// Logs final statistics during shutdown.
fn log_final_statistics(stats: &StatsSnapshot) {
    info!("📊 Final Statistics:");
    info!("  - Uptime: {}s", stats.uptime_seconds);
    info!(
        "  - Connections: {} accepted, {} rejected",
        stats.connections_accepted, stats.connections_rejected
    );
    info!(
        "  - Frames: {} received, {} dispatched, {} unhandled",
        stats.frames_received, stats.frames_dispatched, stats.unhandled_messages
    );
    info!(
        "  - Failures: {} handler, {} protocol, {} idle timeouts",
        stats.handler_failures, stats.protocol_violations, stats.idle_timeouts
    );
    info!(
        "  - Sessions: {} created, {} evicted",
        stats.sessions_created, stats.sessions_evicted
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use game_server::config::StoreBackendKind;
    use tokio::sync::oneshot;

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.server.bind_address = "127.0.0.1:0".to_string();
        config.store.backend = StoreBackendKind::None;
        config
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let mut config = test_config();
        config.logging.level = "loud".to_string();
        assert!(Application::new(config).is_err());
    }

    #[tokio::test]
    async fn test_dev_login_follows_config() {
        let app = Application::new(test_config()).unwrap();
        assert!(app.server().dispatcher().is_registered(game_server::protocol::ids::LOGIN_REQUEST));

        let mut config = test_config();
        config.auth.dev_login = false;
        let app = Application::new(config).unwrap();
        assert!(!app.server().dispatcher().is_registered(game_server::protocol::ids::LOGIN_REQUEST));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_run_until_shuts_server_down() {
        let app = Application::new(test_config()).unwrap();
        let server = app.server();
        let (stop, stopped) = oneshot::channel::<()>();

        let run = app.run_until(async move {
            let _ = stopped.await;
            Ok(())
        });
        let observe = async {
            for _ in 0..100 {
                if server.is_running().await {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            let was_running = server.is_running().await;
            let _ = stop.send(());
            was_running
        };

        let (result, was_running) = tokio::join!(run, observe);
        result.unwrap();
        assert!(was_running);
        assert!(!server.is_running().await);
        assert!(server.dispatcher().is_shut_down());
    }
}

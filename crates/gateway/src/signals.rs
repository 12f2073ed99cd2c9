//! Signal handling for graceful server shutdown.
//!
//! The first termination signal starts a graceful shutdown; a second one
//! ends the process immediately.

use tokio::signal;
use tracing::{error, info, warn};

/// Waits for a termination signal (SIGINT or SIGTERM on Unix, Ctrl+C on
/// Windows) and logs it.
pub async fn wait_for_shutdown_signal() -> Result<(), Box<dyn std::error::Error>> {
    wait_for_signal().await?;
    info!("📡 Received shutdown signal - initiating graceful shutdown");
    Ok(())
}

async fn wait_for_signal() -> Result<(), Box<dyn std::error::Error>> {
    #[cfg(unix)]
    {
        use signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt())?;
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = sigint.recv() => (),
            _ = sigterm.recv() => ()
        }
    }

    #[cfg(windows)]
    signal::ctrl_c().await?;

    Ok(())
}

/// Exits the process if another signal arrives while shutting down.
pub fn spawn_force_exit_handler() {
    tokio::spawn(async {
        if let Err(e) = wait_for_signal().await {
            error!("Failed to set up forced shutdown signal handler: {e}");
            return;
        }

        warn!("Shutdown signal received again! Exiting immediately.");
        std::process::exit(1);
    });
}

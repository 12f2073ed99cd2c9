//! Tracing subscriber setup and the startup banner.
//!
//! Output is either human-readable or JSON, with thread ids and names on every
//! line so per-connection tasks can be followed across workers.

use crate::config::{AppConfig, LoggingSettings};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry};

/// Dependencies that are chatty at debug level.
const QUIET_TARGETS: &[&str] = &["redis=warn", "mio=warn"];

fn build_filter(level: &str) -> EnvFilter {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return filter;
    }
    QUIET_TARGETS
        .iter()
        .filter_map(|directive| directive.parse().ok())
        .fold(EnvFilter::new(level), |filter, directive| filter.add_directive(directive))
}

/// Installs the global subscriber.
///
/// `RUST_LOG`, when set, replaces the configured level entirely. JSON output is
/// used when either the file or the CLI asks for it. Fails if a subscriber is
/// already installed.
pub fn setup_logging(
    config: &LoggingSettings,
    json_format: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let layer: Box<dyn Layer<Registry> + Send + Sync> = if json_format || config.json_format {
        fmt::layer()
            .json()
            .with_current_span(false)
            .with_thread_ids(true)
            .with_thread_names(true)
            .boxed()
    } else {
        fmt::layer()
            .with_target(false)
            .with_thread_ids(true)
            .with_thread_names(true)
            .boxed()
    };

    tracing_subscriber::registry()
        .with(layer)
        .with(build_filter(&config.level))
        .try_init()?;

    info!("🔧 Logging initialized at level {}", config.level);
    Ok(())
}

/// Logs the startup banner with the settings an operator checks first.
pub fn display_banner(config: &AppConfig) {
    let version = option_env!("CARGO_PKG_VERSION").unwrap_or("unknown");
    info!("🎮 Game Gateway v{}", version);
    info!("   📡 Listening on {}", config.server.bind_address);
    info!("   🗄️  Session backend: {:?}", config.store.backend);
    if config.auth.dev_login {
        info!("   🔓 Development login enabled; do not expose this instance publicly");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_install_fails() {
        let settings = AppConfig::default().logging;
        let first = setup_logging(&settings, false);
        let second = setup_logging(&settings, true);
        // Another test in this binary may have installed one first.
        assert!(first.is_err() || second.is_err());
        assert!(second.is_err());
    }
}

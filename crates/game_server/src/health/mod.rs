//! Health reporting for production deployment.
//!
//! Health is derived from the server's counters and the state of the
//! distributed store's circuit breaker. A server whose distributed tier is
//! unreachable keeps serving from the local cache and reports `Degraded`.

use serde::{Deserialize, Serialize};

pub mod circuit_breaker;
pub mod metrics;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerState};
pub use metrics::{ServerStats, StatsSnapshot};

/// Overall health status of the server
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Health check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub running: bool,
    pub active_sessions: usize,
    /// `None` when no distributed backend is configured
    pub store_circuit: Option<CircuitBreakerState>,
    pub stats: StatsSnapshot,
}

impl HealthReport {
    /// Derives the overall status from its parts.
    pub fn evaluate(
        running: bool,
        active_sessions: usize,
        store_circuit: Option<CircuitBreakerState>,
        stats: StatsSnapshot,
    ) -> Self {
        let status = if !running {
            HealthStatus::Unhealthy
        } else if matches!(
            store_circuit,
            Some(CircuitBreakerState::Open | CircuitBreakerState::HalfOpen)
        ) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };
        Self {
            status,
            running,
            active_sessions,
            store_circuit,
            stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_follows_store_circuit() {
        let healthy = HealthReport::evaluate(true, 3, Some(CircuitBreakerState::Closed), StatsSnapshot::default());
        assert_eq!(healthy.status, HealthStatus::Healthy);

        let degraded = HealthReport::evaluate(true, 3, Some(CircuitBreakerState::Open), StatsSnapshot::default());
        assert_eq!(degraded.status, HealthStatus::Degraded);

        let local_only = HealthReport::evaluate(true, 0, None, StatsSnapshot::default());
        assert_eq!(local_only.status, HealthStatus::Healthy);
    }

    #[test]
    fn test_stopped_server_is_unhealthy() {
        let report = HealthReport::evaluate(false, 0, None, StatsSnapshot::default());
        assert_eq!(report.status, HealthStatus::Unhealthy);
    }
}

//! Circuit breaker guarding the distributed session backend.
//!
//! After `failure_threshold` consecutive failures the breaker opens and every
//! call short-circuits with [`StoreError::CircuitOpen`] until `open_timeout`
//! has elapsed. The next call is then let through as a probe (half-open);
//! `success_threshold` consecutive successes close the breaker again, one
//! failure re-opens it.

use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitBreakerState {
    /// Calls pass through
    Closed,
    /// Calls are rejected without touching the backend
    Open,
    /// Probe calls are allowed to test recovery
    HalfOpen,
}

/// Circuit breaker configuration, as found under `[store.circuit_breaker]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the circuit opens
    pub failure_threshold: u32,
    /// How long the circuit stays open before probing, in milliseconds
    pub open_timeout_ms: u64,
    /// Consecutive probe successes needed to close the circuit
    pub success_threshold: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout_ms: 10_000,
            success_threshold: 2,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_millis(self.open_timeout_ms)
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitBreakerState,
    consecutive_failures: u32,
    probe_successes: u32,
    opened_at: Option<Instant>,
    trips: u64,
}

/// Circuit breaker for a single downstream dependency.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: RwLock<BreakerInner>,
}

impl CircuitBreaker {
    /// Creates a closed circuit breaker.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: RwLock::new(BreakerInner {
                state: CircuitBreakerState::Closed,
                consecutive_failures: 0,
                probe_successes: 0,
                opened_at: None,
                trips: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Checks whether a call may proceed, moving `Open → HalfOpen` once the
    /// open timeout has elapsed.
    pub async fn can_execute(&self) -> bool {
        {
            let inner = self.inner.read().await;
            match inner.state {
                CircuitBreakerState::Closed | CircuitBreakerState::HalfOpen => return true,
                CircuitBreakerState::Open => {
                    let waited = inner.opened_at.map(|t| t.elapsed()).unwrap_or_default();
                    if waited < self.config.open_timeout() {
                        return false;
                    }
                }
            }
        }

        let mut inner = self.inner.write().await;
        if inner.state == CircuitBreakerState::Open {
            inner.state = CircuitBreakerState::HalfOpen;
            inner.probe_successes = 0;
            tracing::info!("Circuit breaker '{}' transitioned to HALF-OPEN", self.name);
        }
        true
    }

    /// Records a successful call.
    pub async fn record_success(&self) {
        let mut inner = self.inner.write().await;
        match inner.state {
            CircuitBreakerState::Closed => inner.consecutive_failures = 0,
            CircuitBreakerState::HalfOpen => {
                inner.probe_successes += 1;
                if inner.probe_successes >= self.config.success_threshold {
                    inner.state = CircuitBreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.probe_successes = 0;
                    inner.opened_at = None;
                    tracing::info!("Circuit breaker '{}' transitioned to CLOSED", self.name);
                }
            }
            CircuitBreakerState::Open => {}
        }
    }

    /// Records a failed call.
    pub async fn record_failure(&self) {
        let mut inner = self.inner.write().await;
        let trip = match inner.state {
            CircuitBreakerState::Closed => {
                inner.consecutive_failures += 1;
                inner.consecutive_failures >= self.config.failure_threshold
            }
            CircuitBreakerState::HalfOpen => true,
            CircuitBreakerState::Open => false,
        };
        if trip {
            inner.state = CircuitBreakerState::Open;
            inner.opened_at = Some(Instant::now());
            inner.probe_successes = 0;
            inner.trips += 1;
            tracing::warn!("Circuit breaker '{}' transitioned to OPEN", self.name);
        }
    }

    /// Runs `operation` under the breaker's protection.
    pub async fn call<T, F>(&self, operation: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        if !self.can_execute().await {
            return Err(StoreError::CircuitOpen(self.name.clone()));
        }
        match operation.await {
            Ok(value) => {
                self.record_success().await;
                Ok(value)
            }
            Err(error) => {
                self.record_failure().await;
                Err(error)
            }
        }
    }

    pub async fn is_open(&self) -> bool {
        self.inner.read().await.state == CircuitBreakerState::Open
    }

    pub async fn get_state(&self) -> CircuitBreakerState {
        self.inner.read().await.state
    }

    pub async fn get_stats(&self) -> CircuitBreakerStats {
        let inner = self.inner.read().await;
        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            trips: inner.trips,
        }
    }

    /// Forces the breaker closed.
    pub async fn reset(&self) {
        let mut inner = self.inner.write().await;
        inner.state = CircuitBreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.probe_successes = 0;
        inner.opened_at = None;
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerStats {
    pub name: String,
    pub state: CircuitBreakerState,
    pub consecutive_failures: u32,
    /// Number of times the breaker has opened
    pub trips: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(failure_threshold: u32, success_threshold: u32) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig {
                failure_threshold,
                open_timeout_ms: 100,
                success_threshold,
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_closed_to_open() {
        let cb = breaker(3, 2);
        assert!(cb.can_execute().await);

        cb.record_failure().await;
        cb.record_failure().await;
        assert_eq!(cb.get_state().await, CircuitBreakerState::Closed);

        cb.record_failure().await;
        assert_eq!(cb.get_state().await, CircuitBreakerState::Open);
        assert!(!cb.can_execute().await);
        assert_eq!(cb.get_stats().await.trips, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_failure_streak() {
        let cb = breaker(2, 1);
        cb.record_failure().await;
        cb.record_success().await;
        cb.record_failure().await;
        assert_eq!(cb.get_state().await, CircuitBreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_half_open_recovery() {
        let cb = breaker(2, 2);
        cb.record_failure().await;
        cb.record_failure().await;
        assert!(cb.is_open().await);

        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(cb.can_execute().await);
        assert_eq!(cb.get_state().await, CircuitBreakerState::HalfOpen);

        cb.record_success().await;
        cb.record_success().await;
        assert_eq!(cb.get_state().await, CircuitBreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_breaker_half_open_failure() {
        let cb = breaker(1, 2);
        cb.record_failure().await;
        tokio::time::advance(Duration::from_millis(150)).await;
        assert!(cb.can_execute().await);

        cb.record_failure().await;
        assert_eq!(cb.get_state().await, CircuitBreakerState::Open);
        assert!(!cb.can_execute().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_short_circuits_when_open() {
        let cb = breaker(1, 1);
        let first: StoreResult<()> = cb
            .call(async { Err(StoreError::Unavailable("down".into())) })
            .await;
        assert!(matches!(first, Err(StoreError::Unavailable(_))));

        let second = cb.call(async { Ok(1) }).await;
        assert!(matches!(second, Err(StoreError::CircuitOpen(name)) if name == "test"));
    }
}

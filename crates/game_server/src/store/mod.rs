//! Two-tier session storage.
//!
//! The session layer talks to a [`SessionStore`]. The production store is
//! [`TieredSessionStore`]: a bounded in-process cache answering every read
//! first, in front of an optional distributed [`SessionBackend`] that lets
//! other instances see this node's sessions. Backend trouble never reaches
//! callers of the store; it is logged, counted and the store carries on
//! with local data.

pub mod local;
pub mod memory;
pub mod redis;
pub mod tiered;

pub use local::LocalSessionCache;
pub use memory::MemoryBackend;
pub use self::redis::RedisBackend;
pub use tiered::TieredSessionStore;

use crate::config::{StoreBackendKind, StoreConfig};
use crate::error::{ServerError, StoreResult};
use crate::health::{CircuitBreakerState, ServerStats};
use crate::session::{SessionData, SessionId};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Session persistence as seen by the session layer.
///
/// Every operation is infallible from the caller's point of view: when the
/// distributed tier fails, reads fall back to local data and writes are
/// applied locally only.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Writes the session locally and to the distributed tier.
    async fn store_session(&self, data: SessionData);

    /// Local first, then the distributed tier. A distributed hit is
    /// written back into the local cache.
    async fn get_session(&self, id: SessionId) -> Option<SessionData>;

    /// Same lookup order as [`SessionStore::get_session`], via the user index.
    async fn get_session_by_user_id(&self, user_id: &str) -> Option<SessionData>;

    /// Removes the session and its user index entry from both tiers.
    async fn remove_session(&self, id: SessionId);

    /// Records activity. The local tier is updated before returning; the
    /// distributed update may be deferred or skipped under load.
    async fn update_active_time(&self, id: SessionId, last_active_ms: u64);

    /// Union of local ids and, when reachable, distributed ids.
    async fn get_all_session_ids(&self) -> Vec<SessionId>;

    async fn get_session_count(&self) -> usize;

    /// Empties the local tier and this store's distributed namespace.
    async fn clear_all(&self);

    /// State of the circuit protecting the distributed tier, if there is one.
    async fn circuit_state(&self) -> Option<CircuitBreakerState> {
        None
    }
}

/// A distributed key-value backend for session records.
///
/// Implementations keep a user index alongside the records and expire
/// records after the supplied TTL.
#[async_trait]
pub trait SessionBackend: Send + Sync + std::fmt::Debug {
    /// Short name used in logs and circuit breaker names.
    fn name(&self) -> &'static str;

    /// Writes the record with `ttl` and updates the user index.
    async fn put(&self, data: &SessionData, ttl: Duration) -> StoreResult<()>;

    async fn get(&self, id: SessionId) -> StoreResult<Option<SessionData>>;

    async fn get_by_user(&self, user_id: &str) -> StoreResult<Option<SessionData>>;

    /// Deletes the record. The user index entry is deleted only while it
    /// still points at `id`.
    async fn remove(&self, id: SessionId) -> StoreResult<()>;

    /// Updates the recorded activity time and refreshes the TTL.
    /// Missing records are left missing.
    async fn touch(&self, id: SessionId, last_active_ms: u64, ttl: Duration) -> StoreResult<()>;

    async fn session_ids(&self) -> StoreResult<Vec<SessionId>>;

    async fn count(&self) -> StoreResult<usize>;

    async fn exists(&self, id: SessionId) -> StoreResult<bool>;

    /// Resets the record's expiry. Returns false when the record is missing.
    async fn set_expire(&self, id: SessionId, ttl: Duration) -> StoreResult<bool>;

    /// Remaining TTL in seconds, -1 for no expiry, -2 for a missing record.
    async fn ttl(&self, id: SessionId) -> StoreResult<i64>;

    async fn clear(&self) -> StoreResult<()>;
}

/// Builds the store described by `config`.
///
/// No connection is made here; only the backend endpoint is validated.
pub fn build_store(
    config: &StoreConfig,
    stats: Arc<ServerStats>,
) -> Result<TieredSessionStore, ServerError> {
    let backend: Option<Arc<dyn SessionBackend>> = match config.backend {
        StoreBackendKind::None => None,
        StoreBackendKind::Memory => Some(Arc::new(MemoryBackend::new())),
        StoreBackendKind::Redis => {
            let backend = RedisBackend::new(&config.endpoint, &config.key_prefix).map_err(|e| {
                ServerError::Config(format!("invalid session store endpoint {}: {e}", config.endpoint))
            })?;
            Some(Arc::new(backend))
        }
    };

    match &backend {
        Some(backend) => tracing::info!("🗄️ Session store: local cache + {} backend", backend.name()),
        None => tracing::info!("🗄️ Session store: local cache only"),
    }

    Ok(TieredSessionStore::new(config, backend, stats))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_build_store_follows_backend_kind() {
        let stats = Arc::new(ServerStats::new());
        let none = StoreConfig {
            backend: StoreBackendKind::None,
            ..Default::default()
        };
        assert!(!build_store(&none, stats.clone()).unwrap().has_backend());
        assert!(build_store(&StoreConfig::default(), stats.clone()).unwrap().has_backend());

        let bad = StoreConfig {
            backend: StoreBackendKind::Redis,
            endpoint: "nonsense".into(),
            ..Default::default()
        };
        assert!(matches!(build_store(&bad, stats), Err(ServerError::Config(_))));
    }
}

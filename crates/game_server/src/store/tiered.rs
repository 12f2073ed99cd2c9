//! Local cache in front of an optional distributed backend.
//!
//! Reads go local first and fall through to the backend on a miss, writing
//! the result back into the cache. Writes are applied locally before the
//! backend is called. Every backend call is bounded by the call timeout and
//! guarded by a circuit breaker; a failed call is logged, counted and
//! otherwise ignored.

use super::{LocalSessionCache, SessionBackend, SessionStore};
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::health::{CircuitBreaker, CircuitBreakerState, ServerStats};
use crate::session::{SessionData, SessionId};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Distributed tier plus the guards around it.
#[derive(Debug)]
struct Remote {
    backend: Arc<dyn SessionBackend>,
    breaker: CircuitBreaker,
    call_timeout: Duration,
    ttl: Duration,
    stats: Arc<ServerStats>,
}

impl Remote {
    /// Runs one backend call. `None` means the call failed and the caller
    /// should carry on with local data.
    async fn call<T, F>(&self, op: &'static str, fut: F) -> Option<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        let timeout = self.call_timeout;
        let guarded = self.breaker.call(async move {
            match tokio::time::timeout(timeout, fut).await {
                Ok(result) => result,
                Err(_) => Err(StoreError::Timeout(timeout.as_millis() as u64)),
            }
        });
        match guarded.await {
            Ok(value) => Some(value),
            Err(StoreError::CircuitOpen(name)) => {
                self.stats.store_degraded();
                tracing::debug!("Skipping {} {}: circuit '{}' open", self.backend.name(), op, name);
                None
            }
            Err(e) => {
                self.stats.store_degraded();
                tracing::warn!("⚠️ Session store {} {} failed, using local data: {}", self.backend.name(), op, e);
                None
            }
        }
    }
}

/// The engine's session store.
#[derive(Debug)]
pub struct TieredSessionStore {
    local: LocalSessionCache,
    remote: Option<Arc<Remote>>,
    write_behind: Arc<Semaphore>,
    stats: Arc<ServerStats>,
}

impl TieredSessionStore {
    pub fn new(
        config: &StoreConfig,
        backend: Option<Arc<dyn SessionBackend>>,
        stats: Arc<ServerStats>,
    ) -> Self {
        let remote = backend.map(|backend| {
            Arc::new(Remote {
                breaker: CircuitBreaker::new(
                    format!("session-store-{}", backend.name()),
                    config.circuit_breaker.clone(),
                ),
                backend,
                call_timeout: config.call_timeout(),
                ttl: config.distributed_ttl(),
                stats: stats.clone(),
            })
        });
        Self {
            local: LocalSessionCache::new(config.local_max_entries, config.local_ttl()),
            remote,
            write_behind: Arc::new(Semaphore::new(config.write_behind_concurrency.max(1))),
            stats,
        }
    }

    /// Local cache only.
    pub fn local_only(config: &StoreConfig, stats: Arc<ServerStats>) -> Self {
        Self::new(config, None, stats)
    }

    pub fn local(&self) -> &LocalSessionCache {
        &self.local
    }

    pub fn has_backend(&self) -> bool {
        self.remote.is_some()
    }

    /// True when the session is cached locally or present in the backend.
    pub async fn exists(&self, id: SessionId) -> bool {
        if self.local.get(id).is_some() {
            return true;
        }
        match &self.remote {
            Some(remote) => remote
                .call("exists", remote.backend.exists(id))
                .await
                .unwrap_or(false),
            None => false,
        }
    }

    /// Resets the distributed record's expiry. False when there is no
    /// backend, the record is missing or the backend is unreachable.
    pub async fn set_expire(&self, id: SessionId, ttl: Duration) -> bool {
        match &self.remote {
            Some(remote) => remote
                .call("expire", remote.backend.set_expire(id, ttl))
                .await
                .unwrap_or(false),
            None => false,
        }
    }

    /// Remaining distributed TTL in seconds; -1 for no expiry, -2 when
    /// absent. Without a backend a locally cached session reports -1.
    /// `None` when the backend could not answer, which says nothing about
    /// whether the session exists.
    pub async fn get_ttl(&self, id: SessionId) -> Option<i64> {
        match &self.remote {
            Some(remote) => remote.call("ttl", remote.backend.ttl(id)).await,
            None if self.local.get(id).is_some() => Some(-1),
            None => Some(-2),
        }
    }
}

#[async_trait]
impl SessionStore for TieredSessionStore {
    async fn store_session(&self, data: SessionData) {
        self.local.insert(data.clone());
        if let Some(remote) = &self.remote {
            remote.call("put", remote.backend.put(&data, remote.ttl)).await;
        }
    }

    async fn get_session(&self, id: SessionId) -> Option<SessionData> {
        if let Some(data) = self.local.get(id) {
            return Some(data);
        }
        let remote = self.remote.as_ref()?;
        let data = remote.call("get", remote.backend.get(id)).await.flatten()?;
        self.local.insert(data.clone());
        Some(data)
    }

    async fn get_session_by_user_id(&self, user_id: &str) -> Option<SessionData> {
        if let Some(data) = self.local.get_by_user(user_id) {
            return Some(data);
        }
        let remote = self.remote.as_ref()?;
        let data = remote
            .call("get_by_user", remote.backend.get_by_user(user_id))
            .await
            .flatten()?;
        self.local.insert(data.clone());
        Some(data)
    }

    async fn remove_session(&self, id: SessionId) {
        self.local.remove(id);
        if let Some(remote) = &self.remote {
            remote.call("remove", remote.backend.remove(id)).await;
        }
    }

    async fn update_active_time(&self, id: SessionId, last_active_ms: u64) {
        self.local.update_active_time(id, last_active_ms);
        let Some(remote) = &self.remote else {
            return;
        };
        let Ok(permit) = self.write_behind.clone().try_acquire_owned() else {
            self.stats.write_behind_skip();
            tracing::trace!("Write-behind saturated, skipping activity update for {}", id);
            return;
        };
        let remote = remote.clone();
        tokio::spawn(async move {
            let _permit = permit;
            remote
                .call("touch", remote.backend.touch(id, last_active_ms, remote.ttl))
                .await;
        });
    }

    async fn get_all_session_ids(&self) -> Vec<SessionId> {
        let mut ids: BTreeSet<SessionId> = self.local.ids().into_iter().collect();
        if let Some(remote) = &self.remote {
            if let Some(remote_ids) = remote.call("session_ids", remote.backend.session_ids()).await {
                ids.extend(remote_ids);
            }
        }
        ids.into_iter().collect()
    }

    async fn get_session_count(&self) -> usize {
        if self.remote.is_none() {
            return self.local.ids().len();
        }
        self.get_all_session_ids().await.len()
    }

    async fn clear_all(&self) {
        self.local.clear();
        if let Some(remote) = &self.remote {
            remote.call("clear", remote.backend.clear()).await;
        }
    }

    async fn circuit_state(&self) -> Option<CircuitBreakerState> {
        match &self.remote {
            Some(remote) => Some(remote.breaker.get_state().await),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::CircuitBreakerConfig;
    use crate::store::MemoryBackend;
    use std::collections::HashMap;
    use uuid::Uuid;

    fn data(id: u64, user: Option<&str>) -> SessionData {
        SessionData {
            session_id: SessionId(id),
            node_id: Uuid::nil(),
            user_id: user.map(str::to_string),
            authenticated: user.is_some(),
            remote_addr: "127.0.0.1:9000".parse().unwrap(),
            created_at_ms: 1,
            last_active_ms: 1,
            attributes: HashMap::new(),
        }
    }

    fn config() -> StoreConfig {
        StoreConfig {
            call_timeout_ms: 50,
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: 3,
                open_timeout_ms: 1_000,
                success_threshold: 1,
            },
            ..Default::default()
        }
    }

    fn store_with(backend: &MemoryBackend) -> (TieredSessionStore, Arc<ServerStats>) {
        let stats = Arc::new(ServerStats::new());
        let store = TieredSessionStore::new(&config(), Some(Arc::new(backend.clone())), stats.clone());
        (store, stats)
    }

    #[tokio::test]
    async fn test_store_writes_both_tiers() {
        let backend = MemoryBackend::new();
        let (store, _) = store_with(&backend);
        store.store_session(data(1, Some("alice"))).await;

        assert!(store.local().get(SessionId(1)).is_some());
        assert!(backend.get(SessionId(1)).await.unwrap().is_some());
        assert_eq!(store.get_session_count().await, 1);
    }

    #[tokio::test]
    async fn test_miss_reads_through_and_backfills() {
        let backend = MemoryBackend::new();
        let (node_a, _) = store_with(&backend);
        let (node_b, _) = store_with(&backend);
        node_a.store_session(data(7, Some("alice"))).await;

        assert!(node_b.local().get(SessionId(7)).is_none());
        assert_eq!(node_b.get_session(SessionId(7)).await.unwrap().session_id, SessionId(7));
        assert!(node_b.local().get(SessionId(7)).is_some());
        assert_eq!(
            node_b.get_session_by_user_id("alice").await.unwrap().session_id,
            SessionId(7)
        );
    }

    #[tokio::test]
    async fn test_backend_outage_degrades_to_local() {
        let backend = MemoryBackend::new();
        let (store, stats) = store_with(&backend);
        backend.set_available(false);

        store.store_session(data(1, Some("alice"))).await;
        assert_eq!(store.get_session(SessionId(1)).await.unwrap().session_id, SessionId(1));
        assert!(store.get_session(SessionId(2)).await.is_none());
        store.remove_session(SessionId(1)).await;
        assert!(store.get_session(SessionId(1)).await.is_none());
        assert!(stats.snapshot().store_degraded_ops >= 2);
    }

    #[tokio::test]
    async fn test_repeated_failures_open_the_circuit() {
        let backend = MemoryBackend::new();
        let (store, _) = store_with(&backend);
        backend.set_available(false);

        for id in 0..3 {
            store.get_session(SessionId(id)).await;
        }
        assert_eq!(store.circuit_state().await, Some(CircuitBreakerState::Open));

        let calls = backend.calls();
        store.get_session(SessionId(99)).await;
        assert_eq!(backend.calls(), calls);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_backend_times_out() {
        let backend = MemoryBackend::new();
        let (store, stats) = store_with(&backend);
        backend.set_delay(Duration::from_secs(5));

        store.store_session(data(1, None)).await;
        assert!(store.get_session(SessionId(1)).await.is_some());
        assert_eq!(stats.snapshot().store_degraded_ops, 1);
    }

    #[tokio::test]
    async fn test_update_active_time_is_local_first() {
        let backend = MemoryBackend::new();
        let (store, _) = store_with(&backend);
        store.store_session(data(1, None)).await;
        store.update_active_time(SessionId(1), 5_000).await;
        assert_eq!(store.local().get(SessionId(1)).unwrap().last_active_ms, 5_000);
    }

    #[tokio::test]
    async fn test_saturated_write_behind_skips_update() {
        let backend = MemoryBackend::new();
        let stats = Arc::new(ServerStats::new());
        let cfg = StoreConfig {
            write_behind_concurrency: 1,
            ..config()
        };
        let store = TieredSessionStore::new(&cfg, Some(Arc::new(backend.clone())), stats.clone());
        store.store_session(data(1, None)).await;

        let _held = store.write_behind.clone().try_acquire_owned().unwrap();
        store.update_active_time(SessionId(1), 9_000).await;
        assert_eq!(stats.snapshot().write_behind_skipped, 1);
        assert_eq!(store.local().get(SessionId(1)).unwrap().last_active_ms, 9_000);
    }

    #[tokio::test]
    async fn test_ids_are_union_of_tiers() {
        let backend = MemoryBackend::new();
        let (node_a, _) = store_with(&backend);
        let (node_b, _) = store_with(&backend);
        node_a.store_session(data(1, None)).await;
        node_b.store_session(data(2, None)).await;

        assert_eq!(node_a.get_all_session_ids().await, vec![SessionId(1), SessionId(2)]);
        node_a.clear_all().await;
        assert_eq!(node_b.get_all_session_ids().await, vec![SessionId(2)]);
    }

    #[tokio::test]
    async fn test_ttl_extras() {
        let backend = MemoryBackend::new();
        let (store, _) = store_with(&backend);
        store.store_session(data(1, None)).await;
        assert!(store.exists(SessionId(1)).await);
        assert!(store.get_ttl(SessionId(1)).await.unwrap() > 0);
        assert_eq!(store.get_ttl(SessionId(2)).await, Some(-2));
        assert!(store.set_expire(SessionId(1), Duration::from_secs(5)).await);

        backend.set_available(false);
        assert_eq!(store.get_ttl(SessionId(1)).await, None);
        assert!(store.exists(SessionId(1)).await);
        backend.set_available(true);

        let local = TieredSessionStore::local_only(&config(), Arc::new(ServerStats::new()));
        local.store_session(data(3, None)).await;
        assert_eq!(local.get_ttl(SessionId(3)).await, Some(-1));
        assert_eq!(local.get_ttl(SessionId(4)).await, Some(-2));
        assert!(!local.set_expire(SessionId(3), Duration::from_secs(5)).await);
        assert_eq!(local.circuit_state().await, None);
    }
}

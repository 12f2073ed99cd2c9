//! In-process distributed backend.
//!
//! Behaves like the Redis backend (JSON records, expiry, user index) but
//! lives in memory. Clones share state, so several servers in one process
//! can act as a cluster. Outages and slow responses can be injected for
//! testing degradation.

use super::SessionBackend;
use crate::error::{StoreError, StoreResult};
use crate::session::{SessionData, SessionId};
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct Record {
    json: String,
    expires_at: Option<Instant>,
}

impl Record {
    fn is_live(&self) -> bool {
        self.expires_at.map_or(true, |at| Instant::now() < at)
    }
}

#[derive(Debug, Default)]
struct Shared {
    records: DashMap<SessionId, Record>,
    users: DashMap<String, SessionId>,
    unavailable: AtomicBool,
    delay_ms: AtomicU64,
    calls: AtomicU64,
}

/// Shared in-memory session backend.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail with [`StoreError::Unavailable`] until restored.
    pub fn set_available(&self, available: bool) {
        self.shared.unavailable.store(!available, Ordering::SeqCst);
    }

    /// Delays every call by `delay`.
    pub fn set_delay(&self, delay: Duration) {
        self.shared
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of calls that reached the backend.
    pub fn calls(&self) -> u64 {
        self.shared.calls.load(Ordering::SeqCst)
    }

    async fn enter(&self) -> StoreResult<()> {
        self.shared.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.shared.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.shared.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory backend offline".into()));
        }
        Ok(())
    }

    fn live(&self, id: SessionId) -> Option<SessionData> {
        let json = {
            let record = self.shared.records.get(&id)?;
            record.is_live().then(|| record.json.clone())
        };
        match json {
            Some(json) => serde_json::from_str(&json).ok(),
            None => {
                self.shared.records.remove_if(&id, |_, r| !r.is_live());
                None
            }
        }
    }
}

#[async_trait]
impl SessionBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, data: &SessionData, ttl: Duration) -> StoreResult<()> {
        self.enter().await?;
        let json = serde_json::to_string(data)?;
        self.shared.records.insert(
            data.session_id,
            Record {
                json,
                expires_at: Some(Instant::now() + ttl),
            },
        );
        if let Some(user) = &data.user_id {
            self.shared.users.insert(user.clone(), data.session_id);
        }
        Ok(())
    }

    async fn get(&self, id: SessionId) -> StoreResult<Option<SessionData>> {
        self.enter().await?;
        Ok(self.live(id))
    }

    async fn get_by_user(&self, user_id: &str) -> StoreResult<Option<SessionData>> {
        self.enter().await?;
        let Some(id) = self.shared.users.get(user_id).map(|r| *r) else {
            return Ok(None);
        };
        Ok(self
            .live(id)
            .filter(|data| data.user_id.as_deref() == Some(user_id)))
    }

    async fn remove(&self, id: SessionId) -> StoreResult<()> {
        self.enter().await?;
        if let Some((_, record)) = self.shared.records.remove(&id) {
            let data: SessionData = serde_json::from_str(&record.json)?;
            if let Some(user) = data.user_id {
                self.shared.users.remove_if(&user, |_, sid| *sid == id);
            }
        }
        Ok(())
    }

    async fn touch(&self, id: SessionId, last_active_ms: u64, ttl: Duration) -> StoreResult<()> {
        self.enter().await?;
        // Read and rewrite under the entry lock so a concurrent put or
        // remove is never overwritten with an older record.
        let Some(mut record) = self.shared.records.get_mut(&id) else {
            return Ok(());
        };
        if !record.is_live() {
            return Ok(());
        }
        let mut data: SessionData = serde_json::from_str(&record.json)?;
        if last_active_ms > data.last_active_ms {
            data.last_active_ms = last_active_ms;
            record.json = serde_json::to_string(&data)?;
        }
        record.expires_at = Some(Instant::now() + ttl);
        Ok(())
    }

    async fn session_ids(&self) -> StoreResult<Vec<SessionId>> {
        self.enter().await?;
        Ok(self
            .shared
            .records
            .iter()
            .filter(|r| r.value().is_live())
            .map(|r| *r.key())
            .collect())
    }

    async fn count(&self) -> StoreResult<usize> {
        Ok(self.session_ids().await?.len())
    }

    async fn exists(&self, id: SessionId) -> StoreResult<bool> {
        self.enter().await?;
        Ok(self.live(id).is_some())
    }

    async fn set_expire(&self, id: SessionId, ttl: Duration) -> StoreResult<bool> {
        self.enter().await?;
        match self.shared.records.get_mut(&id) {
            Some(mut record) if record.is_live() => {
                record.expires_at = Some(Instant::now() + ttl);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ttl(&self, id: SessionId) -> StoreResult<i64> {
        self.enter().await?;
        let Some(record) = self.shared.records.get(&id) else {
            return Ok(-2);
        };
        Ok(match record.expires_at {
            None => -1,
            Some(_) if !record.is_live() => -2,
            Some(at) => at.saturating_duration_since(Instant::now()).as_secs() as i64,
        })
    }

    async fn clear(&self) -> StoreResult<()> {
        self.enter().await?;
        self.shared.records.clear();
        self.shared.users.clear();
        Ok(())
    }
}

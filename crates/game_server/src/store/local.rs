//! In-process tier of the session store.
//!
//! A bounded map of [`SessionData`] with per-entry expiry and a user index.
//! All operations are synchronous and never fail; the tiered store applies
//! them before any distributed call so local reads always reflect local
//! writes.

use crate::session::{SessionData, SessionId};
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct CacheEntry {
    data: SessionData,
    refreshed_at: Instant,
}

/// Bounded, expiring local session cache.
#[derive(Debug)]
pub struct LocalSessionCache {
    entries: DashMap<SessionId, CacheEntry>,
    users: DashMap<String, SessionId>,
    max_entries: usize,
    ttl: Duration,
}

impl LocalSessionCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            users: DashMap::new(),
            max_entries: max_entries.max(1),
            ttl,
        }
    }

    fn is_fresh(&self, entry: &CacheEntry) -> bool {
        entry.refreshed_at.elapsed() <= self.ttl
    }

    /// Inserts or replaces a record, evicting expired and then oldest
    /// entries when the cache is full.
    pub fn insert(&self, data: SessionData) {
        let id = data.session_id;
        if !self.entries.contains_key(&id) && self.entries.len() >= self.max_entries {
            self.make_room();
        }

        let user = data.user_id.clone();
        let previous = self.entries.insert(
            id,
            CacheEntry {
                data,
                refreshed_at: Instant::now(),
            },
        );

        if let Some(old_user) = previous.and_then(|p| p.data.user_id) {
            if user.as_deref() != Some(old_user.as_str()) {
                self.users.remove_if(&old_user, |_, sid| *sid == id);
            }
        }
        if let Some(user) = user {
            self.users.insert(user, id);
        }
    }

    fn make_room(&self) {
        if self.purge_expired() > 0 && self.entries.len() < self.max_entries {
            return;
        }
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.value().refreshed_at)
            .map(|e| *e.key());
        if let Some(id) = oldest {
            tracing::debug!("Local session cache full, evicting session {}", id);
            self.remove(id);
        }
    }

    pub fn get(&self, id: SessionId) -> Option<SessionData> {
        let fresh = {
            let entry = self.entries.get(&id)?;
            self.is_fresh(&entry).then(|| entry.data.clone())
        };
        if fresh.is_none() {
            self.remove_stale(id);
        }
        fresh
    }

    fn remove_stale(&self, id: SessionId) {
        if let Some((_, entry)) = self.entries.remove_if(&id, |_, e| !self.is_fresh(e)) {
            if let Some(user) = &entry.data.user_id {
                self.users.remove_if(user, |_, sid| *sid == id);
            }
        }
    }

    pub fn get_by_user(&self, user_id: &str) -> Option<SessionData> {
        let id = *self.users.get(user_id)?;
        let data = self.get(id)?;
        // The index may lag a rebinding; trust the record.
        (data.user_id.as_deref() == Some(user_id)).then_some(data)
    }

    pub fn remove(&self, id: SessionId) -> Option<SessionData> {
        let (_, entry) = self.entries.remove(&id)?;
        if let Some(user) = &entry.data.user_id {
            self.users.remove_if(user, |_, sid| *sid == id);
        }
        Some(entry.data)
    }

    /// Records activity and refreshes the entry's expiry.
    /// Returns false when the session is not cached.
    pub fn update_active_time(&self, id: SessionId, last_active_ms: u64) -> bool {
        match self.entries.get_mut(&id) {
            Some(mut entry) => {
                entry.data.last_active_ms = entry.data.last_active_ms.max(last_active_ms);
                entry.refreshed_at = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Ids of all unexpired entries.
    pub fn ids(&self) -> Vec<SessionId> {
        self.entries
            .iter()
            .filter(|e| self.is_fresh(e.value()))
            .map(|e| *e.key())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drops expired entries and returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let expired: Vec<SessionId> = self
            .entries
            .iter()
            .filter(|e| !self.is_fresh(e.value()))
            .map(|e| *e.key())
            .collect();
        for id in &expired {
            self.remove_stale(*id);
        }
        expired.len()
    }

    pub fn clear(&self) {
        self.entries.clear();
        self.users.clear();
    }
}

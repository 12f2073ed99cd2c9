//! Live sessions of this instance.
//!
//! The registry owns the three indices over local sessions (by id, by
//! connection, by bound user) and keeps the session store in step with
//! them. A user is bound to at most one session at a time: binding a user
//! that already has a session here evicts the older one first.

use super::{Session, SessionData, SessionId, SessionIdGenerator};
use crate::connection::{Connection, ConnectionId};
use crate::health::ServerStats;
use crate::protocol::{ids, Frame, KickNotice};
use crate::store::SessionStore;
use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

const BIND_LOCK_STRIPES: usize = 64;

/// Registry of sessions owned by this server instance.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Session>>,
    by_connection: DashMap<ConnectionId, SessionId>,
    by_user: DashMap<String, SessionId>,
    ids: SessionIdGenerator,
    node_id: Uuid,
    store: Arc<dyn SessionStore>,
    /// Serializes bindings of the same user.
    bind_locks: Vec<Mutex<()>>,
    stats: Arc<ServerStats>,
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("node_id", &self.node_id)
            .field("sessions", &self.sessions.len())
            .field("bound_users", &self.by_user.len())
            .finish()
    }
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn SessionStore>, stats: Arc<ServerStats>) -> Self {
        Self {
            sessions: DashMap::new(),
            by_connection: DashMap::new(),
            by_user: DashMap::new(),
            ids: SessionIdGenerator::new(),
            node_id: Uuid::new_v4(),
            store,
            bind_locks: (0..BIND_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            stats,
        }
    }

    /// Id of this instance, recorded in every session it creates.
    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    /// Creates an anonymous session for `connection`.
    ///
    /// A connection has at most one session; calling this again for the
    /// same connection returns the existing one.
    pub async fn create_session(&self, connection: Arc<dyn Connection>) -> Arc<Session> {
        let connection_id = connection.id();
        if let Some(existing) = self.get_session_by_connection(connection_id) {
            return existing;
        }

        let session = Arc::new(Session::new(self.ids.next_id(), self.node_id, connection));
        self.sessions.insert(session.id(), session.clone());
        self.by_connection.insert(connection_id, session.id());
        self.stats.session_created();
        self.store.store_session(session.to_data()).await;

        debug!(
            "🆕 Session {} created for connection {} ({})",
            session.id(),
            connection_id,
            session.remote_address()
        );
        session
    }

    pub fn get_session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|s| s.value().clone())
    }

    pub fn get_session_by_connection(&self, connection_id: ConnectionId) -> Option<Arc<Session>> {
        let id = *self.by_connection.get(&connection_id)?;
        self.get_session(id)
    }

    /// Local session currently bound to `user_id`.
    pub fn get_session_by_user(&self, user_id: &str) -> Option<Arc<Session>> {
        let id = *self.by_user.get(user_id)?;
        self.get_session(id)
    }

    /// Session record from the store, which may belong to another instance.
    pub async fn find_session(&self, id: SessionId) -> Option<SessionData> {
        if let Some(session) = self.get_session(id) {
            return Some(session.to_data());
        }
        self.store.get_session(id).await
    }

    /// Store lookup through the user index, which may span instances.
    pub async fn find_session_by_user(&self, user_id: &str) -> Option<SessionData> {
        if let Some(session) = self.get_session_by_user(user_id) {
            return Some(session.to_data());
        }
        self.store.get_session_by_user_id(user_id).await
    }

    fn bind_lock(&self, user_id: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        user_id.hash(&mut hasher);
        &self.bind_locks[(hasher.finish() as usize) % self.bind_locks.len()]
    }

    /// Binds `user_id` to the session and marks it authenticated.
    ///
    /// Any other local session bound to the same user receives a kick
    /// notice and is removed before the new binding is recorded. Returns
    /// false when the session does not exist.
    pub async fn bind_user(&self, session_id: SessionId, user_id: &str) -> bool {
        let _guard = self.bind_lock(user_id).lock().await;

        let Some(session) = self.get_session(session_id) else {
            warn!("Cannot bind user {}: session {} not found", user_id, session_id);
            return false;
        };

        let previous = self.by_user.get(user_id).map(|e| *e.value());
        if let Some(old_id) = previous.filter(|old_id| *old_id != session_id) {
            if let Some(old) = self.get_session(old_id) {
                let notice = KickNotice {
                    reason: "logged in from another connection".to_string(),
                };
                let _ = old.send_message(ids::KICK_NOTICE, &notice);
            }
            self.remove_session(old_id).await;
            info!("👢 User {} re-logged in; evicted session {}", user_id, old_id);
        }

        if let Some(prior_user) = session.bind(user_id) {
            if prior_user != user_id {
                self.by_user.remove_if(&prior_user, |_, sid| *sid == session_id);
            }
        }
        self.by_user.insert(user_id.to_string(), session_id);
        self.store.store_session(session.to_data()).await;

        // The connection may have been torn down while the store write was
        // in flight; its removal must win over the binding.
        if !self.sessions.contains_key(&session_id) {
            self.by_user.remove_if(user_id, |_, sid| *sid == session_id);
            self.store.remove_session(session_id).await;
            warn!(
                "Session {} closed while binding user {}; binding discarded",
                session_id, user_id
            );
            return false;
        }

        info!("🔐 Session {} bound to user {}", session_id, user_id);
        true
    }

    /// Records activity on the session and in the store.
    pub async fn touch(&self, session: &Session) {
        session.touch();
        self.store
            .update_active_time(session.id(), session.last_active_ms())
            .await;
    }

    /// Writes the session's current state, attributes included, to the store.
    pub async fn save(&self, session: &Session) {
        self.store.store_session(session.to_data()).await;
    }

    /// Removes a session from every index and the store, closing its
    /// connection. Removing an unknown session is a no-op.
    pub async fn remove_session(&self, id: SessionId) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(&id)?;
        self.by_connection
            .remove_if(&session.connection().id(), |_, sid| *sid == id);
        if let Some(user) = session.user_id() {
            self.by_user.remove_if(&user, |_, sid| *sid == id);
        }
        session.close();
        self.store.remove_session(id).await;
        debug!("🗑️ Session {} removed", id);
        Some(session)
    }

    pub async fn remove_by_connection(&self, connection_id: ConnectionId) -> Option<Arc<Session>> {
        let id = *self.by_connection.get(&connection_id)?;
        self.remove_session(id).await
    }

    /// Point-in-time list of local sessions.
    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    /// Sends `frame` to every active session matching `filter`.
    ///
    /// Works on a snapshot, so sessions joining or leaving meanwhile neither
    /// block nor break the broadcast. A failed send is logged and skipped.
    /// Returns the number of sessions the frame was queued for.
    pub fn broadcast_to<F>(&self, frame: &Frame, filter: F) -> usize
    where
        F: Fn(&Session) -> bool,
    {
        let targets: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .filter(|s| filter(s.value()))
            .map(|s| s.value().clone())
            .collect();

        let mut delivered = 0;
        for session in targets {
            if !session.is_active() {
                continue;
            }
            match session.send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => debug!("Broadcast to session {} failed: {}", session.id(), e),
            }
        }
        delivered
    }

    pub fn broadcast_to_all(&self, frame: &Frame) -> usize {
        self.broadcast_to(frame, |_| true)
    }

    pub fn broadcast_to_authenticated(&self, frame: &Frame) -> usize {
        self.broadcast_to(frame, Session::is_authenticated)
    }

    /// Evicts sessions idle longer than `timeout` or whose connection is
    /// gone. Returns the number evicted.
    pub async fn remove_inactive_sessions(&self, timeout: Duration) -> usize {
        let stale: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|s| s.is_expired(timeout) || !s.is_active())
            .map(|s| *s.key())
            .collect();

        let mut evicted = 0;
        for id in stale {
            if self.remove_session(id).await.is_some() {
                evicted += 1;
            }
        }
        if evicted > 0 {
            self.stats.sessions_evicted(evicted);
            info!("🧹 Evicted {} inactive sessions", evicted);
        }
        evicted
    }

    /// Notifies and removes every session. Used at shutdown.
    pub async fn evict_all(&self, reason: &str) -> usize {
        let notice = Frame::from_message(
            ids::KICK_NOTICE,
            &KickNotice {
                reason: reason.to_string(),
            },
        );
        self.broadcast_to_all(&notice);

        let all: Vec<SessionId> = self.sessions.iter().map(|s| *s.key()).collect();
        let mut evicted = 0;
        for id in all {
            if self.remove_session(id).await.is_some() {
                evicted += 1;
            }
        }
        self.stats.sessions_evicted(evicted);
        evicted
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn authenticated_count(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_authenticated()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::connection::testing::RecordingConnection;
    use crate::store::{MemoryBackend, SessionBackend, TieredSessionStore};
    use std::collections::HashSet;

    fn registry() -> SessionRegistry {
        let stats = Arc::new(ServerStats::new());
        let store = TieredSessionStore::local_only(&StoreConfig::default(), stats.clone());
        SessionRegistry::new(Arc::new(store), stats)
    }

    #[tokio::test]
    async fn test_create_session_indexes_and_stores() {
        let registry = registry();
        let conn = RecordingConnection::new();
        let session = registry.create_session(conn.clone()).await;

        assert_eq!(registry.session_count(), 1);
        assert_eq!(registry.get_session_by_connection(conn.id()).unwrap().id(), session.id());
        assert!(registry.store().get_session(session.id()).await.is_some());
        assert!(!session.is_authenticated());
        assert_eq!(session.node_id(), registry.node_id());
    }

    #[tokio::test]
    async fn test_create_session_twice_returns_same_session() {
        let registry = registry();
        let conn = RecordingConnection::new();
        let a = registry.create_session(conn.clone()).await;
        let b = registry.create_session(conn).await;
        assert_eq!(a.id(), b.id());
        assert_eq!(registry.session_count(), 1);
    }

    #[tokio::test]
    async fn test_bind_user_authenticates() {
        let registry = registry();
        let session = registry.create_session(RecordingConnection::new()).await;
        assert!(registry.bind_user(session.id(), "alice").await);

        assert!(session.is_authenticated());
        assert_eq!(registry.get_session_by_user("alice").unwrap().id(), session.id());
        let stored = registry.find_session_by_user("alice").await.unwrap();
        assert!(stored.authenticated);
        assert_eq!(registry.authenticated_count(), 1);
    }

    #[tokio::test]
    async fn test_bind_unknown_session_fails() {
        let registry = registry();
        assert!(!registry.bind_user(SessionId(42), "alice").await);
        assert!(registry.get_session_by_user("alice").is_none());
    }

    #[tokio::test]
    async fn test_second_login_evicts_first_session() {
        let registry = registry();
        let first_conn = RecordingConnection::new();
        let first = registry.create_session(first_conn.clone()).await;
        let second = registry.create_session(RecordingConnection::new()).await;

        registry.bind_user(first.id(), "alice").await;
        registry.bind_user(second.id(), "alice").await;

        assert_eq!(registry.get_session_by_user("alice").unwrap().id(), second.id());
        assert!(registry.get_session(first.id()).is_none());
        assert!(!first_conn.is_active());
        assert_eq!(first_conn.sent_ids(), vec![ids::KICK_NOTICE]);
        assert_eq!(registry.session_count(), 1);
    }

    #[tokio::test]
    async fn test_rebinding_session_drops_old_user() {
        let registry = registry();
        let session = registry.create_session(RecordingConnection::new()).await;
        registry.bind_user(session.id(), "alice").await;
        registry.bind_user(session.id(), "bob").await;

        assert!(registry.get_session_by_user("alice").is_none());
        assert_eq!(registry.get_session_by_user("bob").unwrap().id(), session.id());
    }

    #[tokio::test]
    async fn test_remove_session_is_idempotent_and_closes() {
        let registry = registry();
        let conn = RecordingConnection::new();
        let session = registry.create_session(conn.clone()).await;
        registry.bind_user(session.id(), "alice").await;

        assert!(registry.remove_session(session.id()).await.is_some());
        assert!(registry.remove_session(session.id()).await.is_none());
        assert!(!conn.is_active());
        assert!(registry.get_session_by_user("alice").is_none());
        assert!(registry.get_session_by_connection(conn.id()).is_none());
        assert!(registry.store().get_session(session.id()).await.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_skips_failures_and_filters() {
        let registry = registry();
        let healthy = RecordingConnection::new();
        let broken = RecordingConnection::new();
        let anonymous = RecordingConnection::new();

        let a = registry.create_session(healthy.clone()).await;
        let b = registry.create_session(broken.clone()).await;
        registry.create_session(anonymous.clone()).await;
        registry.bind_user(a.id(), "alice").await;
        registry.bind_user(b.id(), "bob").await;
        broken.break_sends();

        let frame = Frame::new(77, vec![1, 2, 3]);
        assert_eq!(registry.broadcast_to_authenticated(&frame), 1);
        assert_eq!(registry.broadcast_to_all(&frame), 2);
        assert_eq!(healthy.sent_ids(), vec![77, 77]);
        assert_eq!(anonymous.sent_ids(), vec![77]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_inactive_sessions() {
        let registry = registry();
        let idle = registry.create_session(RecordingConnection::new()).await;
        tokio::time::advance(Duration::from_secs(10)).await;

        let fresh = registry.create_session(RecordingConnection::new()).await;
        let dead_conn = RecordingConnection::new();
        let dead = registry.create_session(dead_conn.clone()).await;
        dead_conn.close();

        assert_eq!(registry.remove_inactive_sessions(Duration::from_secs(5)).await, 2);
        assert!(registry.get_session(idle.id()).is_none());
        assert!(registry.get_session(dead.id()).is_none());
        assert!(registry.get_session(fresh.id()).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_touch_keeps_session_alive() {
        let registry = registry();
        let session = registry.create_session(RecordingConnection::new()).await;
        tokio::time::advance(Duration::from_secs(10)).await;
        registry.touch(&session).await;
        assert_eq!(registry.remove_inactive_sessions(Duration::from_secs(5)).await, 0);
    }

    #[tokio::test]
    async fn test_evict_all_notifies_everyone() {
        let registry = registry();
        let conns: Vec<_> = (0..3).map(|_| RecordingConnection::new()).collect();
        for conn in &conns {
            registry.create_session(conn.clone()).await;
        }
        assert_eq!(registry.evict_all("server shutting down").await, 3);
        assert_eq!(registry.session_count(), 0);
        for conn in &conns {
            assert_eq!(conn.sent_ids(), vec![ids::KICK_NOTICE]);
            assert!(!conn.is_active());
        }
    }

    #[tokio::test]
    async fn test_attributes_persist_on_save() {
        let registry = registry();
        let session = registry.create_session(RecordingConnection::new()).await;
        session.set_attribute("zone", "forest");
        registry.save(&session).await;

        let stored = registry.store().get_session(session.id()).await.unwrap();
        assert_eq!(stored.attributes["zone"], "forest");
    }

    #[tokio::test]
    async fn test_sessions_visible_across_instances() {
        let backend = MemoryBackend::new();
        let make = || {
            let stats = Arc::new(ServerStats::new());
            let store =
                TieredSessionStore::new(&StoreConfig::default(), Some(Arc::new(backend.clone())), stats.clone());
            SessionRegistry::new(Arc::new(store), stats)
        };
        let node_a = make();
        let node_b = make();

        let session = node_a.create_session(RecordingConnection::new()).await;
        node_a.bind_user(session.id(), "alice").await;

        let seen = node_b.find_session_by_user("alice").await.unwrap();
        assert_eq!(seen.session_id, session.id());
        assert_eq!(seen.node_id, node_a.node_id());
        assert!(node_b.get_session_by_user("alice").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_removal_during_bind_leaves_no_binding() {
        let backend = MemoryBackend::new();
        let stats = Arc::new(ServerStats::new());
        let store =
            TieredSessionStore::new(&StoreConfig::default(), Some(Arc::new(backend.clone())), stats.clone());
        let registry = Arc::new(SessionRegistry::new(Arc::new(store), stats));
        let session = registry.create_session(RecordingConnection::new()).await;
        let id = session.id();
        backend.set_delay(Duration::from_millis(100));

        let binding = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.bind_user(id, "alice").await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(registry.remove_session(id).await.is_some());

        assert!(!binding.await.unwrap());
        backend.set_delay(Duration::ZERO);
        assert!(registry.get_session(id).is_none());
        assert!(registry.get_session_by_user("alice").is_none());
        assert!(registry.store().get_session(id).await.is_none());
        assert!(registry.store().get_session_by_user_id("alice").await.is_none());
        assert!(backend.get(id).await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creation_yields_distinct_ids() {
        let registry = Arc::new(registry());
        let tasks: Vec<_> = (0..1000)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.create_session(RecordingConnection::new()).await.id() })
            })
            .collect();

        let mut ids = HashSet::new();
        for task in tasks {
            ids.insert(task.await.unwrap());
        }
        assert_eq!(ids.len(), 1000);
        assert_eq!(registry.session_count(), 1000);
        assert_eq!(registry.store().get_session_count().await, 1000);
    }
}

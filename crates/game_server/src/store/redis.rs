//! Redis session backend.
//!
//! Layout under the configured prefix:
//!
//! * `{prefix}:session:{id}` - hash with the JSON [`SessionData`] (`data`),
//!   the bound user (`user`) and the latest activity time (`active`)
//! * `{prefix}:user:{user_id}` - id of the user's current session
//! * `{prefix}:sessions` - set of every session id written by any node
//!
//! Set members whose record has expired are pruned lazily when ids are
//! listed. Activity refreshes only touch the `active` field of an existing
//! hash, so they can never undo a concurrent write or removal.

use super::SessionBackend;
use crate::error::{StoreError, StoreResult};
use crate::session::{SessionData, SessionId};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tokio::sync::OnceCell;

/// KEYS[1] session hash, ARGV[1] timestamp, ARGV[2] ttl secs, ARGV[3] user key prefix.
const TOUCH_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 0 then
    return 0
end
local current = tonumber(redis.call('HGET', KEYS[1], 'active') or '0')
if tonumber(ARGV[1]) > current then
    redis.call('HSET', KEYS[1], 'active', ARGV[1])
end
redis.call('EXPIRE', KEYS[1], ARGV[2])
local user = redis.call('HGET', KEYS[1], 'user')
if user and user ~= '' then
    redis.call('EXPIRE', ARGV[3] .. user, ARGV[2])
end
return 1
"#;

/// KEYS[1] session hash, KEYS[2] id set, ARGV[1] id, ARGV[2] user key prefix.
const REMOVE_SCRIPT: &str = r#"
local user = redis.call('HGET', KEYS[1], 'user')
redis.call('DEL', KEYS[1])
redis.call('SREM', KEYS[2], ARGV[1])
if user and user ~= '' and redis.call('GET', ARGV[2] .. user) == ARGV[1] then
    redis.call('DEL', ARGV[2] .. user)
end
return 1
"#;

/// Session backend backed by a Redis server.
///
/// The connection is opened on first use, so an unreachable Redis at
/// startup degrades the store like any later outage.
pub struct RedisBackend {
    client: redis::Client,
    connection: OnceCell<ConnectionManager>,
    prefix: String,
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

fn ttl_secs(ttl: Duration) -> u64 {
    ttl.as_secs().max(1)
}

impl RedisBackend {
    /// Creates a backend for `endpoint` (e.g. `redis://127.0.0.1:6379`).
    /// Only the URL is checked here.
    pub fn new(endpoint: &str, prefix: &str) -> StoreResult<Self> {
        Ok(Self {
            client: redis::Client::open(endpoint)?,
            connection: OnceCell::new(),
            prefix: prefix.to_string(),
        })
    }

    /// Shared connection, opened on first use. The manager reconnects on
    /// its own after transient failures.
    async fn con(&self) -> StoreResult<ConnectionManager> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                let manager = ConnectionManager::new(self.client.clone()).await?;
                tracing::info!("🔌 Connected to Redis session store (prefix '{}')", self.prefix);
                Ok::<_, StoreError>(manager)
            })
            .await?;
        Ok(manager.clone())
    }

    fn session_key(&self, id: SessionId) -> String {
        format!("{}:session:{}", self.prefix, id)
    }

    fn user_key_prefix(&self) -> String {
        format!("{}:user:", self.prefix)
    }

    fn user_key(&self, user_id: &str) -> String {
        format!("{}{}", self.user_key_prefix(), user_id)
    }

    fn index_key(&self) -> String {
        format!("{}:sessions", self.prefix)
    }

    async fn load(&self, id: SessionId) -> StoreResult<Option<SessionData>> {
        let mut con = self.con().await?;
        let (json, active): (Option<String>, Option<u64>) = redis::cmd("HMGET")
            .arg(self.session_key(id))
            .arg("data")
            .arg("active")
            .query_async(&mut con)
            .await?;
        let Some(json) = json else {
            return Ok(None);
        };
        let mut data: SessionData = serde_json::from_str(&json)?;
        if let Some(active) = active {
            data.last_active_ms = data.last_active_ms.max(active);
        }
        Ok(Some(data))
    }
}

#[async_trait]
impl SessionBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn put(&self, data: &SessionData, ttl: Duration) -> StoreResult<()> {
        let json = serde_json::to_string(data)?;
        let secs = ttl_secs(ttl);
        let key = self.session_key(data.session_id);
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HSET")
            .arg(&key)
            .arg("data")
            .arg(json)
            .arg("user")
            .arg(data.user_id.as_deref().unwrap_or(""))
            .arg("active")
            .arg(data.last_active_ms)
            .ignore()
            .expire(&key, secs as i64)
            .ignore()
            .sadd(self.index_key(), data.session_id.0)
            .ignore();
        if let Some(user) = &data.user_id {
            pipe.set_ex(self.user_key(user), data.session_id.0, secs).ignore();
        }
        let mut con = self.con().await?;
        let _: () = pipe.query_async(&mut con).await?;
        Ok(())
    }

    async fn get(&self, id: SessionId) -> StoreResult<Option<SessionData>> {
        self.load(id).await
    }

    async fn get_by_user(&self, user_id: &str) -> StoreResult<Option<SessionData>> {
        let mut con = self.con().await?;
        let raw: Option<String> = con.get(self.user_key(user_id)).await?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let id = raw.parse::<SessionId>().map_err(|_| StoreError::corrupt(&raw))?;
        Ok(self
            .load(id)
            .await?
            .filter(|data| data.user_id.as_deref() == Some(user_id)))
    }

    async fn remove(&self, id: SessionId) -> StoreResult<()> {
        let mut con = self.con().await?;
        let _: i64 = redis::Script::new(REMOVE_SCRIPT)
            .key(self.session_key(id))
            .key(self.index_key())
            .arg(id.0)
            .arg(self.user_key_prefix())
            .invoke_async(&mut con)
            .await?;
        Ok(())
    }

    async fn touch(&self, id: SessionId, last_active_ms: u64, ttl: Duration) -> StoreResult<()> {
        let mut con = self.con().await?;
        let _: i64 = redis::Script::new(TOUCH_SCRIPT)
            .key(self.session_key(id))
            .arg(last_active_ms)
            .arg(ttl_secs(ttl))
            .arg(self.user_key_prefix())
            .invoke_async(&mut con)
            .await?;
        Ok(())
    }

    async fn session_ids(&self) -> StoreResult<Vec<SessionId>> {
        let mut con = self.con().await?;
        let members: Vec<String> = con.smembers(self.index_key()).await?;
        let ids = members
            .iter()
            .map(|m| m.parse::<SessionId>().map_err(|_| StoreError::corrupt(m)))
            .collect::<StoreResult<Vec<_>>>()?;
        if ids.is_empty() {
            return Ok(ids);
        }

        let mut pipe = redis::pipe();
        for id in &ids {
            pipe.exists(self.session_key(*id));
        }
        let present: Vec<bool> = pipe.query_async(&mut con).await?;

        let (live, stale): (Vec<_>, Vec<_>) = ids
            .into_iter()
            .zip(present)
            .partition(|(_, present)| *present);
        if !stale.is_empty() {
            let stale: Vec<u64> = stale.into_iter().map(|(id, _)| id.0).collect();
            let _: () = con.srem(self.index_key(), stale).await?;
        }
        Ok(live.into_iter().map(|(id, _)| id).collect())
    }

    async fn count(&self) -> StoreResult<usize> {
        Ok(self.session_ids().await?.len())
    }

    async fn exists(&self, id: SessionId) -> StoreResult<bool> {
        let mut con = self.con().await?;
        Ok(con.exists(self.session_key(id)).await?)
    }

    async fn set_expire(&self, id: SessionId, ttl: Duration) -> StoreResult<bool> {
        let mut con = self.con().await?;
        Ok(con
            .expire(self.session_key(id), ttl_secs(ttl) as i64)
            .await?)
    }

    async fn ttl(&self, id: SessionId) -> StoreResult<i64> {
        let mut con = self.con().await?;
        Ok(con.ttl(self.session_key(id)).await?)
    }

    async fn clear(&self) -> StoreResult<()> {
        let mut con = self.con().await?;
        let pattern = format!("{}:*", self.prefix);
        let mut keys: Vec<String> = Vec::new();
        {
            let mut iter = con.scan_match::<_, String>(&pattern).await?;
            while let Some(key) = iter.next_item().await {
                keys.push(key);
            }
        }
        for chunk in keys.chunks(500) {
            let _: () = con.del(chunk).await?;
        }
        tracing::debug!("Cleared {} Redis keys under '{}'", keys.len(), self.prefix);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ttl_rounds_up_to_one_second() {
        assert_eq!(ttl_secs(Duration::from_millis(10)), 1);
        assert_eq!(ttl_secs(Duration::from_secs(90)), 90);
    }

    #[test]
    fn test_new_checks_url_without_connecting() {
        assert!(RedisBackend::new("redis://127.0.0.1:1", "game").is_ok());
        assert!(RedisBackend::new("not a url", "game").is_err());
    }

    #[test]
    fn test_key_layout() {
        let backend = RedisBackend::new("redis://127.0.0.1:6379", "eu1").unwrap();
        assert_eq!(backend.session_key(SessionId(42)), "eu1:session:42");
        assert_eq!(backend.user_key("alice"), "eu1:user:alice");
        assert_eq!(backend.index_key(), "eu1:sessions");
    }

    #[test]
    fn test_touch_never_rewrites_session_data() {
        assert!(!TOUCH_SCRIPT.contains("'data'"));
        assert!(TOUCH_SCRIPT.contains("EXISTS"));
    }

    fn data(id: u64, user: Option<&str>, last_active_ms: u64) -> SessionData {
        SessionData {
            session_id: SessionId(id),
            node_id: uuid::Uuid::nil(),
            user_id: user.map(str::to_string),
            authenticated: user.is_some(),
            remote_addr: "127.0.0.1:9000".parse().unwrap(),
            created_at_ms: 10,
            last_active_ms,
            attributes: Default::default(),
        }
    }

    fn local_redis() -> RedisBackend {
        let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        RedisBackend::new(&url, &format!("test-{}", uuid::Uuid::new_v4())).unwrap()
    }

    #[tokio::test]
    #[ignore = "needs a running Redis server"]
    async fn test_touch_keeps_latest_binding_and_respects_removal() {
        let backend = local_redis();
        let ttl = Duration::from_secs(30);
        backend.put(&data(1, None, 10), ttl).await.unwrap();
        backend.put(&data(1, Some("alice"), 20), ttl).await.unwrap();
        backend.touch(SessionId(1), 15, ttl).await.unwrap();
        backend.touch(SessionId(1), 500, ttl).await.unwrap();

        let stored = backend.get_by_user("alice").await.unwrap().unwrap();
        assert!(stored.authenticated);
        assert_eq!(stored.last_active_ms, 500);

        backend.remove(SessionId(1)).await.unwrap();
        backend.touch(SessionId(1), 900, ttl).await.unwrap();
        assert!(!backend.exists(SessionId(1)).await.unwrap());
        assert!(backend.get_by_user("alice").await.unwrap().is_none());
        backend.clear().await.unwrap();
    }
}

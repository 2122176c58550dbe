//! Redis-backed channel, session and challenge stores.
//!
//! Used when several node instances share handshake state. Every key carries a
//! native TTL; reads still re-check expiry and evict what they find stale.
//!
//! Key layout (prefix `irn`):
//!
//! | Key | Value |
//! |---|---|
//! | `irn:channel:{id}:meta` | `ChannelMetadata` JSON |
//! | `irn:channel:{id}:key` | raw 32-byte channel key |
//! | `irn:session:{token}` | `SessionData` JSON (window held separately) |
//! | `irn:session:{token}:requests` | sorted set of request times (ms) |
//! | `irn:session:{token}:count` | lifetime admitted-request counter |
//! | `irn:node-sessions:{node}` | set of session tokens |
//! | `irn:challenge:{channel}:{node}` | `StoredChallenge` JSON |

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use uuid::Uuid;

use irn_core::{
    ChannelContext, ChannelId, ChannelKey, ChannelMetadata, NodeId, RateLimitDecision, RateLimitPolicy, SessionData,
    SessionToken, SlidingWindow,
};

use crate::error::{Result, StoreError};
use crate::traits::{ChallengeStore, ChannelStore, SessionStore, StoredChallenge};

const PREFIX: &str = "irn";

/// Open a managed connection that reconnects on failure.
pub async fn connect(url: &str) -> Result<ConnectionManager> {
    let client = redis::Client::open(url)?;
    Ok(ConnectionManager::new(client).await?)
}

/// Milliseconds until `expires_at`, at least 1 so the key is never persistent.
fn ttl_millis(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    (expires_at - now).num_milliseconds().max(1) as u64
}

// ─────────────────────────────────────────────────────────────────────────────
// Channels
// ─────────────────────────────────────────────────────────────────────────────

/// Channel store over Redis.
///
/// Metadata and key live under separate keys written in one MULTI/EXEC.
#[derive(Clone)]
pub struct RedisChannelStore {
    conn: ConnectionManager,
}

impl RedisChannelStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn meta_key(id: &ChannelId) -> String {
        format!("{PREFIX}:channel:{id}:meta")
    }

    fn key_key(id: &ChannelId) -> String {
        format!("{PREFIX}:channel:{id}:key")
    }

    async fn evict(&self, id: &ChannelId) -> Result<u64> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(vec![Self::meta_key(id), Self::key_key(id)]).await?;
        Ok(removed)
    }
}

#[async_trait]
impl ChannelStore for RedisChannelStore {
    async fn put(&self, ctx: &ChannelContext) -> Result<()> {
        let ttl = ttl_millis(ctx.expires_at(), Utc::now());
        let meta = serde_json::to_string(&ctx.meta)?;
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .pset_ex(Self::meta_key(ctx.id()), meta, ttl)
            .ignore()
            .pset_ex(Self::key_key(ctx.id()), &ctx.key.as_bytes()[..], ttl)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, id: &ChannelId) -> Result<Option<ChannelContext>> {
        let mut conn = self.conn.clone();
        let (meta, key): (Option<String>, Option<Vec<u8>>) = redis::pipe()
            .get(Self::meta_key(id))
            .get(Self::key_key(id))
            .query_async(&mut conn)
            .await?;

        let (meta, key) = match (meta, key) {
            (None, None) => return Ok(None),
            (Some(meta), Some(key)) => (meta, key),
            _ => {
                tracing::warn!(channel = %id, "evicting half-written channel");
                self.evict(id).await?;
                return Ok(None);
            }
        };

        let key = match ChannelKey::from_slice(&key) {
            Ok(key) if !key.is_blank() => key,
            _ => {
                tracing::warn!(channel = %id, "evicting channel with unusable key");
                self.evict(id).await?;
                return Ok(None);
            }
        };

        let meta: ChannelMetadata = serde_json::from_str(&meta)?;
        let ctx = ChannelContext::from_parts(meta, key);
        if ctx.is_expired() {
            tracing::debug!(channel = %id, "evicting expired channel");
            self.evict(id).await?;
            return Ok(None);
        }
        Ok(Some(ctx))
    }

    async fn remove(&self, id: &ChannelId) -> Result<bool> {
        Ok(self.evict(id).await? > 0)
    }

    async fn count(&self) -> Result<usize> {
        let mut conn = self.conn.clone();
        let pattern = format!("{PREFIX}:channel:*:meta");
        let mut cursor: u64 = 0;
        let mut total = 0;
        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut conn)
                .await?;
            total += keys.len();
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(total)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sessions
// ─────────────────────────────────────────────────────────────────────────────

/// KEYS: window zset, counter. ARGV: now ms, window ms, max, member, counter ttl ms.
///
/// Returns `{1, remaining}` when admitted or `{0, retry_after_ms}` when limited.
const RATE_LIMIT_LUA: &str = r#"
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local max = tonumber(ARGV[3])
redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', now - window)
local count = redis.call('ZCARD', KEYS[1])
if count >= max then
  local retry = window
  local oldest = redis.call('ZRANGE', KEYS[1], 0, 0, 'WITHSCORES')
  if oldest[2] then
    retry = tonumber(oldest[2]) + window - now
  end
  return {0, retry}
end
redis.call('ZADD', KEYS[1], ARGV[1], ARGV[4])
redis.call('PEXPIRE', KEYS[1], ARGV[2])
redis.call('INCR', KEYS[2])
redis.call('PEXPIRE', KEYS[2], ARGV[5])
return {1, max - count - 1}
"#;

/// Session store over Redis.
///
/// The sliding window is a sorted set updated by a Lua script, so concurrent
/// requests on one session from different instances are counted exactly.
#[derive(Clone)]
pub struct RedisSessionStore {
    conn: ConnectionManager,
    rate_limit: Script,
}

impl RedisSessionStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self {
            conn,
            rate_limit: Script::new(RATE_LIMIT_LUA),
        }
    }

    fn session_key(token: &SessionToken) -> String {
        format!("{PREFIX}:session:{}", token.as_str())
    }

    fn requests_key(token: &SessionToken) -> String {
        format!("{PREFIX}:session:{}:requests", token.as_str())
    }

    fn count_key(token: &SessionToken) -> String {
        format!("{PREFIX}:session:{}:count", token.as_str())
    }

    fn node_key(node_id: &NodeId) -> String {
        format!("{PREFIX}:node-sessions:{node_id}")
    }

    /// Load a live session, evicting it if expired.
    async fn load(&self, token: &SessionToken, now: DateTime<Utc>) -> Result<Option<SessionData>> {
        let mut conn = self.conn.clone();
        let (json, count): (Option<String>, Option<u64>) = redis::pipe()
            .get(Self::session_key(token))
            .get(Self::count_key(token))
            .query_async(&mut conn)
            .await?;

        let Some(json) = json else {
            return Ok(None);
        };
        let mut session: SessionData = serde_json::from_str(&json)?;
        if session.is_expired_at(now) {
            tracing::debug!(token = %token, "evicting expired session");
            self.delete(&session).await?;
            return Ok(None);
        }
        session.request_count = count.unwrap_or(0);
        Ok(Some(session))
    }

    async fn delete(&self, session: &SessionData) -> Result<u64> {
        let mut conn = self.conn.clone();
        let (removed,): (u64,) = redis::pipe()
            .atomic()
            .del(Self::session_key(&session.token))
            .del(vec![Self::requests_key(&session.token), Self::count_key(&session.token)])
            .ignore()
            .srem(Self::node_key(&session.node_id), session.token.as_str())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    /// Rewrite the session body, keeping the key's TTL.
    ///
    /// Only an existing key is overwritten; returns `false` if the session
    /// was deleted since it was loaded.
    async fn store_keep_ttl(&self, session: &SessionData) -> Result<bool> {
        let mut conn = self.conn.clone();
        let written: Option<String> = redis::cmd("SET")
            .arg(Self::session_key(&session.token))
            .arg(serde_json::to_string(&body(session))?)
            .arg("XX")
            .arg("KEEPTTL")
            .query_async(&mut conn)
            .await?;
        Ok(written.is_some())
    }
}

/// The stored form: counters and window live under their own keys.
fn body(session: &SessionData) -> SessionData {
    SessionData {
        request_count: 0,
        window: SlidingWindow::new(),
        ..session.clone()
    }
}

#[async_trait]
impl SessionStore for RedisSessionStore {
    async fn create(&self, session: &SessionData) -> Result<()> {
        let ttl = ttl_millis(session.expires_at, Utc::now());
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .pset_ex(Self::session_key(&session.token), serde_json::to_string(&body(session))?, ttl)
            .ignore()
            .sadd(Self::node_key(&session.node_id), session.token.as_str())
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn get(&self, token: &SessionToken) -> Result<Option<SessionData>> {
        self.load(token, Utc::now()).await
    }

    async fn touch(&self, token: &SessionToken, now: DateTime<Utc>) -> Result<Option<SessionData>> {
        let Some(mut session) = self.load(token, now).await? else {
            return Ok(None);
        };
        session.last_accessed_at = now;
        if !self.store_keep_ttl(&session).await? {
            return Ok(None);
        }
        Ok(Some(session))
    }

    async fn record_request(
        &self,
        token: &SessionToken,
        policy: RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<RateLimitDecision>> {
        let Some(session) = self.load(token, now).await? else {
            return Ok(None);
        };

        let now_ms = now.timestamp_millis();
        let window_ms = policy.window.as_millis() as i64;
        let member = format!("{now_ms}-{}", Uuid::new_v4());
        let mut conn = self.conn.clone();
        let (admitted, value): (i64, i64) = self
            .rate_limit
            .key(Self::requests_key(token))
            .key(Self::count_key(token))
            .arg(now_ms)
            .arg(window_ms)
            .arg(policy.max_requests)
            .arg(member)
            .arg(ttl_millis(session.expires_at, now))
            .invoke_async(&mut conn)
            .await?;

        let decision = if admitted == 1 {
            RateLimitDecision::Allowed {
                remaining: value.max(0) as u32,
            }
        } else {
            RateLimitDecision::Limited {
                retry_after: Duration::from_millis(value.max(0) as u64),
            }
        };
        Ok(Some(decision))
    }

    async fn revoke(&self, token: &SessionToken) -> Result<bool> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(Self::session_key(token)).await?;
        let Some(json) = json else {
            return Ok(false);
        };
        let session: SessionData = serde_json::from_str(&json)?;
        Ok(self.delete(&session).await? > 0)
    }

    async fn renew(&self, token: &SessionToken, extra: Duration) -> Result<Option<DateTime<Utc>>> {
        let now = Utc::now();
        let Some(mut session) = self.load(token, now).await? else {
            return Ok(None);
        };
        let extra = chrono::Duration::from_std(extra).map_err(|e| StoreError::InvalidData(e.to_string()))?;
        session.expires_at += extra;

        let ttl = ttl_millis(session.expires_at, now);
        let mut conn = self.conn.clone();
        let (written,): (Option<String>,) = redis::pipe()
            .atomic()
            .cmd("SET")
            .arg(Self::session_key(token))
            .arg(serde_json::to_string(&body(&session))?)
            .arg("XX")
            .arg("PX")
            .arg(ttl)
            .pexpire(Self::count_key(token), ttl as i64)
            .ignore()
            .query_async(&mut conn)
            .await?;
        if written.is_none() {
            return Ok(None);
        }
        Ok(Some(session.expires_at))
    }

    async fn list_by_node(&self, node_id: &NodeId) -> Result<Vec<SessionData>> {
        let now = Utc::now();
        let mut conn = self.conn.clone();
        let tokens: Vec<String> = conn.smembers(Self::node_key(node_id)).await?;

        let mut found = Vec::with_capacity(tokens.len());
        let mut stale = Vec::new();
        for token in tokens {
            let token = SessionToken::from(token.as_str());
            match self.load(&token, now).await? {
                Some(session) => found.push(session),
                None => stale.push(token.as_str().to_string()),
            }
        }
        if !stale.is_empty() {
            let _: u64 = conn.srem(Self::node_key(node_id), stale).await?;
        }
        found.sort_by_key(|s| s.created_at);
        Ok(found)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Challenges
// ─────────────────────────────────────────────────────────────────────────────

/// Challenge store over Redis.
#[derive(Clone)]
pub struct RedisChallengeStore {
    conn: ConnectionManager,
}

impl RedisChallengeStore {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    fn key(channel_id: &ChannelId, node_id: &NodeId) -> String {
        format!("{PREFIX}:challenge:{channel_id}:{node_id}")
    }
}

#[async_trait]
impl ChallengeStore for RedisChallengeStore {
    async fn put(&self, channel_id: &ChannelId, node_id: &NodeId, challenge: &StoredChallenge) -> Result<()> {
        let ttl = ttl_millis(challenge.expires_at, Utc::now());
        let mut conn = self.conn.clone();
        let _: () = conn
            .pset_ex(Self::key(channel_id, node_id), serde_json::to_string(challenge)?, ttl)
            .await?;
        Ok(())
    }

    async fn take(&self, channel_id: &ChannelId, node_id: &NodeId) -> Result<Option<StoredChallenge>> {
        let mut conn = self.conn.clone();
        let json: Option<String> = redis::cmd("GETDEL")
            .arg(Self::key(channel_id, node_id))
            .query_async(&mut conn)
            .await?;
        json.map(|j| serde_json::from_str(&j).map_err(StoreError::from))
            .transpose()
    }

    async fn remove(&self, channel_id: &ChannelId, node_id: &NodeId) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: u64 = conn.del(Self::key(channel_id, node_id)).await?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use irn_core::aead::random_bytes;
    use irn_core::{AccessLevel, ChannelRole, Cipher};

    async fn manager() -> ConnectionManager {
        let url = std::env::var("IRN_TEST_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into());
        connect(&url).await.expect("redis reachable")
    }

    fn channel(ttl: chrono::Duration) -> ChannelContext {
        ChannelContext::new(
            ChannelId::generate(),
            ChannelKey::from_bytes(random_bytes::<32>()),
            Cipher::Aes256Gcm,
            random_bytes::<32>().to_vec(),
            random_bytes::<32>().to_vec(),
            ChannelRole::Responder,
            ttl,
        )
    }

    #[tokio::test]
    #[ignore = "requires a Redis server (IRN_TEST_REDIS_URL)"]
    async fn test_channel_round_trip() {
        let store = RedisChannelStore::new(manager().await);
        let ctx = channel(chrono::Duration::minutes(5));
        store.put(&ctx).await.unwrap();

        let got = store.get(ctx.id()).await.unwrap().unwrap();
        assert_eq!(got.meta, ctx.meta);
        assert_eq!(got.key, ctx.key);
        assert!(store.remove(ctx.id()).await.unwrap());
        assert!(store.get(ctx.id()).await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore = "requires a Redis server (IRN_TEST_REDIS_URL)"]
    async fn test_channel_missing_key_is_evicted() {
        let conn = manager().await;
        let store = RedisChannelStore::new(conn.clone());
        let ctx = channel(chrono::Duration::minutes(5));
        store.put(&ctx).await.unwrap();

        let mut raw = conn.clone();
        let _: u64 = raw.del(RedisChannelStore::key_key(ctx.id())).await.unwrap();

        assert!(store.get(ctx.id()).await.unwrap().is_none());
        let exists: bool = raw.exists(RedisChannelStore::meta_key(ctx.id())).await.unwrap();
        assert!(!exists);
    }

    #[tokio::test]
    #[ignore = "requires a Redis server (IRN_TEST_REDIS_URL)"]
    async fn test_session_rate_limit() {
        let store = RedisSessionStore::new(manager().await);
        let session = SessionData::new(
            NodeId::new(),
            ChannelId::generate(),
            AccessLevel::ReadOnly,
            chrono::Duration::minutes(5),
        );
        store.create(&session).await.unwrap();

        let policy = RateLimitPolicy::per_minute(3);
        let now = Utc::now();
        for i in 0..3 {
            let at = now + chrono::Duration::milliseconds(i);
            assert!(store.record_request(&session.token, policy, at).await.unwrap().unwrap().is_allowed());
        }
        let limited = store
            .record_request(&session.token, policy, now + chrono::Duration::milliseconds(10))
            .await
            .unwrap()
            .unwrap();
        assert!(!limited.is_allowed());

        let later = now + chrono::Duration::seconds(61);
        assert!(store.record_request(&session.token, policy, later).await.unwrap().unwrap().is_allowed());
        assert_eq!(store.get(&session.token).await.unwrap().unwrap().request_count, 4);

        assert_eq!(store.list_by_node(&session.node_id).await.unwrap().len(), 1);
        assert!(store.revoke(&session.token).await.unwrap());
        assert!(store.list_by_node(&session.node_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore = "requires a Redis server (IRN_TEST_REDIS_URL)"]
    async fn test_touch_after_revoke_does_not_restore_session() {
        let conn = manager().await;
        let store = RedisSessionStore::new(conn.clone());
        let session = SessionData::new(
            NodeId::new(),
            ChannelId::generate(),
            AccessLevel::ReadOnly,
            chrono::Duration::minutes(5),
        );
        store.create(&session).await.unwrap();

        // Revoked between the read and the write-back of a touch.
        let mut loaded = store.load(&session.token, Utc::now()).await.unwrap().unwrap();
        assert!(store.revoke(&session.token).await.unwrap());
        loaded.last_accessed_at = Utc::now();
        assert!(!store.store_keep_ttl(&loaded).await.unwrap());

        let mut raw = conn.clone();
        let exists: bool = raw.exists(RedisSessionStore::session_key(&session.token)).await.unwrap();
        assert!(!exists);
        assert!(store.touch(&session.token, Utc::now()).await.unwrap().is_none());
        assert!(store.renew(&session.token, Duration::from_secs(60)).await.unwrap().is_none());
        assert!(store.list_by_node(&session.node_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore = "requires a Redis server (IRN_TEST_REDIS_URL)"]
    async fn test_challenge_take_is_one_shot() {
        let store = RedisChallengeStore::new(manager().await);
        let (channel_id, node_id) = (ChannelId::generate(), NodeId::new());
        let now = Utc::now();
        let challenge = StoredChallenge {
            value: "abc".into(),
            created_at: now,
            expires_at: now + chrono::Duration::minutes(5),
        };
        store.put(&channel_id, &node_id, &challenge).await.unwrap();

        assert_eq!(store.take(&channel_id, &node_id).await.unwrap(), Some(challenge));
        assert!(store.take(&channel_id, &node_id).await.unwrap().is_none());
    }
}

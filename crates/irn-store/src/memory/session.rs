use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use irn_core::{NodeId, RateLimitDecision, RateLimitPolicy, SessionData, SessionToken};

use super::{read, write};
use crate::error::{Result, StoreError};
use crate::traits::SessionStore;

/// In-memory session store.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: RwLock<HashMap<SessionToken, SessionData>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` on a live session, evicting it first if expired.
    fn with_live<T>(
        &self,
        token: &SessionToken,
        now: DateTime<Utc>,
        f: impl FnOnce(&mut SessionData) -> T,
    ) -> Result<Option<T>> {
        let mut sessions = write(&self.sessions)?;
        match sessions.get_mut(token) {
            Some(session) if !session.is_expired_at(now) => Ok(Some(f(session))),
            Some(_) => {
                sessions.remove(token);
                tracing::debug!(token = %token, "evicted expired session");
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn create(&self, session: &SessionData) -> Result<()> {
        write(&self.sessions)?.insert(session.token.clone(), session.clone());
        Ok(())
    }

    async fn get(&self, token: &SessionToken) -> Result<Option<SessionData>> {
        self.with_live(token, Utc::now(), |s| s.clone())
    }

    async fn touch(&self, token: &SessionToken, now: DateTime<Utc>) -> Result<Option<SessionData>> {
        self.with_live(token, now, |s| {
            s.last_accessed_at = now;
            s.clone()
        })
    }

    async fn record_request(
        &self,
        token: &SessionToken,
        policy: RateLimitPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<RateLimitDecision>> {
        self.with_live(token, now, |s| {
            let decision = s.window.check_and_record(now, policy);
            if decision.is_allowed() {
                s.request_count += 1;
            }
            decision
        })
    }

    async fn revoke(&self, token: &SessionToken) -> Result<bool> {
        Ok(write(&self.sessions)?.remove(token).is_some())
    }

    async fn renew(&self, token: &SessionToken, extra: Duration) -> Result<Option<DateTime<Utc>>> {
        let extra = chrono::Duration::from_std(extra).map_err(|e| StoreError::InvalidData(e.to_string()))?;
        self.with_live(token, Utc::now(), |s| {
            s.expires_at += extra;
            s.expires_at
        })
    }

    async fn list_by_node(&self, node_id: &NodeId) -> Result<Vec<SessionData>> {
        let now = Utc::now();
        let sessions = read(&self.sessions)?;
        let mut found: Vec<SessionData> = sessions
            .values()
            .filter(|s| s.node_id == *node_id && !s.is_expired_at(now))
            .cloned()
            .collect();
        found.sort_by_key(|s| s.created_at);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use irn_core::{AccessLevel, ChannelId};

    fn session(ttl: chrono::Duration) -> SessionData {
        SessionData::new(NodeId::new(), ChannelId::generate(), AccessLevel::ReadOnly, ttl)
    }

    #[tokio::test]
    async fn test_touch_refreshes_last_access() {
        let store = MemorySessionStore::new();
        let s = session(chrono::Duration::hours(1));
        store.create(&s).await.unwrap();

        let later = s.created_at + chrono::Duration::seconds(5);
        let touched = store.touch(&s.token, later).await.unwrap().unwrap();
        assert_eq!(touched.last_accessed_at, later);
    }

    #[tokio::test]
    async fn test_expired_session_is_evicted() {
        let store = MemorySessionStore::new();
        let s = session(chrono::Duration::seconds(-1));
        store.create(&s).await.unwrap();
        assert!(store.get(&s.token).await.unwrap().is_none());
        assert!(!store.revoke(&s.token).await.unwrap());
    }

    #[tokio::test]
    async fn test_rate_limit_per_session() {
        let store = MemorySessionStore::new();
        let a = session(chrono::Duration::hours(1));
        let b = session(chrono::Duration::hours(1));
        store.create(&a).await.unwrap();
        store.create(&b).await.unwrap();

        let policy = RateLimitPolicy::per_minute(2);
        let now = Utc::now();
        for _ in 0..2 {
            assert!(store.record_request(&a.token, policy, now).await.unwrap().unwrap().is_allowed());
        }
        assert!(!store.record_request(&a.token, policy, now).await.unwrap().unwrap().is_allowed());
        assert!(store.record_request(&b.token, policy, now).await.unwrap().unwrap().is_allowed());

        assert_eq!(store.get(&a.token).await.unwrap().unwrap().request_count, 2);
        assert!(store
            .record_request(&SessionToken::generate(), policy, now)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_renew_and_list_by_node() {
        let store = MemorySessionStore::new();
        let s = session(chrono::Duration::minutes(10));
        store.create(&s).await.unwrap();

        let new_expiry = store.renew(&s.token, Duration::from_secs(600)).await.unwrap().unwrap();
        assert_eq!(new_expiry, s.expires_at + chrono::Duration::seconds(600));

        let listed = store.list_by_node(&s.node_id).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert!(store.list_by_node(&NodeId::new()).await.unwrap().is_empty());
    }
}

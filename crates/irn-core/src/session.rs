//! Session records issued after a successful challenge.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::rate_limit::SlidingWindow;
use crate::types::{AccessLevel, ChannelId, NodeId, SessionToken};

/// Default session lifetime.
pub const DEFAULT_SESSION_TTL_SECS: i64 = 60 * 60;

/// A stored session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionData {
    pub token: SessionToken,
    pub node_id: NodeId,
    pub channel_id: ChannelId,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub last_accessed_at: DateTime<Utc>,
    pub access_level: AccessLevel,
    /// Total admitted requests over the session's lifetime.
    pub request_count: u64,
    /// Recent request timestamps for rate limiting.
    #[serde(default)]
    pub window: SlidingWindow,
}

impl SessionData {
    /// A fresh session starting now.
    pub fn new(node_id: NodeId, channel_id: ChannelId, access_level: AccessLevel, ttl: Duration) -> Self {
        let now = Utc::now();
        Self {
            token: SessionToken::generate(),
            node_id,
            channel_id,
            created_at: now,
            expires_at: now + ttl,
            last_accessed_at: now,
            access_level,
            request_count: 0,
            window: SlidingWindow::new(),
        }
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Time left before expiry, clamped at zero.
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).max(Duration::zero())
    }

    /// The view handed to request handlers.
    pub fn context_at(&self, now: DateTime<Utc>) -> SessionContext {
        SessionContext {
            token: self.token.clone(),
            node_id: self.node_id,
            channel_id: self.channel_id.clone(),
            access_level: self.access_level,
            remaining: self.remaining_at(now),
        }
    }
}

/// A validated session as seen by a request handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub token: SessionToken,
    pub node_id: NodeId,
    pub channel_id: ChannelId,
    pub access_level: AccessLevel,
    pub remaining: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remaining_is_clamped() {
        let session = SessionData::new(NodeId::new(), ChannelId::generate(), AccessLevel::ReadOnly, Duration::seconds(10));
        let later = session.created_at + Duration::seconds(30);
        assert!(session.is_expired_at(later));
        assert_eq!(session.remaining_at(later), Duration::zero());
        assert_eq!(session.context_at(session.created_at).remaining, Duration::seconds(10));
    }

    #[test]
    fn test_serde_keeps_window() {
        let session = SessionData::new(NodeId::new(), ChannelId::generate(), AccessLevel::ReadWrite, Duration::hours(1));
        let json = serde_json::to_string(&session).unwrap();
        assert!(json.contains("\"accessLevel\":\"ReadWrite\""));
        let back: SessionData = serde_json::from_str(&json).unwrap();
        assert_eq!(back, session);
    }
}

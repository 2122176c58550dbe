//! Session issuance, validation, capability checks and rate limiting.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};

use irn_core::{
    AccessLevel, ChannelId, NodeId, RateLimitDecision, RateLimitPolicy, SessionContext, SessionData, SessionToken,
    DEFAULT_SESSION_TTL_SECS,
};
use irn_store::SessionStore;

use crate::error::Result;

/// Default limit for ordinary endpoints.
pub const DEFAULT_RATE_LIMIT_PER_MINUTE: u32 = 60;

/// Default limit for high-volume sync endpoints.
pub const DEFAULT_SYNC_RATE_LIMIT_PER_MINUTE: u32 = 600;

/// Rate-limit class an endpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Standard,
    Sync,
}

/// Session configuration.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Lifetime of a newly issued session.
    pub ttl: Duration,
    /// Limit for [`EndpointClass::Standard`].
    pub standard: RateLimitPolicy,
    /// Limit for [`EndpointClass::Sync`].
    pub sync: RateLimitPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::seconds(DEFAULT_SESSION_TTL_SECS),
            standard: RateLimitPolicy::per_minute(DEFAULT_RATE_LIMIT_PER_MINUTE),
            sync: RateLimitPolicy::per_minute(DEFAULT_SYNC_RATE_LIMIT_PER_MINUTE),
        }
    }
}

impl SessionConfig {
    pub fn policy(&self, class: EndpointClass) -> RateLimitPolicy {
        match class {
            EndpointClass::Standard => self.standard,
            EndpointClass::Sync => self.sync,
        }
    }
}

/// Whether `granted` meets `required` under `ReadOnly < ReadWrite < Admin`.
pub fn has_capability(granted: AccessLevel, required: AccessLevel) -> bool {
    granted >= required
}

/// Why an authenticated request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    /// No live session for the token.
    InvalidSession,
    /// The session was issued on a different channel.
    ChannelMismatch,
    /// The session's access level is below what the endpoint requires.
    InsufficientPermissions { granted: AccessLevel, required: AccessLevel },
    /// The session's window is full.
    RateLimited { retry_after: StdDuration },
}

/// Result of authorizing one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authorization {
    Granted(SessionContext),
    Denied(Denial),
}

/// Session lifecycle over a [`SessionStore`].
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    config: SessionConfig,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, config: SessionConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Issue a session with the configured TTL.
    pub async fn create(&self, node_id: NodeId, channel_id: ChannelId, access_level: AccessLevel) -> Result<SessionData> {
        self.create_with_ttl(node_id, channel_id, access_level, self.config.ttl).await
    }

    pub async fn create_with_ttl(
        &self,
        node_id: NodeId,
        channel_id: ChannelId,
        access_level: AccessLevel,
        ttl: Duration,
    ) -> Result<SessionData> {
        let session = SessionData::new(node_id, channel_id, access_level, ttl);
        self.store.create(&session).await?;
        tracing::info!(
            node = %node_id,
            token = %session.token,
            access = access_level.as_str(),
            expires_at = %session.expires_at,
            "session issued"
        );
        Ok(session)
    }

    /// Look up a live session and refresh its last-access time.
    pub async fn validate(&self, token: &SessionToken) -> Result<Option<SessionContext>> {
        self.validate_at(token, Utc::now()).await
    }

    pub async fn validate_at(&self, token: &SessionToken, now: DateTime<Utc>) -> Result<Option<SessionContext>> {
        Ok(self.store.touch(token, now).await?.map(|s| s.context_at(now)))
    }

    /// Count one request against the session's window for `class`.
    ///
    /// Returns `None` if the session does not exist.
    pub async fn record_request(
        &self,
        token: &SessionToken,
        class: EndpointClass,
    ) -> Result<Option<RateLimitDecision>> {
        self.record_request_at(token, class, Utc::now()).await
    }

    pub async fn record_request_at(
        &self,
        token: &SessionToken,
        class: EndpointClass,
        now: DateTime<Utc>,
    ) -> Result<Option<RateLimitDecision>> {
        Ok(self.store.record_request(token, self.config.policy(class), now).await?)
    }

    /// Validate, bind to channel, check capability, then rate limit.
    ///
    /// A request refused before the rate-limit step is not counted.
    pub async fn authorize(
        &self,
        token: &SessionToken,
        channel_id: &ChannelId,
        required: AccessLevel,
        class: EndpointClass,
    ) -> Result<Authorization> {
        let now = Utc::now();
        let Some(ctx) = self.validate_at(token, now).await? else {
            return Ok(Authorization::Denied(Denial::InvalidSession));
        };
        if ctx.channel_id != *channel_id {
            tracing::warn!(node = %ctx.node_id, token = %token, "session presented on foreign channel");
            return Ok(Authorization::Denied(Denial::ChannelMismatch));
        }
        if !has_capability(ctx.access_level, required) {
            return Ok(Authorization::Denied(Denial::InsufficientPermissions {
                granted: ctx.access_level,
                required,
            }));
        }
        match self.record_request_at(token, class, now).await? {
            Some(RateLimitDecision::Allowed { .. }) => Ok(Authorization::Granted(ctx)),
            Some(RateLimitDecision::Limited { retry_after }) => {
                tracing::debug!(node = %ctx.node_id, token = %token, ?retry_after, "rate limited");
                Ok(Authorization::Denied(Denial::RateLimited { retry_after }))
            }
            None => Ok(Authorization::Denied(Denial::InvalidSession)),
        }
    }

    pub async fn revoke(&self, token: &SessionToken) -> Result<bool> {
        let revoked = self.store.revoke(token).await?;
        if revoked {
            tracing::info!(token = %token, "session revoked");
        }
        Ok(revoked)
    }

    /// Extend a live session by `extra_secs`. Returns the new expiry.
    pub async fn renew(&self, token: &SessionToken, extra_secs: u64) -> Result<Option<DateTime<Utc>>> {
        Ok(self.store.renew(token, StdDuration::from_secs(extra_secs)).await?)
    }

    pub async fn list_by_node(&self, node_id: &NodeId) -> Result<Vec<SessionData>> {
        Ok(self.store.list_by_node(node_id).await?)
    }
}

//! Phase 3: one-time challenges and session issuance.
//!
//! Per (channel, node) the state machine is
//! `NoChallenge → Issued → Verified | Expired | Invalid`. Every verification
//! attempt consumes the stored challenge, so all three end states are terminal.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Duration, Utc};
use rand::RngCore;

use irn_core::messages::{AuthenticateRequest, AuthenticateResponse, ChallengeResponse, PHASE_SESSION};
use irn_core::{AccessLevel, ChannelId, NodeCertificate, NodeId};
use irn_store::{ChallengeStore, StoredChallenge};

use crate::error::{AuthError, Result};
use crate::identity::{within_skew, DEFAULT_MAX_CLOCK_SKEW_SECS};
use crate::session::SessionManager;

/// Default challenge lifetime.
pub const DEFAULT_CHALLENGE_TTL_SECS: i64 = 300;

/// Challenge length in bytes.
pub const CHALLENGE_LEN: usize = 32;

/// Challenge configuration.
#[derive(Debug, Clone)]
pub struct ChallengeConfig {
    pub ttl: Duration,
    /// Signed timestamps further than this from local time are rejected.
    pub max_clock_skew: Duration,
}

impl Default for ChallengeConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::seconds(DEFAULT_CHALLENGE_TTL_SECS),
            max_clock_skew: Duration::seconds(DEFAULT_MAX_CLOCK_SKEW_SECS),
        }
    }
}

/// Result of verifying a challenge response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeOutcome {
    Verified,
    /// No challenge was issued for this pair, or it was already used.
    Missing,
    Expired,
    /// The returned value differs from the issued one.
    Mismatch,
    ClockSkew,
    BadSignature,
}

impl ChallengeOutcome {
    pub fn is_verified(self) -> bool {
        self == ChallengeOutcome::Verified
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChallengeOutcome::Verified => "verified",
            ChallengeOutcome::Missing => "no active challenge",
            ChallengeOutcome::Expired => "challenge expired",
            ChallengeOutcome::Mismatch => "challenge mismatch",
            ChallengeOutcome::ClockSkew => "timestamp outside allowed skew",
            ChallengeOutcome::BadSignature => "invalid signature",
        }
    }
}

/// Issues and verifies challenges, and issues sessions on success.
pub struct ChallengeAuth {
    store: Arc<dyn ChallengeStore>,
    sessions: Arc<SessionManager>,
    config: ChallengeConfig,
}

impl ChallengeAuth {
    pub fn new(store: Arc<dyn ChallengeStore>, sessions: Arc<SessionManager>, config: ChallengeConfig) -> Self {
        Self {
            store,
            sessions,
            config,
        }
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    /// Issue a fresh challenge, replacing any earlier one for the pair.
    pub async fn generate_challenge(&self, channel_id: &ChannelId, node_id: &NodeId) -> Result<ChallengeResponse> {
        let mut bytes = [0u8; CHALLENGE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut bytes);

        let issued_at = Utc::now();
        let challenge = StoredChallenge {
            value: STANDARD.encode(bytes),
            created_at: issued_at,
            expires_at: issued_at + self.config.ttl,
        };
        self.store.put(channel_id, node_id, &challenge).await?;
        tracing::debug!(channel = %channel_id, node = %node_id, "challenge issued");

        let ttl_seconds = u64::try_from(self.config.ttl.num_seconds())
            .map_err(|_| AuthError::InvalidConfig("challenge ttl must not be negative".into()))?;
        Ok(ChallengeResponse {
            challenge_data: challenge.value,
            issued_at,
            ttl_seconds,
            expires_at: challenge.expires_at,
        })
    }

    /// Verify a signed response against the issued challenge, consuming it.
    pub async fn verify(
        &self,
        request: &AuthenticateRequest,
        certificate: &NodeCertificate,
        now: DateTime<Utc>,
    ) -> Result<ChallengeOutcome> {
        let Some(stored) = self.store.take(&request.channel_id, &request.node_id).await? else {
            return Ok(ChallengeOutcome::Missing);
        };

        let outcome = if stored.is_expired_at(now) {
            ChallengeOutcome::Expired
        } else if stored.value != request.challenge_data {
            ChallengeOutcome::Mismatch
        } else if !within_skew(request.timestamp, now, self.config.max_clock_skew) {
            ChallengeOutcome::ClockSkew
        } else if !certificate.verify_base64(request.signed_message().as_bytes(), &request.signature) {
            ChallengeOutcome::BadSignature
        } else {
            ChallengeOutcome::Verified
        };

        if !outcome.is_verified() {
            tracing::warn!(
                channel = %request.channel_id,
                node = %request.node_id,
                reason = outcome.as_str(),
                "challenge verification failed"
            );
        }
        Ok(outcome)
    }

    /// Whether a signed response verifies. The challenge is consumed either way.
    pub async fn verify_response(&self, request: &AuthenticateRequest, certificate: &NodeCertificate) -> Result<bool> {
        Ok(self.verify(request, certificate, Utc::now()).await?.is_verified())
    }

    /// Issue a session after a verified response.
    pub async fn issue_session(
        &self,
        node_id: NodeId,
        channel_id: ChannelId,
        access_level: AccessLevel,
    ) -> Result<AuthenticateResponse> {
        let session = self.sessions.create(node_id, channel_id, access_level).await?;
        Ok(AuthenticateResponse {
            authenticated: true,
            node_id: Some(node_id),
            session_token: Some(session.token),
            session_expires_at: Some(session.expires_at),
            granted_access_level: Some(access_level),
            next_phase: Some(PHASE_SESSION.to_string()),
            message: None,
        })
    }

    /// Verify a response and, on success, issue a session.
    pub async fn authenticate(
        &self,
        request: &AuthenticateRequest,
        certificate: &NodeCertificate,
        access_level: AccessLevel,
    ) -> Result<AuthenticateResponse> {
        let outcome = self.verify(request, certificate, Utc::now()).await?;
        if !outcome.is_verified() {
            return Ok(AuthenticateResponse::failed(outcome.as_str()));
        }
        self.issue_session(request.node_id, request.channel_id.clone(), access_level).await
    }

    /// Drop any outstanding challenge for the pair.
    pub async fn invalidate(&self, channel_id: &ChannelId, node_id: &NodeId) -> Result<bool> {
        Ok(self.store.remove(channel_id, node_id).await?)
    }
}

//! Handshake wire messages.
//!
//! All messages use camelCase JSON. Phase 1 travels in the clear; every later
//! message is the plaintext of an [`EncryptedEnvelope`](crate::EncryptedEnvelope).

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::node::NodeContact;
use crate::types::{signing_timestamp, AccessLevel, AuthorizationStatus, ChannelId, NodeId, SessionToken};

/// Protocol version spoken by this implementation.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Header carrying the channel id on every post-Phase-1 request.
pub const CHANNEL_ID_HEADER: &str = "X-Channel-Id";

/// Header carrying the session token on authenticated requests.
pub const SESSION_ID_HEADER: &str = "X-Session-Id";

/// `nextPhase` value after a successful identify.
pub const PHASE_CHALLENGE: &str = "challenge";

/// `nextPhase` value after a successful authenticate.
pub const PHASE_SESSION: &str = "session";

// ─────────────────────────────────────────────────────────────────────────────
// Phase 1: open channel
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenChannelRequest {
    pub protocol_version: String,
    /// Base64 ephemeral public key.
    pub ephemeral_public_key: String,
    pub key_exchange_algorithm: String,
    pub supported_ciphers: Vec<String>,
    pub timestamp: DateTime<Utc>,
    /// Base64, 32 random bytes.
    pub nonce: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenChannelResponse {
    pub protocol_version: String,
    pub ephemeral_public_key: String,
    pub key_exchange_algorithm: String,
    pub selected_cipher: String,
    pub timestamp: DateTime<Utc>,
    pub nonce: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Phase 2: identify / register
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyRequest {
    pub channel_id: ChannelId,
    pub node_id: NodeId,
    pub node_name: String,
    /// Base64 certificate (DER or PEM).
    pub certificate: String,
    pub timestamp: DateTime<Utc>,
    /// Base64 RSA-PKCS1-SHA256 signature over [`identity_message`].
    pub signature: String,
}

impl IdentifyRequest {
    /// The exact string the signature covers.
    pub fn signed_message(&self) -> String {
        identity_message(&self.channel_id, &self.node_id, &self.timestamp)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IdentifyResponse {
    pub status: AuthorizationStatus,
    pub node_id: Option<NodeId>,
    pub access_level: Option<AccessLevel>,
    pub next_phase: Option<String>,
    pub message: Option<String>,
}

impl IdentifyResponse {
    pub fn is_authorized(&self) -> bool {
        self.status == AuthorizationStatus::Authorized
    }
}

/// What a node asks to be recorded as.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRegistration {
    pub node_id: NodeId,
    pub node_name: String,
    /// Base64 certificate (DER or PEM).
    pub certificate: String,
    pub node_url: Option<String>,
    #[serde(flatten)]
    pub contact: NodeContact,
    pub requested_access_level: AccessLevel,
}

/// A registration sent over a channel, signed with the presented certificate's key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub channel_id: ChannelId,
    #[serde(flatten)]
    pub registration: NodeRegistration,
    pub timestamp: DateTime<Utc>,
    /// Base64 RSA-PKCS1-SHA256 signature over [`registration_message`].
    pub signature: String,
    /// The same message signed with the key already on record for this node id.
    /// Required to replace a registered certificate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_signature: Option<String>,
}

impl RegisterRequest {
    /// The exact string both signatures cover, for the certificate with `fingerprint`.
    pub fn signed_message(&self, fingerprint: &str) -> String {
        registration_message(&self.channel_id, &self.registration.node_id, fingerprint, &self.timestamp)
    }
}

/// How a registration was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationOutcome {
    /// A new record was inserted as `Pending`.
    Created,
    /// An existing record was updated in place.
    Updated,
    /// Nothing was written.
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResult {
    pub success: bool,
    pub outcome: RegistrationOutcome,
    pub node_id: Option<NodeId>,
    pub status: AuthorizationStatus,
    pub message: String,
}

impl RegistrationResult {
    pub fn rejected(message: impl Into<String>) -> Self {
        Self {
            success: false,
            outcome: RegistrationOutcome::Rejected,
            node_id: None,
            status: AuthorizationStatus::Unknown,
            message: message.into(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Phase 3: challenge / authenticate
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeRequest {
    pub channel_id: ChannelId,
    pub node_id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeResponse {
    /// Base64, 32 random bytes.
    pub challenge_data: String,
    pub issued_at: DateTime<Utc>,
    pub ttl_seconds: u64,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateRequest {
    pub channel_id: ChannelId,
    pub node_id: NodeId,
    /// The challenge value exactly as received.
    pub challenge_data: String,
    /// Base64 RSA-PKCS1-SHA256 signature over [`challenge_message`].
    pub signature: String,
    pub timestamp: DateTime<Utc>,
}

impl AuthenticateRequest {
    pub fn signed_message(&self) -> String {
        challenge_message(&self.challenge_data, &self.channel_id, &self.node_id, &self.timestamp)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticateResponse {
    pub authenticated: bool,
    pub node_id: Option<NodeId>,
    pub session_token: Option<SessionToken>,
    pub session_expires_at: Option<DateTime<Utc>>,
    pub granted_access_level: Option<AccessLevel>,
    pub next_phase: Option<String>,
    pub message: Option<String>,
}

impl AuthenticateResponse {
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            authenticated: false,
            node_id: None,
            session_token: None,
            session_expires_at: None,
            granted_access_level: None,
            next_phase: None,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseChannelRequest {
    pub channel_id: ChannelId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseChannelResponse {
    pub closed: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Signed strings
// ─────────────────────────────────────────────────────────────────────────────

/// `channelId + nodeId + timestamp`, signed during identify.
pub fn identity_message(channel_id: &ChannelId, node_id: &NodeId, timestamp: &DateTime<Utc>) -> String {
    format!("{}{}{}", channel_id, node_id, signing_timestamp(timestamp))
}

/// `channelId + nodeId + certificateFingerprint + timestamp`, signed during register.
pub fn registration_message(
    channel_id: &ChannelId,
    node_id: &NodeId,
    fingerprint: &str,
    timestamp: &DateTime<Utc>,
) -> String {
    format!("{}{}{}{}", channel_id, node_id, fingerprint, signing_timestamp(timestamp))
}

/// `challengeValue + channelId + nodeId + timestamp`, signed during authenticate.
pub fn challenge_message(
    challenge: &str,
    channel_id: &ChannelId,
    node_id: &NodeId,
    timestamp: &DateTime<Utc>,
) -> String {
    format!("{}{}{}{}", challenge, channel_id, node_id, signing_timestamp(timestamp))
}

// ─────────────────────────────────────────────────────────────────────────────
// Authenticated requests
// ─────────────────────────────────────────────────────────────────────────────

/// A decrypted request body that may carry its own session token.
///
/// Bodies that return `None` are authenticated by the `X-Session-Id` header
/// alone; bodies that return a token must agree with the header.
pub trait HasSessionToken {
    fn session_token(&self) -> Option<&SessionToken>;
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

/// Machine-readable error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorCode {
    #[serde(rename = "ERR_MISSING_CHANNEL_ID")]
    MissingChannelId,
    #[serde(rename = "ERR_INVALID_CHANNEL")]
    InvalidChannel,
    #[serde(rename = "ERR_EMPTY_BODY")]
    EmptyBody,
    #[serde(rename = "ERR_INVALID_PAYLOAD")]
    InvalidPayload,
    #[serde(rename = "ERR_DECRYPTION_FAILED")]
    DecryptionFailed,
    #[serde(rename = "ERR_INVALID_SIGNATURE")]
    InvalidSignature,
    #[serde(rename = "ERR_INVALID_EPHEMERAL_KEY")]
    InvalidEphemeralKey,
    #[serde(rename = "ERR_CHANNEL_FAILED")]
    ChannelFailed,
    #[serde(rename = "ERR_TIMEOUT")]
    Timeout,
    #[serde(rename = "ERR_INVALID_SESSION")]
    InvalidSession,
    #[serde(rename = "ERR_INSUFFICIENT_PERMISSIONS")]
    InsufficientPermissions,
    #[serde(rename = "ERR_RATE_LIMIT_EXCEEDED")]
    RateLimitExceeded,
    #[serde(rename = "ERR_NODE_NOT_FOUND")]
    NodeNotFound,
    #[serde(rename = "ERR_HANDSHAKE_FAILED")]
    HandshakeFailed,
    #[serde(rename = "ERR_AUTHENTICATION_FAILED")]
    AuthenticationFailed,
    #[serde(rename = "ERR_NOT_FOUND")]
    NotFound,
    #[serde(rename = "ERR_IMPORT_FAILED")]
    ImportFailed,
    #[serde(rename = "ERR_INTERNAL")]
    Internal,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::MissingChannelId => "ERR_MISSING_CHANNEL_ID",
            ErrorCode::InvalidChannel => "ERR_INVALID_CHANNEL",
            ErrorCode::EmptyBody => "ERR_EMPTY_BODY",
            ErrorCode::InvalidPayload => "ERR_INVALID_PAYLOAD",
            ErrorCode::DecryptionFailed => "ERR_DECRYPTION_FAILED",
            ErrorCode::InvalidSignature => "ERR_INVALID_SIGNATURE",
            ErrorCode::InvalidEphemeralKey => "ERR_INVALID_EPHEMERAL_KEY",
            ErrorCode::ChannelFailed => "ERR_CHANNEL_FAILED",
            ErrorCode::Timeout => "ERR_TIMEOUT",
            ErrorCode::InvalidSession => "ERR_INVALID_SESSION",
            ErrorCode::InsufficientPermissions => "ERR_INSUFFICIENT_PERMISSIONS",
            ErrorCode::RateLimitExceeded => "ERR_RATE_LIMIT_EXCEEDED",
            ErrorCode::NodeNotFound => "ERR_NODE_NOT_FOUND",
            ErrorCode::HandshakeFailed => "ERR_HANDSHAKE_FAILED",
            ErrorCode::AuthenticationFailed => "ERR_AUTHENTICATION_FAILED",
            ErrorCode::NotFound => "ERR_NOT_FOUND",
            ErrorCode::ImportFailed => "ERR_IMPORT_FAILED",
            ErrorCode::Internal => "ERR_INTERNAL",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
}

/// `{error: {code, message, retryable}}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorBody,
}

impl ErrorEnvelope {
    pub fn new(code: ErrorCode, message: impl Into<String>, retryable: bool) -> Self {
        Self {
            error: ErrorBody {
                code,
                message: message.into(),
                retryable,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn test_identity_message_layout() {
        let channel = ChannelId::from("c-1");
        let node = NodeId::parse("6f1c1c2e-9a7e-4b8a-9d55-0b8f0a3f6a10").unwrap();
        let ts = Utc.with_ymd_and_hms(2025, 3, 4, 5, 6, 7).unwrap();

        assert_eq!(
            identity_message(&channel, &node, &ts),
            "c-16f1c1c2e-9a7e-4b8a-9d55-0b8f0a3f6a102025-03-04T05:06:07.000Z"
        );
        assert_eq!(
            challenge_message("Q0hBTA==", &channel, &node, &ts),
            "Q0hBTA==c-16f1c1c2e-9a7e-4b8a-9d55-0b8f0a3f6a102025-03-04T05:06:07.000Z"
        );
    }

    #[test]
    fn test_error_envelope_wire_format() {
        let env = ErrorEnvelope::new(ErrorCode::RateLimitExceeded, "slow down", true);
        assert_eq!(
            serde_json::to_value(&env).unwrap(),
            json!({"error": {"code": "ERR_RATE_LIMIT_EXCEEDED", "message": "slow down", "retryable": true}})
        );
        for code in [ErrorCode::MissingChannelId, ErrorCode::InvalidEphemeralKey, ErrorCode::Internal] {
            assert_eq!(serde_json::to_value(code).unwrap(), json!(code.as_str()));
        }
    }

    #[test]
    fn test_register_request_flattens_contact() {
        let channel_id = ChannelId::generate();
        let req = RegisterRequest {
            channel_id: channel_id.clone(),
            registration: NodeRegistration {
                node_id: NodeId::new(),
                node_name: "node-b".into(),
                certificate: "MII...".into(),
                node_url: Some("https://b.example".into()),
                contact: NodeContact {
                    contact_email: Some("ops@b.example".into()),
                    ..Default::default()
                },
                requested_access_level: AccessLevel::ReadOnly,
            },
            timestamp: Utc::now(),
            signature: "c2ln".into(),
            rotation_signature: None,
        };
        let value = serde_json::to_value(&req).unwrap();
        assert_eq!(value["channelId"], channel_id.as_str());
        assert_eq!(value["nodeName"], "node-b");
        assert_eq!(value["contactEmail"], "ops@b.example");
        assert_eq!(value["requestedAccessLevel"], "ReadOnly");
        assert!(value.get("rotationSignature").is_none());
        let back: RegisterRequest = serde_json::from_value(value).unwrap();
        assert_eq!(back, req);
    }

    #[test]
    fn test_registration_message_binds_fingerprint() {
        let channel_id = ChannelId::generate();
        let node_id = NodeId::new();
        let at = Utc::now();
        let a = registration_message(&channel_id, &node_id, "aa", &at);
        assert_eq!(a, format!("{}{}aa{}", channel_id, node_id, signing_timestamp(&at)));
        assert_ne!(a, registration_message(&channel_id, &node_id, "bb", &at));
    }
}

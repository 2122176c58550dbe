//! Error types for the node.
//!
//! [`NodeError`] is what the library and client return. [`ApiError`] is what
//! the server puts on the wire: an HTTP status plus an [`ErrorEnvelope`].

use std::time::Duration;

use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use irn_auth::{AuthError, Denial};
use irn_core::{CoreError, ErrorCode, ErrorEnvelope, NodeId};
use irn_store::StoreError;
use irn_sync::SyncError;

/// Errors that can occur during node operations.
#[derive(Debug, Error)]
pub enum NodeError {
    /// Primitive error (key exchange, crypto, certificates).
    #[error("core error: {0}")]
    Core(#[from] CoreError),

    /// Identity, challenge or session error.
    #[error("auth error: {0}")]
    Auth(#[from] AuthError),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Sync error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Connection failure or a response that could not be read.
    #[error("transport error: {0}")]
    Transport(String),

    /// The request did not complete within the client timeout.
    #[error("request timed out")]
    Timeout,

    /// The peer answered with an error envelope.
    #[error("remote error {status} ({code}): {message}")]
    Remote {
        status: u16,
        code: ErrorCode,
        message: String,
        retryable: bool,
    },

    /// The peer's Phase 1 answer broke the protocol.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The peer refused to identify or authenticate this node.
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Node is not in the local registry.
    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error reading configuration or credentials.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl NodeError {
    /// Whether retrying the same call could succeed.
    ///
    /// Transport failures, timeouts and retryable remote errors qualify.
    /// Contract, cryptographic and authorization failures never do.
    pub fn is_retryable(&self) -> bool {
        match self {
            NodeError::Transport(_) | NodeError::Timeout => true,
            NodeError::Remote { retryable, .. } => *retryable,
            NodeError::Sync(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// The wire code closest to this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            NodeError::Core(CoreError::InvalidPublicKey(_)) => ErrorCode::InvalidEphemeralKey,
            NodeError::Core(CoreError::AuthenticationFailed) => ErrorCode::DecryptionFailed,
            NodeError::Core(CoreError::MalformedEnvelope(_) | CoreError::Deserialization(_)) => {
                ErrorCode::InvalidPayload
            }
            NodeError::Core(CoreError::UnsupportedCipher(_) | CoreError::UnsupportedKeyExchange(_)) => {
                ErrorCode::ChannelFailed
            }
            NodeError::Remote { code, .. } => *code,
            NodeError::Timeout => ErrorCode::Timeout,
            NodeError::Transport(_) => ErrorCode::ChannelFailed,
            NodeError::Handshake(_) => ErrorCode::HandshakeFailed,
            NodeError::AuthenticationFailed(_) => ErrorCode::AuthenticationFailed,
            NodeError::NodeNotFound(_) | NodeError::Sync(SyncError::NodeNotFound(_)) => ErrorCode::NodeNotFound,
            NodeError::Sync(SyncError::NodeNotAuthorized(_)) => ErrorCode::AuthenticationFailed,
            NodeError::Sync(SyncError::Remote { code, .. }) => *code,
            NodeError::Sync(SyncError::Transport { .. }) => ErrorCode::ChannelFailed,
            NodeError::Sync(_) => ErrorCode::ImportFailed,
            _ => ErrorCode::Internal,
        }
    }

    /// Convert for the sync layer, keeping the retryable flag.
    pub fn into_sync(self) -> SyncError {
        match self {
            NodeError::Sync(e) => e,
            NodeError::Store(e) => SyncError::Store(e),
            NodeError::Remote {
                code,
                message,
                retryable,
                ..
            } => SyncError::Remote {
                code,
                message,
                retryable,
            },
            other => SyncError::Transport {
                retryable: other.is_retryable(),
                message: other.to_string(),
            },
        }
    }
}

impl From<reqwest::Error> for NodeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            NodeError::Timeout
        } else {
            NodeError::Transport(e.to_string())
        }
    }
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;

// ─────────────────────────────────────────────────────────────────────────────
// Server-side errors
// ─────────────────────────────────────────────────────────────────────────────

/// A terminal response from the request pipeline or a handler.
#[derive(Debug, Clone)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: ErrorCode,
    pub message: String,
    pub retryable: bool,
    pub retry_after: Option<Duration>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            retryable: false,
            retry_after: None,
        }
    }

    pub fn missing_channel_id() -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorCode::MissingChannelId, "X-Channel-Id header is required")
    }

    pub fn invalid_channel() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, ErrorCode::InvalidChannel, "channel is unknown or expired")
    }

    pub fn empty_body() -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorCode::EmptyBody, "request body is empty")
    }

    pub fn invalid_payload(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorCode::InvalidPayload, message)
    }

    pub fn decryption_failed() -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorCode::DecryptionFailed, "payload failed authentication")
    }

    pub fn invalid_signature(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, ErrorCode::InvalidSignature, message)
    }

    pub fn invalid_ephemeral_key(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorCode::InvalidEphemeralKey, message)
    }

    pub fn channel_failed(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, ErrorCode::ChannelFailed, message)
    }

    pub fn authentication_failed(message: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, ErrorCode::AuthenticationFailed, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, ErrorCode::NotFound, message)
    }

    pub fn import_failed(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNPROCESSABLE_ENTITY, ErrorCode::ImportFailed, message)
    }

    pub fn internal() -> Self {
        Self {
            retryable: true,
            ..Self::new(StatusCode::INTERNAL_SERVER_ERROR, ErrorCode::Internal, "internal error")
        }
    }

    /// Map a session refusal to its wire form.
    pub fn from_denial(denial: Denial) -> Self {
        match denial {
            Denial::InvalidSession | Denial::ChannelMismatch => Self::new(
                StatusCode::UNAUTHORIZED,
                ErrorCode::InvalidSession,
                "session is invalid or expired",
            ),
            Denial::InsufficientPermissions { granted, required } => Self::new(
                StatusCode::FORBIDDEN,
                ErrorCode::InsufficientPermissions,
                format!("requires {}, session has {}", required.as_str(), granted.as_str()),
            ),
            Denial::RateLimited { retry_after } => Self {
                retryable: true,
                retry_after: Some(retry_after),
                ..Self::new(
                    StatusCode::TOO_MANY_REQUESTS,
                    ErrorCode::RateLimitExceeded,
                    "rate limit exceeded",
                )
            },
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        ErrorEnvelope::new(self.code, self.message.clone(), self.retryable)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut response = (self.status, Json(self.envelope())).into_response();
        if let Some(retry_after) = self.retry_after {
            // Round up so a client never retries before the window frees.
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            if let Ok(value) = HeaderValue::from_str(&secs.max(1).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

impl From<AuthError> for ApiError {
    fn from(e: AuthError) -> Self {
        tracing::error!(error = %e, "auth backend failure");
        ApiError::internal()
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        tracing::error!(error = %e, "store failure");
        ApiError::internal()
    }
}

impl From<SyncError> for ApiError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Store(e) => e.into(),
            SyncError::Task(message) => {
                tracing::error!(error = %message, "sync task failure");
                ApiError::internal()
            }
            other => ApiError::invalid_payload(other.to_string()),
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::AuthenticationFailed => {
                tracing::warn!("payload failed AEAD authentication");
                ApiError::decryption_failed()
            }
            CoreError::MalformedEnvelope(m) | CoreError::Deserialization(m) => ApiError::invalid_payload(m),
            CoreError::InvalidPublicKey(m) => ApiError::invalid_ephemeral_key(m),
            CoreError::UnsupportedCipher(m) | CoreError::UnsupportedKeyExchange(m) => ApiError::channel_failed(m),
            other => {
                tracing::error!(error = %other, "crypto failure");
                ApiError::internal()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use irn_core::AccessLevel;

    #[test]
    fn test_retryable_classification() {
        assert!(NodeError::Timeout.is_retryable());
        assert!(NodeError::Transport("refused".into()).is_retryable());
        assert!(!NodeError::Handshake("no header".into()).is_retryable());
        assert!(!NodeError::AuthenticationFailed("pending".into()).is_retryable());
        assert!(!NodeError::Core(CoreError::AuthenticationFailed).is_retryable());
        assert_eq!(
            NodeError::Core(CoreError::InvalidPublicKey("bad".into())).code(),
            ErrorCode::InvalidEphemeralKey
        );
    }

    #[test]
    fn test_into_sync_keeps_retryable() {
        let err = NodeError::Remote {
            status: 503,
            code: ErrorCode::Internal,
            message: "busy".into(),
            retryable: true,
        }
        .into_sync();
        assert!(err.is_retryable());
        assert!(!NodeError::Handshake("x".into()).into_sync().is_retryable());
    }

    #[test]
    fn test_rate_limit_response_has_retry_after() {
        let err = ApiError::from_denial(Denial::RateLimited {
            retry_after: Duration::from_millis(1500),
        });
        assert!(err.retryable);
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "2");
    }

    #[test]
    fn test_insufficient_permissions_is_forbidden() {
        let err = ApiError::from_denial(Denial::InsufficientPermissions {
            granted: AccessLevel::ReadOnly,
            required: AccessLevel::ReadWrite,
        });
        assert_eq!(err.status, StatusCode::FORBIDDEN);
        assert_eq!(err.code, ErrorCode::InsufficientPermissions);
        assert!(!err.retryable);
    }
}

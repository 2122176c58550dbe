//! Request pipeline stages.
//!
//! ```text
//! load_channel -> decrypt -> verify_identity -> authorize -> handler
//!                            (identify only)    (sync only)
//! ```
//!
//! Stages are plain functions. Handlers call the ones they need, in this
//! order, and return the first error as the response.

use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use serde::Serialize;

use irn_auth::{Authorization, EndpointClass, IdentityCheck};
use irn_core::messages::{IdentifyRequest, CHANNEL_ID_HEADER, SESSION_ID_HEADER};
use irn_core::{
    AccessLevel, ChannelContext, ChannelId, CoreError, EncryptedEnvelope, HasSessionToken, NodeCertificate,
    SessionContext, SessionToken,
};

use super::NodeServices;
use crate::error::ApiError;

type Stage<T> = std::result::Result<T, ApiError>;

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Resolve `X-Channel-Id` to a live channel.
pub async fn load_channel(services: &NodeServices, headers: &HeaderMap) -> Stage<ChannelContext> {
    let id = header(headers, CHANNEL_ID_HEADER).ok_or_else(ApiError::missing_channel_id)?;
    services
        .channels
        .get(&ChannelId::from(id))
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "channel lookup failed");
            ApiError::internal()
        })?
        .ok_or_else(ApiError::invalid_channel)
}

/// Decrypt the body into the request type.
pub fn decrypt<T: DeserializeOwned>(channel: &ChannelContext, body: &[u8]) -> Stage<T> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(ApiError::empty_body());
    }
    let envelope: EncryptedEnvelope =
        serde_json::from_slice(body).map_err(|e| ApiError::invalid_payload(format!("not an envelope: {e}")))?;
    channel.open(&envelope).map_err(|e| {
        if matches!(e, CoreError::AuthenticationFailed) {
            tracing::warn!(channel = %channel.id(), "request failed AEAD authentication");
        }
        ApiError::from(e)
    })
}

/// Verify an identify request's certificate, timestamp and signature.
pub fn verify_identity(
    services: &NodeServices,
    channel: &ChannelContext,
    request: &IdentifyRequest,
) -> Stage<NodeCertificate> {
    if request.channel_id != *channel.id() {
        return Err(ApiError::invalid_payload("channel id does not match header"));
    }
    let reason = match services.identity.check_identity(request, chrono::Utc::now()) {
        IdentityCheck::Verified(cert) => return Ok(cert),
        IdentityCheck::InvalidCertificate(m) => format!("invalid certificate: {m}"),
        IdentityCheck::CertificateExpired => "certificate has expired".to_string(),
        IdentityCheck::ClockSkew => "timestamp outside allowed clock skew".to_string(),
        IdentityCheck::BadSignature => "signature does not verify".to_string(),
    };
    tracing::warn!(channel = %channel.id(), node = %request.node_id, reason = %reason, "identify rejected");
    Err(ApiError::invalid_signature(reason))
}

/// Validate the session, check capability and charge the rate limit.
///
/// The token comes from `X-Session-Id`; a body that carries its own token
/// must agree with the header.
pub async fn authorize(
    services: &NodeServices,
    headers: &HeaderMap,
    channel: &ChannelContext,
    body_token: Option<&SessionToken>,
    required: AccessLevel,
    class: EndpointClass,
) -> Stage<SessionContext> {
    let header_token = header(headers, SESSION_ID_HEADER).map(SessionToken::from);
    let token = match (header_token, body_token) {
        (Some(h), Some(b)) if h != *b => {
            tracing::warn!(channel = %channel.id(), "session header and body disagree");
            return Err(ApiError::from_denial(irn_auth::Denial::InvalidSession));
        }
        (Some(h), _) => h,
        (None, Some(b)) => b.clone(),
        (None, None) => return Err(ApiError::from_denial(irn_auth::Denial::InvalidSession)),
    };

    match services
        .challenges
        .sessions()
        .authorize(&token, channel.id(), required, class)
        .await?
    {
        Authorization::Granted(session) => Ok(session),
        Authorization::Denied(denial) => Err(ApiError::from_denial(denial)),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Compositions
// ─────────────────────────────────────────────────────────────────────────────

/// Channel lookup then decryption.
pub async fn open_request<T: DeserializeOwned>(
    services: &NodeServices,
    headers: &HeaderMap,
    body: &[u8],
) -> Stage<(ChannelContext, T)> {
    let channel = load_channel(services, headers).await?;
    let request = decrypt(&channel, body)?;
    Ok((channel, request))
}

/// Channel lookup, decryption, then session authorization.
pub async fn open_authorized<T: DeserializeOwned + HasSessionToken>(
    services: &NodeServices,
    headers: &HeaderMap,
    body: &[u8],
    required: AccessLevel,
    class: EndpointClass,
) -> Stage<(ChannelContext, T, SessionContext)> {
    let (channel, request) = open_request::<T>(services, headers, body).await?;
    let session = authorize(services, headers, &channel, request.session_token(), required, class).await?;
    Ok((channel, request, session))
}

/// Seal a response value for the channel.
pub fn seal<T: Serialize>(channel: &ChannelContext, value: &T) -> Stage<Response> {
    Ok(Json(channel.seal(value)?).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use irn_core::{ChannelKey, ChannelRole, Cipher, ErrorCode};

    fn channel(key: u8) -> ChannelContext {
        ChannelContext::new(
            ChannelId::generate(),
            ChannelKey::from_slice(&[key; 32]).unwrap(),
            Cipher::Aes256Gcm,
            vec![1; 32],
            vec![2; 32],
            ChannelRole::Responder,
            chrono::Duration::minutes(5),
        )
    }

    #[test]
    fn test_decrypt_classifies_failures() {
        let ctx = channel(9);
        assert_eq!(decrypt::<serde_json::Value>(&ctx, b"").unwrap_err().code, ErrorCode::EmptyBody);
        assert_eq!(decrypt::<serde_json::Value>(&ctx, b"  \n").unwrap_err().code, ErrorCode::EmptyBody);
        assert_eq!(
            decrypt::<serde_json::Value>(&ctx, b"{\"hello\":1}").unwrap_err().code,
            ErrorCode::InvalidPayload
        );

        let other = channel(10);
        let foreign = serde_json::to_vec(&other.seal(&serde_json::json!({ "a": 1 })).unwrap()).unwrap();
        assert_eq!(
            decrypt::<serde_json::Value>(&ctx, &foreign).unwrap_err().code,
            ErrorCode::DecryptionFailed
        );

        let wrong_shape = serde_json::to_vec(&ctx.seal(&serde_json::json!([1, 2])).unwrap()).unwrap();
        assert_eq!(
            decrypt::<IdentifyRequest>(&ctx, &wrong_shape).unwrap_err().code,
            ErrorCode::InvalidPayload
        );

        let ok = serde_json::to_vec(&ctx.seal(&serde_json::json!({ "a": 1 })).unwrap()).unwrap();
        assert_eq!(decrypt::<serde_json::Value>(&ctx, &ok).unwrap()["a"], 1);
    }

    #[test]
    fn test_header_trims_and_rejects_empty() {
        let mut headers = HeaderMap::new();
        headers.insert("x-channel-id", HeaderValue::from_static("  "));
        assert!(header(&headers, CHANNEL_ID_HEADER).is_none());
        headers.insert("x-channel-id", HeaderValue::from_static(" abc "));
        assert_eq!(header(&headers, CHANNEL_ID_HEADER), Some("abc"));
    }
}

//! Handshake client: the initiator side of the four phases.
//!
//! ```text
//! open_channel   POST /api/channel/open       plain JSON, X-Channel-Id back
//! identify       POST /api/node/identify      sealed, signed identity
//! authenticate   POST /api/node/challenge     sealed
//!                POST /api/node/authenticate  sealed, signed challenge
//! invoke         any  /api/...                sealed, X-Session-Id
//! close_channel  POST /api/channel/close      sealed, best effort
//! ```
//!
//! Every request is bounded by [`ClientConfig::request_timeout`].

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;

use irn_core::messages::{
    challenge_message, identity_message, registration_message, AuthenticateRequest, AuthenticateResponse, ChallengeRequest,
    ChallengeResponse, CloseChannelRequest, CloseChannelResponse, IdentifyRequest, IdentifyResponse,
    NodeRegistration, OpenChannelResponse, RegisterRequest, RegistrationResult, CHANNEL_ID_HEADER,
    SESSION_ID_HEADER,
};
use irn_core::{
    now_millis, AccessLevel, ChannelContext, ChannelId, CoreError, EncryptedEnvelope, ErrorCode, ErrorEnvelope,
    NodeCertificate, NodeContact, NodeId, NodeSigner, SessionToken,
};
use irn_store::ChannelStore;

use crate::channel::{ChannelConfig, PendingChannel};
use crate::error::{NodeError, Result};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub request_timeout: Duration,
    pub channel: ChannelConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            channel: ChannelConfig::default(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Credentials
// ─────────────────────────────────────────────────────────────────────────────

/// This node's identity as presented to peers.
#[derive(Debug, Clone)]
pub struct NodeCredentials {
    pub node_id: NodeId,
    pub node_name: String,
    /// Base64 DER.
    pub certificate: String,
    pub signer: Arc<NodeSigner>,
    /// Key for the certificate a peer may still have on record. Countersigns
    /// registrations so the peer accepts the new certificate.
    pub previous_signer: Option<Arc<NodeSigner>>,
}

impl NodeCredentials {
    pub fn new(node_id: NodeId, node_name: impl Into<String>, certificate: &NodeCertificate, signer: Arc<NodeSigner>) -> Self {
        Self {
            node_id,
            node_name: node_name.into(),
            certificate: certificate.to_base64(),
            signer,
            previous_signer: None,
        }
    }

    pub fn with_previous_signer(mut self, signer: Arc<NodeSigner>) -> Self {
        self.previous_signer = Some(signer);
        self
    }

    /// Load a certificate and key, each either PEM or base64 DER.
    pub fn load(
        node_id: NodeId,
        node_name: impl Into<String>,
        certificate_path: &Path,
        private_key_path: &Path,
    ) -> Result<Self> {
        let certificate = load_certificate(certificate_path)?;
        certificate.ensure_valid_at(Utc::now())?;

        let signer = load_signer(private_key_path)?;
        Ok(Self::new(node_id, node_name, &certificate, Arc::new(signer)))
    }

    fn sign(&self, message: &str) -> Result<String> {
        Ok(self.signer.sign_base64(message.as_bytes())?)
    }

    pub fn identify_request(&self, channel_id: &ChannelId, timestamp: DateTime<Utc>) -> Result<IdentifyRequest> {
        Ok(IdentifyRequest {
            channel_id: channel_id.clone(),
            node_id: self.node_id,
            node_name: self.node_name.clone(),
            certificate: self.certificate.clone(),
            timestamp,
            signature: self.sign(&identity_message(channel_id, &self.node_id, &timestamp))?,
        })
    }

    pub fn authenticate_request(
        &self,
        channel_id: &ChannelId,
        challenge: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<AuthenticateRequest> {
        Ok(AuthenticateRequest {
            channel_id: channel_id.clone(),
            node_id: self.node_id,
            challenge_data: challenge.to_string(),
            signature: self.sign(&challenge_message(challenge, channel_id, &self.node_id, &timestamp))?,
            timestamp,
        })
    }

    pub fn registration(
        &self,
        node_url: Option<String>,
        contact: NodeContact,
        requested_access_level: AccessLevel,
    ) -> NodeRegistration {
        NodeRegistration {
            node_id: self.node_id,
            node_name: self.node_name.clone(),
            certificate: self.certificate.clone(),
            node_url,
            contact,
            requested_access_level,
        }
    }

    /// Sign `registration` for `channel_id`, countersigning with the previous
    /// key when one is configured.
    pub fn register_request(
        &self,
        channel_id: &ChannelId,
        registration: NodeRegistration,
        timestamp: DateTime<Utc>,
    ) -> Result<RegisterRequest> {
        let fingerprint = NodeCertificate::from_base64(&registration.certificate)?.fingerprint().to_string();
        let message = registration_message(channel_id, &registration.node_id, &fingerprint, &timestamp);
        let rotation_signature = match &self.previous_signer {
            Some(previous) => Some(previous.sign_base64(message.as_bytes())?),
            None => None,
        };
        Ok(RegisterRequest {
            channel_id: channel_id.clone(),
            signature: self.sign(&message)?,
            registration,
            timestamp,
            rotation_signature,
        })
    }
}

/// Read a certificate file, PEM or base64 DER.
pub fn load_certificate(path: &Path) -> Result<NodeCertificate> {
    let bytes = std::fs::read(path)?;
    if is_pem(&bytes) {
        Ok(NodeCertificate::from_pem(&bytes)?)
    } else {
        Ok(NodeCertificate::from_base64(String::from_utf8_lossy(&bytes).trim())?)
    }
}

/// Read a PKCS#8 private key file, PEM or base64 DER.
pub fn load_signer(path: &Path) -> Result<NodeSigner> {
    let bytes = std::fs::read(path)?;
    if is_pem(&bytes) {
        Ok(NodeSigner::from_pem(&bytes)?)
    } else {
        Ok(NodeSigner::from_base64(String::from_utf8_lossy(&bytes).trim())?)
    }
}

fn is_pem(bytes: &[u8]) -> bool {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    bytes[start..].starts_with(b"-----BEGIN")
}

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

/// A channel that completed all phases, with its session.
#[derive(Debug, Clone)]
pub struct AuthenticatedChannel {
    pub base_url: String,
    pub channel: ChannelContext,
    pub session_token: SessionToken,
    pub access_level: Option<AccessLevel>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl AuthenticatedChannel {
    pub fn channel_id(&self) -> &ChannelId {
        self.channel.id()
    }
}

/// Drives handshakes and authenticated calls against peers.
pub struct HandshakeClient {
    http: reqwest::Client,
    credentials: NodeCredentials,
    config: ClientConfig,
    channels: Arc<dyn ChannelStore>,
}

impl HandshakeClient {
    pub fn new(credentials: NodeCredentials, config: ClientConfig, channels: Arc<dyn ChannelStore>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()?;
        Ok(Self {
            http,
            credentials,
            config,
            channels,
        })
    }

    pub fn credentials(&self) -> &NodeCredentials {
        &self.credentials
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Run all phases against `base_url`.
    ///
    /// If anything after Phase 1 fails, the channel is closed before the
    /// error is returned.
    pub async fn connect(&self, base_url: &str) -> Result<AuthenticatedChannel> {
        let channel = self.open_channel(base_url).await?;
        let result = async {
            self.identify(base_url, &channel).await?;
            self.authenticate(base_url, &channel).await
        }
        .await;
        match result {
            Ok(session) => Ok(session),
            Err(e) => {
                tracing::warn!(peer = base_url, channel = %channel.id(), error = %e, "handshake failed");
                self.close_channel(base_url, &channel).await;
                Err(e)
            }
        }
    }

    /// Phase 1. Nothing is stored unless the whole exchange succeeds.
    pub async fn open_channel(&self, base_url: &str) -> Result<ChannelContext> {
        let pending = PendingChannel::initiate(&self.config.channel)?;
        let response = self
            .http
            .post(endpoint(base_url, "/api/channel/open"))
            .json(pending.request())
            .send()
            .await?;
        let response = check_status(response).await?;

        let channel_id = response
            .headers()
            .get(CHANNEL_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(ChannelId::from)
            .ok_or_else(|| NodeError::Handshake(format!("response has no {CHANNEL_ID_HEADER} header")))?;
        let body = response.bytes().await?;
        let answer: OpenChannelResponse = serde_json::from_slice(&body)
            .map_err(|e| NodeError::Handshake(format!("unreadable open response: {e}")))?;

        let channel = pending.complete(channel_id, &answer, &self.config.channel)?;
        self.channels.put(&channel).await?;
        tracing::debug!(peer = base_url, channel = %channel.id(), cipher = %channel.cipher(), "channel established");
        Ok(channel)
    }

    /// Phase 2. Only an `Authorized` answer proceeds.
    pub async fn identify(&self, base_url: &str, channel: &ChannelContext) -> Result<IdentifyResponse> {
        let request = self.credentials.identify_request(channel.id(), now_millis())?;
        let response: IdentifyResponse = self
            .call(base_url, channel, Method::POST, "/api/node/identify", Some(&request), None)
            .await?;
        if !response.is_authorized() {
            return Err(NodeError::AuthenticationFailed(
                response
                    .message
                    .unwrap_or_else(|| format!("node status is {}", response.status.as_str())),
            ));
        }
        Ok(response)
    }

    /// Phase 3: fetch a challenge, sign it, and exchange it for a session.
    pub async fn authenticate(&self, base_url: &str, channel: &ChannelContext) -> Result<AuthenticatedChannel> {
        let request = ChallengeRequest {
            channel_id: channel.id().clone(),
            node_id: self.credentials.node_id,
        };
        let challenge: ChallengeResponse = self
            .call(base_url, channel, Method::POST, "/api/node/challenge", Some(&request), None)
            .await?;

        let request = self
            .credentials
            .authenticate_request(channel.id(), &challenge.challenge_data, now_millis())?;
        let response: AuthenticateResponse = self
            .call(base_url, channel, Method::POST, "/api/node/authenticate", Some(&request), None)
            .await?;
        if !response.authenticated {
            return Err(NodeError::AuthenticationFailed(
                response.message.unwrap_or_else(|| "challenge rejected".into()),
            ));
        }
        let session_token = response
            .session_token
            .filter(|t| !t.as_str().is_empty())
            .ok_or_else(|| NodeError::AuthenticationFailed("no session token issued".into()))?;
        tracing::info!(peer = base_url, channel = %channel.id(), session = %session_token, "authenticated");

        Ok(AuthenticatedChannel {
            base_url: base_url.to_string(),
            channel: channel.clone(),
            session_token,
            access_level: response.granted_access_level,
            expires_at: response.session_expires_at,
        })
    }

    /// Sign and send a registration over a fresh channel, then close it.
    pub async fn register(&self, base_url: &str, registration: &NodeRegistration) -> Result<RegistrationResult> {
        let channel = self.open_channel(base_url).await?;
        let result = match self.credentials.register_request(channel.id(), registration.clone(), now_millis()) {
            Ok(request) => {
                self.call(base_url, &channel, Method::POST, "/api/node/register", Some(&request), None)
                    .await
            }
            Err(e) => Err(e),
        };
        self.close_channel(base_url, &channel).await;
        result
    }

    /// Authenticated call returning a typed response.
    pub async fn invoke<B, T>(&self, session: &AuthenticatedChannel, method: Method, path: &str, body: Option<&B>) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let bytes = self.invoke_stream(session, method, path, body).await?;
        Ok(serde_json::from_slice(&bytes).map_err(|e| CoreError::Deserialization(e.to_string()))?)
    }

    /// Authenticated call returning the decrypted response bytes.
    pub async fn invoke_stream<B>(
        &self,
        session: &AuthenticatedChannel,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<Bytes>
    where
        B: Serialize + ?Sized,
    {
        let envelope = self
            .exchange(
                &session.base_url,
                &session.channel,
                method,
                path,
                body,
                Some(&session.session_token),
            )
            .await?;
        Ok(Bytes::from(session.channel.open_bytes(&envelope)?))
    }

    /// Close a channel on both ends. Never fails; a peer that cannot be
    /// reached is logged and the local entry is dropped anyway.
    pub async fn close_channel(&self, base_url: &str, channel: &ChannelContext) {
        let request = CloseChannelRequest {
            channel_id: channel.id().clone(),
        };
        let remote: Result<CloseChannelResponse> = self
            .call(base_url, channel, Method::POST, "/api/channel/close", Some(&request), None)
            .await;
        if let Err(e) = remote {
            tracing::debug!(peer = base_url, channel = %channel.id(), error = %e, "remote close failed");
        }
        if let Err(e) = self.channels.remove(channel.id()).await {
            tracing::warn!(channel = %channel.id(), error = %e, "failed to drop local channel");
        }
    }

    /// Close an authenticated channel.
    pub async fn close(&self, session: &AuthenticatedChannel) {
        self.close_channel(&session.base_url, &session.channel).await;
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Wire
    // ─────────────────────────────────────────────────────────────────────────

    async fn call<B, T>(
        &self,
        base_url: &str,
        channel: &ChannelContext,
        method: Method,
        path: &str,
        body: Option<&B>,
        session: Option<&SessionToken>,
    ) -> Result<T>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let envelope = self.exchange(base_url, channel, method, path, body, session).await?;
        Ok(channel.open(&envelope)?)
    }

    async fn exchange<B>(
        &self,
        base_url: &str,
        channel: &ChannelContext,
        method: Method,
        path: &str,
        body: Option<&B>,
        session: Option<&SessionToken>,
    ) -> Result<EncryptedEnvelope>
    where
        B: Serialize + ?Sized,
    {
        let mut request = self
            .http
            .request(method, endpoint(base_url, path))
            .header(CHANNEL_ID_HEADER, channel.id().as_str());
        if let Some(token) = session {
            request = request.header(SESSION_ID_HEADER, token.as_str());
        }
        if let Some(body) = body {
            request = request.json(&channel.seal(body)?);
        }

        let response = check_status(request.send().await?).await?;
        let bytes = response.bytes().await?;
        serde_json::from_slice(&bytes).map_err(|e| NodeError::Core(CoreError::MalformedEnvelope(e.to_string())))
    }
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

/// Turn a non-2xx response into [`NodeError::Remote`].
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let transient = status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
    let body = response.bytes().await.unwrap_or_default();
    Err(match serde_json::from_slice::<ErrorEnvelope>(&body) {
        Ok(envelope) => NodeError::Remote {
            status: status.as_u16(),
            code: envelope.error.code,
            message: envelope.error.message,
            retryable: envelope.error.retryable || status.is_server_error(),
        },
        Err(_) => NodeError::Remote {
            status: status.as_u16(),
            code: if status == StatusCode::NOT_FOUND {
                ErrorCode::NotFound
            } else if transient {
                ErrorCode::Internal
            } else {
                ErrorCode::InvalidPayload
            },
            message: format!("HTTP {status}"),
            retryable: transient,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_joins_cleanly() {
        assert_eq!(endpoint("http://a:1/", "/api/x"), "http://a:1/api/x");
        assert_eq!(endpoint("http://a:1", "/api/x"), "http://a:1/api/x");
    }

    #[test]
    fn test_pem_detection() {
        assert!(is_pem(b"\n-----BEGIN CERTIFICATE-----\n"));
        assert!(!is_pem(b"MIIC..."));
    }
}

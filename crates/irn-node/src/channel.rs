//! Phase 1: opening an encrypted channel.
//!
//! Both sides generate an ephemeral key pair and a nonce, exchange public
//! halves, and derive the same channel key from the ECDH secret salted with
//! `client_nonce || server_nonce`. The responder stores its context as soon
//! as it answers; the initiator stores nothing until the answer checks out.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{Duration, Utc};

use irn_core::aead::random_bytes;
use irn_core::messages::{OpenChannelRequest, OpenChannelResponse};
use irn_core::{
    derive_channel_key, derive_shared_secret, export_public_key, generate_key_pair, import_public_key,
    validate_public_key, ChannelContext, ChannelId, ChannelRole, Cipher, EphemeralKeyPair, KeyExchangeAlgorithm,
    DEFAULT_CHANNEL_TTL_SECS, PROTOCOL_VERSION,
};
use irn_store::ChannelStore;

use crate::error::{ApiError, NodeError, Result};

/// Handshake nonce length in bytes.
pub const HANDSHAKE_NONCE_LEN: usize = 32;

/// Shortest client nonce the responder accepts.
const MIN_NONCE_LEN: usize = 16;

/// Channel parameters shared by both roles.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Lifetime of an established channel.
    pub ttl: Duration,
    /// Algorithm the initiator proposes.
    pub key_exchange: KeyExchangeAlgorithm,
    /// Ciphers in preference order. The initiator offers them all; the
    /// responder picks the first the initiator also offers.
    pub ciphers: Vec<Cipher>,
    pub protocol_version: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::seconds(DEFAULT_CHANNEL_TTL_SECS),
            key_exchange: KeyExchangeAlgorithm::default(),
            ciphers: Cipher::ALL.to_vec(),
            protocol_version: PROTOCOL_VERSION.to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Responder
// ─────────────────────────────────────────────────────────────────────────────

/// Accepts, looks up and closes channels on the responder side.
pub struct ChannelManager {
    store: Arc<dyn ChannelStore>,
    config: ChannelConfig,
}

impl ChannelManager {
    pub fn new(store: Arc<dyn ChannelStore>, config: ChannelConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Answer an open request and store the new channel.
    pub async fn accept(
        &self,
        request: &OpenChannelRequest,
    ) -> std::result::Result<(ChannelId, OpenChannelResponse), ApiError> {
        if request.protocol_version != self.config.protocol_version {
            return Err(ApiError::channel_failed(format!(
                "unsupported protocol version {}",
                request.protocol_version
            )));
        }
        let algorithm: KeyExchangeAlgorithm = request.key_exchange_algorithm.parse()?;

        let peer_bytes = STANDARD
            .decode(&request.ephemeral_public_key)
            .map_err(|e| ApiError::invalid_ephemeral_key(e.to_string()))?;
        if !validate_public_key(&peer_bytes, algorithm) {
            tracing::warn!(algorithm = %algorithm, "rejected ephemeral key not on curve");
            return Err(ApiError::invalid_ephemeral_key(format!("not a valid {algorithm} public key")));
        }
        let peer = import_public_key(&peer_bytes, algorithm)?;

        let cipher = Cipher::negotiate(&self.config.ciphers, &request.supported_ciphers)
            .ok_or_else(|| ApiError::channel_failed("no cipher in common"))?;

        let client_nonce = STANDARD
            .decode(&request.nonce)
            .map_err(|e| ApiError::invalid_payload(format!("nonce: {e}")))?;
        if client_nonce.len() < MIN_NONCE_LEN {
            return Err(ApiError::invalid_payload("nonce is too short"));
        }

        let pair = generate_key_pair(algorithm)?;
        let server_nonce = random_bytes::<HANDSHAKE_NONCE_LEN>();
        let key = {
            let shared = derive_shared_secret(&pair, &peer)?;
            derive_channel_key(&shared, &client_nonce, &server_nonce)?
        };

        let ctx = ChannelContext::new(
            ChannelId::generate(),
            key,
            cipher,
            client_nonce,
            server_nonce.to_vec(),
            ChannelRole::Responder,
            self.config.ttl,
        );
        self.store.put(&ctx).await?;
        tracing::info!(channel = %ctx.id(), cipher = %cipher, algorithm = %algorithm, "channel opened");

        let response = OpenChannelResponse {
            protocol_version: self.config.protocol_version.clone(),
            ephemeral_public_key: STANDARD.encode(export_public_key(&pair)),
            key_exchange_algorithm: algorithm.as_str().to_string(),
            selected_cipher: cipher.as_str().to_string(),
            timestamp: Utc::now(),
            nonce: STANDARD.encode(server_nonce),
        };
        Ok((ctx.id().clone(), response))
    }

    /// A live channel, or `None` if unknown or expired.
    pub async fn get(&self, id: &ChannelId) -> Result<Option<ChannelContext>> {
        Ok(self.store.get(id).await?)
    }

    /// Persist changes to a channel, such as a bound identity.
    pub async fn update(&self, ctx: &ChannelContext) -> Result<()> {
        Ok(self.store.put(ctx).await?)
    }

    pub async fn close(&self, id: &ChannelId) -> Result<bool> {
        let removed = self.store.remove(id).await?;
        if removed {
            tracing::info!(channel = %id, "channel closed");
        }
        Ok(removed)
    }

    pub async fn count(&self) -> Result<usize> {
        Ok(self.store.count().await?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Initiator
// ─────────────────────────────────────────────────────────────────────────────

/// An open request in flight. Holds the ephemeral secret until the
/// responder answers.
pub struct PendingChannel {
    pair: EphemeralKeyPair,
    client_nonce: [u8; HANDSHAKE_NONCE_LEN],
    request: OpenChannelRequest,
}

impl PendingChannel {
    /// Generate a key pair and nonce and build the open request.
    pub fn initiate(config: &ChannelConfig) -> Result<Self> {
        let pair = generate_key_pair(config.key_exchange)?;
        let client_nonce = random_bytes::<HANDSHAKE_NONCE_LEN>();
        let request = OpenChannelRequest {
            protocol_version: config.protocol_version.clone(),
            ephemeral_public_key: STANDARD.encode(export_public_key(&pair)),
            key_exchange_algorithm: config.key_exchange.as_str().to_string(),
            supported_ciphers: config.ciphers.iter().map(|c| c.as_str().to_string()).collect(),
            timestamp: Utc::now(),
            nonce: STANDARD.encode(client_nonce),
        };
        Ok(Self {
            pair,
            client_nonce,
            request,
        })
    }

    pub fn request(&self) -> &OpenChannelRequest {
        &self.request
    }

    /// Check the responder's answer and derive the channel.
    pub fn complete(
        self,
        channel_id: ChannelId,
        response: &OpenChannelResponse,
        config: &ChannelConfig,
    ) -> Result<ChannelContext> {
        if response.protocol_version != self.request.protocol_version {
            return Err(NodeError::Handshake(format!(
                "peer answered with protocol version {}",
                response.protocol_version
            )));
        }
        let algorithm: KeyExchangeAlgorithm = response.key_exchange_algorithm.parse()?;
        if algorithm != self.pair.algorithm() {
            return Err(NodeError::Handshake(format!(
                "peer switched key exchange to {algorithm}"
            )));
        }
        let cipher: Cipher = response.selected_cipher.parse()?;
        if !config.ciphers.contains(&cipher) {
            return Err(NodeError::Handshake(format!("peer selected unoffered cipher {cipher}")));
        }

        let peer_bytes = STANDARD
            .decode(&response.ephemeral_public_key)
            .map_err(|e| irn_core::CoreError::InvalidPublicKey(e.to_string()))?;
        if !validate_public_key(&peer_bytes, algorithm) {
            return Err(irn_core::CoreError::InvalidPublicKey(format!("not a valid {algorithm} public key")).into());
        }
        let peer = import_public_key(&peer_bytes, algorithm)?;
        let server_nonce = STANDARD
            .decode(&response.nonce)
            .map_err(|e| NodeError::Handshake(format!("server nonce: {e}")))?;
        if server_nonce.len() < MIN_NONCE_LEN {
            return Err(NodeError::Handshake("server nonce is too short".into()));
        }

        let key = {
            let shared = derive_shared_secret(&self.pair, &peer)?;
            derive_channel_key(&shared, &self.client_nonce, &server_nonce)?
        };
        Ok(ChannelContext::new(
            channel_id,
            key,
            cipher,
            self.client_nonce.to_vec(),
            server_nonce,
            ChannelRole::Initiator,
            config.ttl,
        ))
    }
}

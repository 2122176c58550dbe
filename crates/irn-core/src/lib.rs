//! # IRN Core
//!
//! Pure primitives for research nodes: key exchange, channel crypto,
//! certificates, and the handshake wire format.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`EphemeralKeyPair`] - One side of an ECDH (P-384, P-256) or X25519 exchange
//! - [`ChannelKey`] - HKDF-derived 256-bit symmetric key, wiped on drop
//! - [`EncryptedEnvelope`] - `{encryptedData, iv, authTag}` AEAD envelope
//! - [`ChannelContext`] - Channel metadata plus key
//! - [`NodeCertificate`] / [`NodeSigner`] - RSA-PKCS1-SHA256 identity
//! - [`SessionData`] - Issued session with its rate-limit window
//!
//! ## Handshake
//!
//! 1. Open channel: exchange ephemeral keys and nonces, derive the key with
//!    HKDF-SHA256 (salt = client nonce ‖ server nonce, info = `IRN-Channel-v1.0`).
//! 2. Identify: sign `channelId + nodeId + timestamp`.
//! 3. Challenge: sign `challenge + channelId + nodeId + timestamp`, receive a session.
//! 4. Invoke: encrypted requests carrying `X-Channel-Id` and `X-Session-Id`.

pub mod aead;
pub mod certificate;
pub mod channel;
pub mod envelope;
pub mod error;
pub mod kdf;
pub mod kex;
pub mod messages;
pub mod node;
pub mod rate_limit;
pub mod session;
pub mod types;

pub use aead::Cipher;
pub use certificate::{fingerprint, NodeCertificate, NodeSigner};
pub use channel::{ChannelContext, ChannelMetadata, DEFAULT_CHANNEL_TTL_SECS};
pub use envelope::{decrypt_payload, encrypt_payload, EncryptedEnvelope};
pub use error::{CoreError, Result};
pub use kdf::{derive_channel_key, derive_key, ChannelKey, CHANNEL_INFO};
pub use kex::{
    derive_shared_secret, export_public_key, generate_key_pair, import_public_key, validate_public_key,
    EphemeralKeyPair, KeyExchangeAlgorithm, PeerPublicKey,
};
pub use messages::{ErrorCode, ErrorEnvelope, HasSessionToken, PROTOCOL_VERSION};
pub use node::{NodeContact, RegisteredNode};
pub use rate_limit::{RateLimitDecision, RateLimitPolicy, SlidingWindow};
pub use session::{SessionContext, SessionData, DEFAULT_SESSION_TTL_SECS};
pub use types::{
    now_millis, signing_timestamp, AccessLevel, AuthorizationStatus, ChannelId, ChannelRole, NodeId, SessionToken,
};

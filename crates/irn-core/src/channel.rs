//! Channel state shared by both ends of a handshake.

use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::aead::Cipher;
use crate::envelope::{self, EncryptedEnvelope};
use crate::error::Result;
use crate::kdf::ChannelKey;
use crate::types::{ChannelId, ChannelRole, NodeId};

/// Default channel lifetime.
pub const DEFAULT_CHANNEL_TTL_SECS: i64 = 30 * 60;

/// Everything about a channel except its key.
///
/// Stores persist this separately from the key so the two can live in
/// distinct key-spaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMetadata {
    pub channel_id: ChannelId,
    pub cipher: Cipher,
    #[serde(with = "b64")]
    pub client_nonce: Vec<u8>,
    #[serde(with = "b64")]
    pub server_nonce: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub role: ChannelRole,
    pub node_id: Option<NodeId>,
    pub certificate_fingerprint: Option<String>,
}

/// An established channel: metadata plus the derived symmetric key.
#[derive(Debug, Clone)]
pub struct ChannelContext {
    pub meta: ChannelMetadata,
    pub key: ChannelKey,
}

impl ChannelContext {
    /// Build a fresh, unidentified channel.
    pub fn new(
        channel_id: ChannelId,
        key: ChannelKey,
        cipher: Cipher,
        client_nonce: Vec<u8>,
        server_nonce: Vec<u8>,
        role: ChannelRole,
        ttl: Duration,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            meta: ChannelMetadata {
                channel_id,
                cipher,
                client_nonce,
                server_nonce,
                created_at,
                expires_at: created_at + ttl,
                role,
                node_id: None,
                certificate_fingerprint: None,
            },
            key,
        }
    }

    /// Reassemble from separately stored parts.
    pub fn from_parts(meta: ChannelMetadata, key: ChannelKey) -> Self {
        Self { meta, key }
    }

    pub fn id(&self) -> &ChannelId {
        &self.meta.channel_id
    }

    pub fn cipher(&self) -> Cipher {
        self.meta.cipher
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.meta.expires_at
    }

    /// The node bound to this channel by a successful identify, if any.
    pub fn identified_node(&self) -> Option<NodeId> {
        self.meta.node_id
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.meta.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Bind the channel to an identified node.
    pub fn bind_identity(&mut self, node_id: NodeId, fingerprint: impl Into<String>) {
        self.meta.node_id = Some(node_id);
        self.meta.certificate_fingerprint = Some(fingerprint.into());
    }

    /// Encrypt a JSON payload for this channel.
    pub fn seal<T: Serialize + ?Sized>(&self, value: &T) -> Result<EncryptedEnvelope> {
        envelope::encrypt_payload(value, &self.key, self.meta.cipher)
    }

    /// Decrypt a JSON payload from this channel.
    pub fn open<T: DeserializeOwned>(&self, env: &EncryptedEnvelope) -> Result<T> {
        envelope::decrypt_payload(env, &self.key, self.meta.cipher)
    }

    /// Encrypt raw bytes.
    pub fn seal_bytes(&self, bytes: &[u8]) -> Result<EncryptedEnvelope> {
        EncryptedEnvelope::seal(bytes, &self.key, self.meta.cipher)
    }

    /// Decrypt raw bytes.
    pub fn open_bytes(&self, env: &EncryptedEnvelope) -> Result<Vec<u8>> {
        env.open(&self.key, self.meta.cipher)
    }
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}

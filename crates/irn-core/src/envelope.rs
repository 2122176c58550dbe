//! The `{encryptedData, iv, authTag}` envelope every channel body travels in.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::aead::{self, Cipher, NONCE_LEN, TAG_LEN};
use crate::error::{CoreError, Result};
use crate::kdf::ChannelKey;

/// An AEAD ciphertext with its nonce and tag, each base64-encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedEnvelope {
    pub encrypted_data: String,
    pub iv: String,
    pub auth_tag: String,
}

impl EncryptedEnvelope {
    /// Encrypt raw bytes.
    pub fn seal(plaintext: &[u8], key: &ChannelKey, cipher: Cipher) -> Result<Self> {
        let sealed = aead::encrypt(cipher, plaintext, key, None)?;
        Ok(Self {
            encrypted_data: STANDARD.encode(&sealed.ciphertext),
            iv: STANDARD.encode(sealed.nonce),
            auth_tag: STANDARD.encode(sealed.tag),
        })
    }

    /// Decrypt to raw bytes.
    pub fn open(&self, key: &ChannelKey, cipher: Cipher) -> Result<Vec<u8>> {
        let ciphertext = decode_field("encryptedData", &self.encrypted_data)?;
        let nonce: [u8; NONCE_LEN] = decode_fixed("iv", &self.iv)?;
        let tag: [u8; TAG_LEN] = decode_fixed("authTag", &self.auth_tag)?;
        aead::decrypt(cipher, &nonce, &ciphertext, &tag, key, None)
    }
}

/// Serialize `value` to JSON and encrypt it.
pub fn encrypt_payload<T: Serialize + ?Sized>(
    value: &T,
    key: &ChannelKey,
    cipher: Cipher,
) -> Result<EncryptedEnvelope> {
    let json = serde_json::to_vec(value).map_err(|e| CoreError::Serialization(e.to_string()))?;
    EncryptedEnvelope::seal(&json, key, cipher)
}

/// Decrypt an envelope and parse the plaintext as `T`.
pub fn decrypt_payload<T: DeserializeOwned>(
    envelope: &EncryptedEnvelope,
    key: &ChannelKey,
    cipher: Cipher,
) -> Result<T> {
    let plaintext = envelope.open(key, cipher)?;
    serde_json::from_slice(&plaintext).map_err(|e| CoreError::Deserialization(e.to_string()))
}

fn decode_field(name: &str, value: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(value)
        .map_err(|e| CoreError::MalformedEnvelope(format!("{name}: {e}")))
}

fn decode_fixed<const N: usize>(name: &str, value: &str) -> Result<[u8; N]> {
    let bytes = decode_field(name, value)?;
    bytes.as_slice().try_into().map_err(|_| {
        CoreError::MalformedEnvelope(format!("{name}: expected {N} bytes, got {}", bytes.len()))
    })
}

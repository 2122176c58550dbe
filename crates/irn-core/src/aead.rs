//! Authenticated encryption for channel payloads.
//!
//! Both supported ciphers use a 96-bit random nonce per message and a detached
//! 128-bit tag, so the wire envelope is identical whichever is negotiated.

use std::fmt;
use std::str::FromStr;

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::kdf::ChannelKey;

/// Nonce length in bytes.
pub const NONCE_LEN: usize = 12;

/// Tag length in bytes.
pub const TAG_LEN: usize = 16;

/// Negotiable AEAD ciphers, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Cipher {
    #[default]
    #[serde(rename = "AES-256-GCM")]
    Aes256Gcm,
    #[serde(rename = "ChaCha20-Poly1305")]
    ChaCha20Poly1305,
}

impl Cipher {
    /// Every cipher this build supports, most preferred first.
    pub const ALL: [Cipher; 2] = [Cipher::Aes256Gcm, Cipher::ChaCha20Poly1305];

    /// Wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Cipher::Aes256Gcm => "AES-256-GCM",
            Cipher::ChaCha20Poly1305 => "ChaCha20-Poly1305",
        }
    }

    /// Pick the first of `preferred` that the peer also offers.
    ///
    /// Names the peer offers that this build does not recognise are ignored.
    pub fn negotiate(preferred: &[Cipher], offered: &[String]) -> Option<Cipher> {
        let offered: Vec<Cipher> = offered.iter().filter_map(|s| s.parse().ok()).collect();
        preferred.iter().copied().find(|c| offered.contains(c))
    }
}

impl fmt::Display for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cipher {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "AES-256-GCM" | "AES256GCM" | "AES-GCM" => Ok(Cipher::Aes256Gcm),
            "CHACHA20-POLY1305" | "CHACHA20POLY1305" => Ok(Cipher::ChaCha20Poly1305),
            _ => Err(CoreError::UnsupportedCipher(s.to_string())),
        }
    }
}

/// Output of a single encryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub nonce: [u8; NONCE_LEN],
    pub ciphertext: Vec<u8>,
    pub tag: [u8; TAG_LEN],
}

/// Generate `N` random bytes from the thread RNG.
pub fn random_bytes<const N: usize>() -> [u8; N] {
    let mut bytes = [0u8; N];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Encrypt `plaintext` under `key` with a fresh random nonce.
pub fn encrypt(
    cipher: Cipher,
    plaintext: &[u8],
    key: &ChannelKey,
    aad: Option<&[u8]>,
) -> Result<Sealed> {
    let nonce = random_bytes::<NONCE_LEN>();
    let mut buffer = plaintext.to_vec();

    let tag = match cipher {
        Cipher::Aes256Gcm => seal_in_place::<Aes256Gcm>(key, &nonce, aad, &mut buffer)?,
        Cipher::ChaCha20Poly1305 => seal_in_place::<ChaCha20Poly1305>(key, &nonce, aad, &mut buffer)?,
    };

    Ok(Sealed {
        nonce,
        ciphertext: buffer,
        tag,
    })
}

/// Decrypt and authenticate.
///
/// A tag mismatch (tampered ciphertext, nonce, tag, AAD or wrong key) returns
/// [`CoreError::AuthenticationFailed`].
pub fn decrypt(
    cipher: Cipher,
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    tag: &[u8; TAG_LEN],
    key: &ChannelKey,
    aad: Option<&[u8]>,
) -> Result<Vec<u8>> {
    let mut buffer = ciphertext.to_vec();
    match cipher {
        Cipher::Aes256Gcm => open_in_place::<Aes256Gcm>(key, nonce, aad, &mut buffer, tag)?,
        Cipher::ChaCha20Poly1305 => open_in_place::<ChaCha20Poly1305>(key, nonce, aad, &mut buffer, tag)?,
    }
    Ok(buffer)
}

fn seal_in_place<C: AeadInPlace + KeyInit>(
    key: &ChannelKey,
    nonce: &[u8; NONCE_LEN],
    aad: Option<&[u8]>,
    buffer: &mut Vec<u8>,
) -> Result<[u8; TAG_LEN]> {
    let aead = C::new_from_slice(key.as_bytes()).map_err(|e| CoreError::Encryption(e.to_string()))?;
    let tag = aead
        .encrypt_in_place_detached(GenericArray::from_slice(nonce), aad.unwrap_or_default(), buffer)
        .map_err(|e| CoreError::Encryption(e.to_string()))?;

    tag.as_slice()
        .try_into()
        .map_err(|_| CoreError::Encryption("unexpected tag length".into()))
}

fn open_in_place<C: AeadInPlace + KeyInit>(
    key: &ChannelKey,
    nonce: &[u8; NONCE_LEN],
    aad: Option<&[u8]>,
    buffer: &mut Vec<u8>,
    tag: &[u8; TAG_LEN],
) -> Result<()> {
    let aead = C::new_from_slice(key.as_bytes()).map_err(|e| CoreError::Encryption(e.to_string()))?;
    aead.decrypt_in_place_detached(
        GenericArray::from_slice(nonce),
        aad.unwrap_or_default(),
        buffer,
        GenericArray::from_slice(tag),
    )
    .map_err(|_| CoreError::AuthenticationFailed)
}

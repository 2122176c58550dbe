//! Ephemeral key exchange.
//!
//! Each handshake generates a fresh key pair on the configured curve. EC public
//! keys travel as SubjectPublicKeyInfo DER so the curve OID is carried with the
//! point; X25519 keys travel as the raw 32 bytes.

use std::fmt;
use std::str::FromStr;

use p256::pkcs8::{DecodePublicKey as _, EncodePublicKey as _};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::{CoreError, Result};

/// Supported key-exchange algorithms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum KeyExchangeAlgorithm {
    /// ECDH over NIST P-256.
    #[serde(rename = "ECDH-P256")]
    EcdhP256,
    /// ECDH over NIST P-384.
    #[default]
    #[serde(rename = "ECDH-P384")]
    EcdhP384,
    /// X25519 Diffie-Hellman.
    #[serde(rename = "X25519")]
    X25519,
}

impl KeyExchangeAlgorithm {
    /// Canonical wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            KeyExchangeAlgorithm::EcdhP256 => "ECDH-P256",
            KeyExchangeAlgorithm::EcdhP384 => "ECDH-P384",
            KeyExchangeAlgorithm::X25519 => "X25519",
        }
    }
}

impl fmt::Display for KeyExchangeAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyExchangeAlgorithm {
    type Err = CoreError;

    /// Accepts the wire name as well as bare curve names (`P384`, `P-384`).
    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "");
        match normalized.as_str() {
            "ECDHP256" | "P256" => Ok(KeyExchangeAlgorithm::EcdhP256),
            "ECDHP384" | "P384" => Ok(KeyExchangeAlgorithm::EcdhP384),
            "X25519" | "ECDHX25519" => Ok(KeyExchangeAlgorithm::X25519),
            _ => Err(CoreError::UnsupportedKeyExchange(s.to_string())),
        }
    }
}

enum Secret {
    P256(p256::ecdh::EphemeralSecret),
    P384(p384::ecdh::EphemeralSecret),
    X25519(x25519_dalek::StaticSecret),
}

/// An ephemeral key pair for one handshake.
pub struct EphemeralKeyPair {
    secret: Secret,
    public: Vec<u8>,
}

impl EphemeralKeyPair {
    /// The algorithm this pair was generated for.
    pub fn algorithm(&self) -> KeyExchangeAlgorithm {
        match self.secret {
            Secret::P256(_) => KeyExchangeAlgorithm::EcdhP256,
            Secret::P384(_) => KeyExchangeAlgorithm::EcdhP384,
            Secret::X25519(_) => KeyExchangeAlgorithm::X25519,
        }
    }

    /// Encoded public key as sent on the wire.
    pub fn public_key_bytes(&self) -> &[u8] {
        &self.public
    }
}

impl fmt::Debug for EphemeralKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralKeyPair")
            .field("algorithm", &self.algorithm())
            .finish_non_exhaustive()
    }
}

/// A peer's imported ephemeral public key.
#[derive(Debug, Clone)]
pub enum PeerPublicKey {
    P256(p256::PublicKey),
    P384(p384::PublicKey),
    X25519(x25519_dalek::PublicKey),
}

impl PeerPublicKey {
    /// The algorithm this key belongs to.
    pub fn algorithm(&self) -> KeyExchangeAlgorithm {
        match self {
            PeerPublicKey::P256(_) => KeyExchangeAlgorithm::EcdhP256,
            PeerPublicKey::P384(_) => KeyExchangeAlgorithm::EcdhP384,
            PeerPublicKey::X25519(_) => KeyExchangeAlgorithm::X25519,
        }
    }
}

/// Generate a fresh key pair on the given curve.
pub fn generate_key_pair(algorithm: KeyExchangeAlgorithm) -> Result<EphemeralKeyPair> {
    let (secret, public) = match algorithm {
        KeyExchangeAlgorithm::EcdhP256 => {
            let secret = p256::ecdh::EphemeralSecret::random(&mut OsRng);
            let public = secret
                .public_key()
                .to_public_key_der()
                .map_err(|e| CoreError::InvalidPublicKey(e.to_string()))?;
            (Secret::P256(secret), public.as_bytes().to_vec())
        }
        KeyExchangeAlgorithm::EcdhP384 => {
            let secret = p384::ecdh::EphemeralSecret::random(&mut OsRng);
            let public = secret
                .public_key()
                .to_public_key_der()
                .map_err(|e| CoreError::InvalidPublicKey(e.to_string()))?;
            (Secret::P384(secret), public.as_bytes().to_vec())
        }
        KeyExchangeAlgorithm::X25519 => {
            let secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
            let public = x25519_dalek::PublicKey::from(&secret);
            (Secret::X25519(secret), public.as_bytes().to_vec())
        }
    };

    Ok(EphemeralKeyPair { secret, public })
}

/// Export the public half of a key pair.
pub fn export_public_key(pair: &EphemeralKeyPair) -> Vec<u8> {
    pair.public.clone()
}

/// Import a peer's public key, checking it belongs to the expected curve.
pub fn import_public_key(bytes: &[u8], algorithm: KeyExchangeAlgorithm) -> Result<PeerPublicKey> {
    match algorithm {
        KeyExchangeAlgorithm::EcdhP256 => p256::PublicKey::from_public_key_der(bytes)
            .map(PeerPublicKey::P256)
            .map_err(|e| CoreError::InvalidPublicKey(e.to_string())),
        KeyExchangeAlgorithm::EcdhP384 => p384::PublicKey::from_public_key_der(bytes)
            .map(PeerPublicKey::P384)
            .map_err(|e| CoreError::InvalidPublicKey(e.to_string())),
        KeyExchangeAlgorithm::X25519 => {
            let raw: [u8; 32] = bytes.try_into().map_err(|_| {
                CoreError::InvalidPublicKey(format!("expected 32 bytes, got {}", bytes.len()))
            })?;
            Ok(PeerPublicKey::X25519(x25519_dalek::PublicKey::from(raw)))
        }
    }
}

/// Check that `bytes` is a well-formed public key on `algorithm`'s curve.
///
/// Never fails: parse errors and curve mismatches both yield `false`.
pub fn validate_public_key(bytes: &[u8], algorithm: KeyExchangeAlgorithm) -> bool {
    match import_public_key(bytes, algorithm) {
        Ok(key) => key.algorithm() == algorithm,
        Err(_) => false,
    }
}

/// Derive the raw shared secret between a local pair and a peer key.
///
/// The returned buffer is wiped when dropped; callers should feed it straight
/// into key derivation and let it go out of scope.
pub fn derive_shared_secret(
    local: &EphemeralKeyPair,
    peer: &PeerPublicKey,
) -> Result<Zeroizing<Vec<u8>>> {
    match (&local.secret, peer) {
        (Secret::P256(secret), PeerPublicKey::P256(pk)) => {
            let shared = secret.diffie_hellman(pk);
            Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
        }
        (Secret::P384(secret), PeerPublicKey::P384(pk)) => {
            let shared = secret.diffie_hellman(pk);
            Ok(Zeroizing::new(shared.raw_secret_bytes().to_vec()))
        }
        (Secret::X25519(secret), PeerPublicKey::X25519(pk)) => {
            let shared = secret.diffie_hellman(pk);
            if !shared.was_contributory() {
                return Err(CoreError::InvalidPublicKey("low-order X25519 point".into()));
            }
            Ok(Zeroizing::new(shared.as_bytes().to_vec()))
        }
        (_, peer) => Err(CoreError::InvalidPublicKey(format!(
            "curve mismatch: local {}, peer {}",
            local.algorithm(),
            peer.algorithm()
        ))),
    }
}

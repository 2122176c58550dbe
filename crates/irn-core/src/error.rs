//! Error types for the IRN core primitives.

use thiserror::Error;

/// Errors raised by the pure primitives in this crate.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The requested key-exchange algorithm is not supported.
    #[error("unsupported key exchange algorithm: {0}")]
    UnsupportedKeyExchange(String),

    /// The requested cipher is not supported.
    #[error("unsupported cipher: {0}")]
    UnsupportedCipher(String),

    /// A peer's ephemeral public key could not be imported.
    #[error("invalid ephemeral public key: {0}")]
    InvalidPublicKey(String),

    /// Key derivation failed (e.g. output length too large).
    #[error("key derivation error: {0}")]
    KeyDerivation(String),

    /// Encryption failed.
    #[error("encryption error: {0}")]
    Encryption(String),

    /// AEAD tag verification failed. This is a security event.
    #[error("authentication tag mismatch")]
    AuthenticationFailed,

    /// An envelope field was not valid base64 or had the wrong length.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),

    /// Decrypted bytes were not valid JSON for the requested type.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Serialization to JSON failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// The certificate could not be decoded or parsed.
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    /// The certificate is outside its validity period.
    #[error("certificate expired or not yet valid")]
    CertificateExpired,

    /// The private key could not be loaded.
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// Signing failed.
    #[error("signing error: {0}")]
    Signing(String),
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

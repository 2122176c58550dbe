//! Node certificates and RSA-PKCS1-SHA256 signatures.
//!
//! A node is identified by the SHA-256 fingerprint of its X.509 certificate's
//! DER encoding. Certificates arrive base64-encoded, either as raw DER or as a
//! PEM document; only RSA keys of at least 2048 bits are accepted.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use ring::rand::SystemRandom;
use ring::signature::{RsaKeyPair, RsaPublicKeyComponents, RSA_PKCS1_2048_8192_SHA256, RSA_PKCS1_SHA256};
use sha2::{Digest, Sha256};
use x509_parser::pem::parse_x509_pem;
use x509_parser::prelude::{FromDer, X509Certificate};
use x509_parser::public_key::PublicKey;

use crate::error::{CoreError, Result};

/// Minimum accepted RSA modulus size.
pub const MIN_RSA_BITS: usize = 2048;

/// Hex-encoded SHA-256 of certificate DER bytes.
pub fn fingerprint(der: &[u8]) -> String {
    hex::encode(Sha256::digest(der))
}

/// A parsed node certificate.
///
/// Holds only owned data extracted at parse time; the DER is kept so the
/// certificate can be re-exported unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeCertificate {
    der: Vec<u8>,
    fingerprint: String,
    common_name: Option<String>,
    not_before: DateTime<Utc>,
    not_after: DateTime<Utc>,
    modulus: Vec<u8>,
    exponent: Vec<u8>,
}

impl NodeCertificate {
    /// Decode a base64 certificate, accepting either DER or PEM content.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = STANDARD
            .decode(compact)
            .map_err(|e| CoreError::InvalidCertificate(format!("not valid base64: {e}")))?;

        if bytes.starts_with(b"-----BEGIN") {
            Self::from_pem(&bytes)
        } else {
            Self::from_der(bytes)
        }
    }

    /// Parse a PEM document.
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let (_, pem) =
            parse_x509_pem(pem).map_err(|e| CoreError::InvalidCertificate(format!("bad PEM: {e}")))?;
        Self::from_der(pem.contents)
    }

    /// Parse DER bytes.
    pub fn from_der(der: Vec<u8>) -> Result<Self> {
        let (common_name, not_before, not_after, modulus, exponent) = {
            let (_, cert) = X509Certificate::from_der(&der)
                .map_err(|e| CoreError::InvalidCertificate(e.to_string()))?;

            let common_name = cert
                .subject()
                .iter_common_name()
                .next()
                .and_then(|cn| cn.as_str().ok())
                .map(str::to_string);

            let validity = cert.validity();
            let not_before = asn1_to_chrono(validity.not_before.timestamp())?;
            let not_after = asn1_to_chrono(validity.not_after.timestamp())?;

            let (modulus, exponent) = match cert.public_key().parsed() {
                Ok(PublicKey::RSA(rsa)) => (strip_leading_zeros(rsa.modulus), strip_leading_zeros(rsa.exponent)),
                Ok(_) => return Err(CoreError::InvalidCertificate("only RSA keys are supported".into())),
                Err(e) => return Err(CoreError::InvalidCertificate(e.to_string())),
            };

            (common_name, not_before, not_after, modulus, exponent)
        };

        let bits = bit_length(&modulus);
        if bits < MIN_RSA_BITS {
            return Err(CoreError::InvalidCertificate(format!(
                "RSA key of {bits} bits is below the {MIN_RSA_BITS}-bit minimum"
            )));
        }

        Ok(Self {
            fingerprint: fingerprint(&der),
            der,
            common_name,
            not_before,
            not_after,
            modulus,
            exponent,
        })
    }

    /// DER encoding.
    pub fn der(&self) -> &[u8] {
        &self.der
    }

    /// Base64 DER encoding, as stored in the registry.
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&self.der)
    }

    /// SHA-256 fingerprint (lowercase hex).
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Subject common name, if present.
    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    pub fn not_before(&self) -> DateTime<Utc> {
        self.not_before
    }

    pub fn not_after(&self) -> DateTime<Utc> {
        self.not_after
    }

    /// RSA modulus size in bits.
    pub fn key_bits(&self) -> usize {
        bit_length(&self.modulus)
    }

    /// Whether `now` falls within the validity period.
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    /// Fail with [`CoreError::CertificateExpired`] outside the validity period.
    pub fn ensure_valid_at(&self, now: DateTime<Utc>) -> Result<()> {
        if self.is_valid_at(now) {
            Ok(())
        } else {
            Err(CoreError::CertificateExpired)
        }
    }

    /// Verify an RSA-PKCS1-SHA256 signature over `message`.
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> bool {
        let key = RsaPublicKeyComponents {
            n: self.modulus.as_slice(),
            e: self.exponent.as_slice(),
        };
        key.verify(&RSA_PKCS1_2048_8192_SHA256, message, signature).is_ok()
    }

    /// Verify a base64-encoded signature. Undecodable input is simply invalid.
    pub fn verify_base64(&self, message: &[u8], signature_b64: &str) -> bool {
        match STANDARD.decode(signature_b64) {
            Ok(signature) => self.verify(message, &signature),
            Err(_) => false,
        }
    }
}

/// Signs handshake messages with a node's RSA private key.
pub struct NodeSigner {
    key_pair: RsaKeyPair,
    rng: SystemRandom,
}

impl NodeSigner {
    /// Load a PKCS#8 DER private key.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self> {
        let key_pair = RsaKeyPair::from_pkcs8(der).map_err(|e| CoreError::InvalidPrivateKey(e.to_string()))?;
        Ok(Self {
            key_pair,
            rng: SystemRandom::new(),
        })
    }

    /// Load a base64 PKCS#8 key, either DER or PEM content.
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
        let bytes = STANDARD
            .decode(compact)
            .map_err(|e| CoreError::InvalidPrivateKey(format!("not valid base64: {e}")))?;
        if bytes.starts_with(b"-----BEGIN") {
            Self::from_pem(&bytes)
        } else {
            Self::from_pkcs8_der(&bytes)
        }
    }

    /// Load a `PRIVATE KEY` PEM document.
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let (_, pem) = parse_x509_pem(pem).map_err(|e| CoreError::InvalidPrivateKey(format!("bad PEM: {e}")))?;
        Self::from_pkcs8_der(&pem.contents)
    }

    /// Sign `message` with RSA-PKCS1-SHA256.
    pub fn sign(&self, message: &[u8]) -> Result<Vec<u8>> {
        let mut signature = vec![0u8; self.key_pair.public().modulus_len()];
        self.key_pair
            .sign(&RSA_PKCS1_SHA256, &self.rng, message, &mut signature)
            .map_err(|e| CoreError::Signing(e.to_string()))?;
        Ok(signature)
    }

    /// Sign and base64-encode.
    pub fn sign_base64(&self, message: &[u8]) -> Result<String> {
        self.sign(message).map(|sig| STANDARD.encode(sig))
    }
}

impl std::fmt::Debug for NodeSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSigner")
            .field("modulus_len", &self.key_pair.public().modulus_len())
            .finish_non_exhaustive()
    }
}

fn asn1_to_chrono(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| CoreError::InvalidCertificate(format!("validity timestamp out of range: {secs}")))
}

fn strip_leading_zeros(bytes: &[u8]) -> Vec<u8> {
    let start = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    bytes[start..].to_vec()
}

fn bit_length(be: &[u8]) -> usize {
    match be.first() {
        Some(first) => (be.len() - 1) * 8 + (8 - first.leading_zeros() as usize),
        None => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const NODE_A_CERT: &str = include_str!("../../irn-testkit/data/node-a.cert.b64");
    const NODE_A_KEY: &str = include_str!("../../irn-testkit/data/node-a.key.b64");
    const NODE_A_EXPIRED: &str = include_str!("../../irn-testkit/data/node-a-expired.cert.b64");
    const NODE_B_CERT: &str = include_str!("../../irn-testkit/data/node-b.cert.b64");

    #[test]
    fn test_parse_fixture_certificate() {
        let cert = NodeCertificate::from_base64(NODE_A_CERT).unwrap();
        assert_eq!(cert.common_name(), Some("node-a"));
        assert_eq!(cert.fingerprint().len(), 64);
        assert_eq!(cert.key_bits(), 2048);
        assert!(cert.is_valid_at(Utc::now()));
    }

    #[test]
    fn test_fingerprint_is_stable_across_encodings() {
        let der = NodeCertificate::from_base64(NODE_A_CERT).unwrap();

        let pem = format!(
            "-----BEGIN CERTIFICATE-----\n{}\n-----END CERTIFICATE-----\n",
            NODE_A_CERT.trim()
        );
        let from_pem = NodeCertificate::from_base64(&STANDARD.encode(pem)).unwrap();

        assert_eq!(der.fingerprint(), from_pem.fingerprint());
        assert_eq!(der.to_base64(), from_pem.to_base64());
    }

    #[test]
    fn test_expired_certificate() {
        let cert = NodeCertificate::from_base64(NODE_A_EXPIRED).unwrap();
        assert!(!cert.is_valid_at(Utc::now()));
        assert!(matches!(cert.ensure_valid_at(Utc::now()), Err(CoreError::CertificateExpired)));

        let in_2020 = Utc.with_ymd_and_hms(2020, 6, 1, 0, 0, 0).unwrap();
        assert!(cert.is_valid_at(in_2020));
    }

    #[test]
    fn test_sign_and_verify() {
        let signer = NodeSigner::from_base64(NODE_A_KEY).unwrap();
        let cert_a = NodeCertificate::from_base64(NODE_A_CERT).unwrap();
        let cert_b = NodeCertificate::from_base64(NODE_B_CERT).unwrap();

        let sig = signer.sign_base64(b"channel-1node-a2025-06-01T00:00:00.000Z").unwrap();
        assert!(cert_a.verify_base64(b"channel-1node-a2025-06-01T00:00:00.000Z", &sig));
        assert!(!cert_a.verify_base64(b"channel-2node-a2025-06-01T00:00:00.000Z", &sig));
        assert!(!cert_b.verify_base64(b"channel-1node-a2025-06-01T00:00:00.000Z", &sig));
        assert!(!cert_a.verify_base64(b"anything", "%%% not base64"));
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(NodeCertificate::from_base64("not base64 at all!").is_err());
        assert!(NodeCertificate::from_base64(&STANDARD.encode(b"hello")).is_err());
        assert!(NodeSigner::from_base64(&STANDARD.encode(b"hello")).is_err());
    }
}

//! HKDF-SHA256 key derivation (RFC 5869).

use std::fmt;

use hkdf::Hkdf;
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::error::{CoreError, Result};

/// HKDF `info` context binding channel keys to this protocol version.
pub const CHANNEL_INFO: &[u8] = b"IRN-Channel-v1.0";

/// Length in bytes of a channel key.
pub const CHANNEL_KEY_LEN: usize = 32;

/// Maximum HKDF-SHA256 output length (255 hash blocks).
pub const MAX_OUTPUT_LEN: usize = 255 * 32;

/// A 256-bit symmetric channel key. Wiped on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct ChannelKey([u8; CHANNEL_KEY_LEN]);

impl ChannelKey {
    /// Wrap raw key bytes.
    pub const fn from_bytes(bytes: [u8; CHANNEL_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Build from a slice, which must be exactly 32 bytes.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let raw: [u8; CHANNEL_KEY_LEN] = bytes.try_into().map_err(|_| {
            CoreError::KeyDerivation(format!(
                "channel key must be {CHANNEL_KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(raw))
    }

    /// Borrow the raw key bytes.
    pub fn as_bytes(&self) -> &[u8; CHANNEL_KEY_LEN] {
        &self.0
    }

    /// True if the key is all zeros (e.g. a wiped or uninitialised slot).
    pub fn is_blank(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }
}

impl fmt::Debug for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ChannelKey(<redacted>)")
    }
}

/// Derive `length` bytes from `secret` with HKDF-SHA256.
///
/// A missing salt is treated as a zero block of hash length, as RFC 5869
/// specifies.
pub fn derive_key(
    secret: &[u8],
    salt: Option<&[u8]>,
    info: &[u8],
    length: usize,
) -> Result<Zeroizing<Vec<u8>>> {
    if length == 0 || length > MAX_OUTPUT_LEN {
        return Err(CoreError::KeyDerivation(format!(
            "output length {length} outside 1..={MAX_OUTPUT_LEN}"
        )));
    }

    let hk = Hkdf::<Sha256>::new(salt, secret);
    let mut okm = Zeroizing::new(vec![0u8; length]);
    hk.expand(info, &mut okm)
        .map_err(|e| CoreError::KeyDerivation(e.to_string()))?;
    Ok(okm)
}

/// Derive the channel key from an ECDH shared secret and both handshake nonces.
///
/// The salt is `client_nonce || server_nonce`, so both parties' randomness
/// contributes to the key.
pub fn derive_channel_key(
    shared_secret: &[u8],
    client_nonce: &[u8],
    server_nonce: &[u8],
) -> Result<ChannelKey> {
    let mut salt = Zeroizing::new(Vec::with_capacity(client_nonce.len() + server_nonce.len()));
    salt.extend_from_slice(client_nonce);
    salt.extend_from_slice(server_nonce);

    let okm = derive_key(shared_secret, Some(&salt), CHANNEL_INFO, CHANNEL_KEY_LEN)?;
    ChannelKey::from_slice(&okm)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_rfc5869_case_1() {
        let ikm = [0x0bu8; 22];
        let salt: Vec<u8> = (0x00u8..=0x0c).collect();
        let info: Vec<u8> = (0xf0u8..=0xf9).collect();

        let okm = derive_key(&ikm, Some(&salt), &info, 42).unwrap();
        assert_eq!(
            hex::encode(&*okm),
            "3cb25f25faacd57a90434f64d0362f2a2d2d0a90cf1a5a4c5db02d56ecc4c5bf34007208d5b887185865"
        );
    }

    #[test]
    fn test_rejects_bad_lengths() {
        assert!(derive_key(b"secret", None, CHANNEL_INFO, 0).is_err());
        assert!(derive_key(b"secret", None, CHANNEL_INFO, MAX_OUTPUT_LEN + 1).is_err());
        assert_eq!(derive_key(b"secret", None, CHANNEL_INFO, MAX_OUTPUT_LEN).unwrap().len(), MAX_OUTPUT_LEN);
    }

    #[test]
    fn test_nonce_order_matters() {
        let a = derive_channel_key(b"shared", b"client", b"server").unwrap();
        let b = derive_channel_key(b"shared", b"server", b"client").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_debug_is_redacted() {
        let key = ChannelKey::from_bytes([7u8; 32]);
        assert_eq!(format!("{key:?}"), "ChannelKey(<redacted>)");
        assert!(!key.is_blank());
        assert!(ChannelKey::from_bytes([0u8; 32]).is_blank());
    }

    proptest! {
        #[test]
        fn prop_hkdf_deterministic(
            secret in prop::collection::vec(any::<u8>(), 1..64),
            salt in prop::collection::vec(any::<u8>(), 0..64),
            len in 1usize..128,
        ) {
            let a = derive_key(&secret, Some(&salt), CHANNEL_INFO, len).unwrap();
            let b = derive_key(&secret, Some(&salt), CHANNEL_INFO, len).unwrap();
            prop_assert_eq!(&*a, &*b);
            prop_assert_eq!(a.len(), len);
        }

        #[test]
        fn prop_hkdf_salt_separates(
            secret in prop::collection::vec(any::<u8>(), 1..64),
            salt_a in prop::collection::vec(any::<u8>(), 32),
            salt_b in prop::collection::vec(any::<u8>(), 32),
        ) {
            prop_assume!(salt_a != salt_b);
            let a = derive_key(&secret, Some(&salt_a), CHANNEL_INFO, 32).unwrap();
            let b = derive_key(&secret, Some(&salt_b), CHANNEL_INFO, 32).unwrap();
            prop_assert_ne!(&*a, &*b);
        }
    }
}

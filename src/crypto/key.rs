//! Tunnel key derived once from the configured pre-shared key

use super::{CryptoError, Hkdf, KEY_LEN};
use std::fmt;

const KEY_SALT: &[u8] = b"vtun-psk-salt-v1";
const KEY_INFO: &[u8] = b"vtun packet key";

/// Secret material derived from `Config::key`.
///
/// Produced at init and shared read-only (behind an `Arc`) with every
/// strategy through its `TunnelContext`.
#[derive(Clone, PartialEq, Eq)]
pub struct DerivedKey([u8; KEY_LEN]);

impl DerivedKey {
    /// Derive from the pre-shared key string
    pub fn derive(psk: &str) -> Result<Self, CryptoError> {
        if psk.is_empty() {
            return Err(CryptoError::EmptyKey);
        }

        let hkdf = Hkdf::new(Some(KEY_SALT), psk.as_bytes());
        Ok(Self(hkdf.expand_key(KEY_INFO)?))
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for DerivedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DerivedKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_is_deterministic() {
        let a = DerivedKey::derive("freedom@2023").unwrap();
        let b = DerivedKey::derive("freedom@2023").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, DerivedKey::derive("freedom@2024").unwrap());
    }

    #[test]
    fn test_empty_key_rejected() {
        assert!(matches!(DerivedKey::derive(""), Err(CryptoError::EmptyKey)));
    }

    #[test]
    fn test_debug_hides_material() {
        let key = DerivedKey::derive("secret").unwrap();
        assert_eq!(format!("{:?}", key), "DerivedKey(..)");
    }
}

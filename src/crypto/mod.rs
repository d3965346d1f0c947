//! Cryptographic primitives
//!
//! This module provides:
//! - HKDF-SHA256 derivation of the tunnel key from the pre-shared key
//! - ChaCha20-Poly1305 sealing of tunnel packets
//! - Secure random number generation

mod aead;
mod kdf;
mod key;

pub use aead::{Cipher, SEAL_OVERHEAD};
pub use kdf::Hkdf;
pub use key::DerivedKey;

use thiserror::Error;

/// Length of symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Pre-shared key is empty")]
    EmptyKey,

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Random generation failed")]
    Random,
}

/// Fill `buf` with cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) -> Result<(), CryptoError> {
    use ring::rand::{SecureRandom, SystemRandom};
    SystemRandom::new().fill(buf).map_err(|_| CryptoError::Random)
}

/// Generate a random nonce
pub fn generate_nonce() -> Result<[u8; NONCE_LEN], CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    random_bytes(&mut nonce)?;
    Ok(nonce)
}

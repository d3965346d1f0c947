//! ChaCha20-Poly1305 sealing of tunnel packets
//!
//! Sealed layout: `nonce (12B) || ciphertext || tag (16B)`. Nonces are
//! random per packet, so a `Cipher` can be shared between the upstream and
//! downstream halves of a tunnel without coordination.

use super::{generate_nonce, CryptoError, DerivedKey, KEY_LEN, NONCE_LEN, TAG_LEN};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, CHACHA20_POLY1305};

/// Bytes added to every sealed packet
pub const SEAL_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// AEAD cipher for tunnel packets
pub struct Cipher {
    key: LessSafeKey,
}

impl Cipher {
    /// Create a new cipher from a 32-byte key
    ///
    /// # Arguments
    /// * `key` - Raw ChaCha20-Poly1305 key
    pub fn new(key: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
        let unbound_key =
            UnboundKey::new(&CHACHA20_POLY1305, key).map_err(|_| CryptoError::InvalidKeyLength)?;

        Ok(Self {
            key: LessSafeKey::new(unbound_key),
        })
    }

    /// Create a cipher keyed by the derived tunnel key
    pub fn from_key(key: &DerivedKey) -> Result<Self, CryptoError> {
        Self::new(key.as_bytes())
    }

    /// Encrypt a packet under a fresh random nonce
    ///
    /// # Arguments
    /// * `plaintext` - Packet to seal
    ///
    /// # Returns
    /// `nonce || ciphertext || tag`, [`SEAL_OVERHEAD`] bytes longer than the input
    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = generate_nonce()?;

        let mut body = plaintext.to_vec();
        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(nonce),
                Aad::empty(),
                &mut body,
            )
            .map_err(|_| CryptoError::Encryption("seal failed".to_string()))?;

        let mut sealed = Vec::with_capacity(SEAL_OVERHEAD + plaintext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&body);
        Ok(sealed)
    }

    /// Decrypt a sealed packet, verifying the auth tag
    ///
    /// # Arguments
    /// * `sealed` - Output of [`Cipher::seal`]
    ///
    /// # Returns
    /// The plaintext, or `Decryption` if the packet is short or was tampered with
    pub fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < SEAL_OVERHEAD {
            return Err(CryptoError::Decryption("packet too short".to_string()));
        }

        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&sealed[..NONCE_LEN]);
        let mut buffer = sealed[NONCE_LEN..].to_vec();

        let plaintext = self
            .key
            .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut buffer)
            .map_err(|_| CryptoError::Decryption("open failed".to_string()))?;

        Ok(plaintext.to_vec())
    }
}

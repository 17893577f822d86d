//! AEAD sealing with explicit nonces
//!
//! Both the handshake's hidden block and the obfuscated session frames carry
//! their nonce on the wire, so the cipher here keeps no counter state.

use super::{CryptoError, KEY_LEN, NONCE_LEN, TAG_LEN};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, CHACHA20_POLY1305};

/// Supported AEAD algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AeadAlgorithm {
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl AeadAlgorithm {
    fn ring_algorithm(self) -> &'static ring::aead::Algorithm {
        match self {
            AeadAlgorithm::Aes256Gcm => &AES_256_GCM,
            AeadAlgorithm::ChaCha20Poly1305 => &CHACHA20_POLY1305,
        }
    }
}

/// AEAD cipher bound to one key
pub struct AeadCipher {
    key: LessSafeKey,
}

impl AeadCipher {
    /// Create a new cipher from a 32-byte key
    pub fn new(algorithm: AeadAlgorithm, key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_LEN {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_LEN,
                actual: key.len(),
            });
        }
        let unbound = UnboundKey::new(algorithm.ring_algorithm(), key).map_err(|_| {
            CryptoError::InvalidKeyLength {
                expected: KEY_LEN,
                actual: key.len(),
            }
        })?;

        Ok(Self {
            key: LessSafeKey::new(unbound),
        })
    }

    /// Seal `plaintext`, returning ciphertext with the tag appended
    pub fn seal(
        &self,
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let mut buffer = Vec::with_capacity(plaintext.len() + TAG_LEN);
        buffer.extend_from_slice(plaintext);

        self.key
            .seal_in_place_append_tag(
                Nonce::assume_unique_for_key(*nonce),
                Aad::from(aad),
                &mut buffer,
            )
            .map_err(|_| CryptoError::Encryption("seal failed".to_string()))?;

        Ok(buffer)
    }

    /// Open `ciphertext` (tag included), verifying it
    pub fn open(
        &self,
        nonce: &[u8; NONCE_LEN],
        aad: &[u8],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if ciphertext.len() < TAG_LEN {
            return Err(CryptoError::Decryption("ciphertext shorter than tag".to_string()));
        }
        let mut buffer = ciphertext.to_vec();

        let plaintext_len = self
            .key
            .open_in_place(Nonce::assume_unique_for_key(*nonce), Aad::from(aad), &mut buffer)
            .map_err(|_| CryptoError::Decryption("open failed".to_string()))?
            .len();

        buffer.truncate(plaintext_len);
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_both_algorithms() {
        let key = [0x42u8; KEY_LEN];
        let nonce = [7u8; NONCE_LEN];

        for algorithm in [AeadAlgorithm::Aes256Gcm, AeadAlgorithm::ChaCha20Poly1305] {
            let cipher = AeadCipher::new(algorithm, &key).unwrap();
            let sealed = cipher.seal(&nonce, b"aad", b"Hello, World!").unwrap();
            assert_eq!(sealed.len(), 13 + TAG_LEN);

            let opened = cipher.open(&nonce, b"aad", &sealed).unwrap();
            assert_eq!(opened, b"Hello, World!");
        }
    }

    #[test]
    fn test_tamper_detection() {
        let cipher = AeadCipher::new(AeadAlgorithm::ChaCha20Poly1305, &[1u8; KEY_LEN]).unwrap();
        let nonce = [0u8; NONCE_LEN];
        let mut sealed = cipher.seal(&nonce, &[], b"payload").unwrap();

        sealed[0] ^= 0xFF;
        assert!(cipher.open(&nonce, &[], &sealed).is_err());
    }

    #[test]
    fn test_rejects_short_key() {
        assert!(matches!(
            AeadCipher::new(AeadAlgorithm::Aes256Gcm, &[0u8; 16]),
            Err(CryptoError::InvalidKeyLength { expected: 32, actual: 16 })
        ));
    }
}

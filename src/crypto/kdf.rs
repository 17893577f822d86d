//! Key Derivation Functions
//!
//! HKDF-SHA256 over ring, used to turn the raw X25519 agreement into the
//! key that seals the handshake's hidden data.

use super::{CryptoError, KEY_LEN};
use ring::hkdf::{self, Salt, HKDF_SHA256};

/// Context label for the handshake sealing key
const SHARED_KEY_INFO: &[u8] = b"shroud handshake v1";

/// HKDF-SHA256 key derivation
pub struct Hkdf {
    prk: hkdf::Prk,
}

impl Hkdf {
    /// Extract a PRK from input keying material
    ///
    /// A missing salt is treated as 32 zero bytes.
    pub fn new(salt: Option<&[u8]>, ikm: &[u8]) -> Self {
        let salt = Salt::new(HKDF_SHA256, salt.unwrap_or(&[0u8; 32]));
        Self {
            prk: salt.extract(ikm),
        }
    }

    /// Expand the PRK into `output`
    pub fn expand(&self, info: &[u8], output: &mut [u8]) -> Result<(), CryptoError> {
        let info_refs = [info];
        self.prk
            .expand(&info_refs, OutputLen(output.len()))
            .map_err(|_| CryptoError::KeyGeneration("HKDF expand failed".to_string()))?
            .fill(output)
            .map_err(|_| CryptoError::KeyGeneration("HKDF fill failed".to_string()))
    }

    /// Derive a 32-byte key
    pub fn expand_key(&self, info: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
        let mut key = [0u8; KEY_LEN];
        self.expand(info, &mut key)?;
        Ok(key)
    }
}

struct OutputLen(usize);

impl hkdf::KeyType for OutputLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// Derive the handshake sealing key from a raw X25519 shared secret
pub fn derive_shared_key(agreement: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
    Hkdf::new(None, agreement).expand_key(SHARED_KEY_INFO)
}

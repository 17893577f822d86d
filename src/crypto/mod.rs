//! Cryptographic primitives for Shroud
//!
//! This module provides:
//! - X25519 ephemeral agreement for the disguised handshake
//! - AES-256-GCM and ChaCha20-Poly1305 AEAD sealing
//! - HKDF-SHA256 key derivation
//! - Secure random number generation

mod aead;
mod kdf;
mod keys;

pub use aead::{AeadAlgorithm, AeadCipher};
pub use kdf::{derive_shared_key, Hkdf};
pub use keys::{EphemeralKeyPair, PublicKey, SessionKey};

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
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Key agreement failed")]
    Agreement,

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid key encoding: {0}")]
    InvalidEncoding(String),

    #[error("System random source unavailable")]
    Random,
}

/// Fill `buf` with cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) -> Result<(), CryptoError> {
    use ring::rand::{SecureRandom, SystemRandom};
    SystemRandom::new()
        .fill(buf)
        .map_err(|_| CryptoError::Random)
}

/// Draw a random 32-bit value
pub fn random_u32() -> Result<u32, CryptoError> {
    let mut quad = [0u8; 4];
    random_bytes(&mut quad)?;
    Ok(u32::from_be_bytes(quad))
}

/// Generate a random AEAD nonce
pub fn generate_nonce() -> Result<[u8; NONCE_LEN], CryptoError> {
    let mut nonce = [0u8; NONCE_LEN];
    random_bytes(&mut nonce)?;
    Ok(nonce)
}

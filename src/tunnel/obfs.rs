//! Frame obfuscation
//!
//! Turns frames into record bodies and back. With `plain` the body is the
//! encoded frame as is. The AEAD methods prepend a random 12-byte nonce to
//! the sealed frame:
//!
//! ```text
//! nonce (12B) | seal(stream_id | seq | closing | payload) | tag (16B)
//! ```

use super::{Frame, TunnelError};
use crate::crypto::{generate_nonce, AeadAlgorithm, AeadCipher, CryptoError, SessionKey, NONCE_LEN};
use bytes::{Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How frames are protected on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EncryptionMethod {
    #[serde(rename = "plain")]
    Plain,
    #[serde(rename = "aes-gcm", alias = "aes-256-gcm")]
    AesGcm,
    #[default]
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
}

impl EncryptionMethod {
    /// Identifier sent to the relay during the handshake
    pub fn id(self) -> u8 {
        match self {
            EncryptionMethod::Plain => 0,
            EncryptionMethod::AesGcm => 1,
            EncryptionMethod::ChaCha20Poly1305 => 2,
        }
    }

    /// Inverse of [`EncryptionMethod::id`]
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            0 => Some(EncryptionMethod::Plain),
            1 => Some(EncryptionMethod::AesGcm),
            2 => Some(EncryptionMethod::ChaCha20Poly1305),
            _ => None,
        }
    }

    fn algorithm(self) -> Option<AeadAlgorithm> {
        match self {
            EncryptionMethod::Plain => None,
            EncryptionMethod::AesGcm => Some(AeadAlgorithm::Aes256Gcm),
            EncryptionMethod::ChaCha20Poly1305 => Some(AeadAlgorithm::ChaCha20Poly1305),
        }
    }
}

impl fmt::Display for EncryptionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EncryptionMethod::Plain => "plain",
            EncryptionMethod::AesGcm => "aes-gcm",
            EncryptionMethod::ChaCha20Poly1305 => "chacha20-poly1305",
        };
        f.write_str(name)
    }
}

impl FromStr for EncryptionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plain" => Ok(EncryptionMethod::Plain),
            "aes-gcm" | "aes-256-gcm" => Ok(EncryptionMethod::AesGcm),
            "chacha20-poly1305" => Ok(EncryptionMethod::ChaCha20Poly1305),
            other => Err(format!("unknown encryption method: {}", other)),
        }
    }
}

/// Converts frames to and from record bodies for one session
pub struct Obfuscator {
    method: EncryptionMethod,
    cipher: Option<AeadCipher>,
}

impl Obfuscator {
    /// Build an obfuscator for `method` keyed with the session key
    pub fn new(method: EncryptionMethod, key: &SessionKey) -> Result<Self, CryptoError> {
        let cipher = match method.algorithm() {
            Some(algorithm) => Some(AeadCipher::new(algorithm, key.as_bytes())?),
            None => None,
        };
        Ok(Self { method, cipher })
    }

    pub fn method(&self) -> EncryptionMethod {
        self.method
    }

    /// Frame to record body
    pub fn obfuscate(&self, frame: &Frame) -> Result<BytesMut, TunnelError> {
        let plaintext = frame.encode();
        let Some(cipher) = &self.cipher else {
            return Ok(plaintext);
        };

        let nonce = generate_nonce()?;
        let sealed = cipher.seal(&nonce, &[], &plaintext)?;

        let mut body = BytesMut::with_capacity(NONCE_LEN + sealed.len());
        body.extend_from_slice(&nonce);
        body.extend_from_slice(&sealed);
        Ok(body)
    }

    /// Record body to frame
    pub fn deobfuscate(&self, body: &[u8]) -> Result<Frame, TunnelError> {
        let Some(cipher) = &self.cipher else {
            return Frame::decode(Bytes::copy_from_slice(body));
        };

        if body.len() < NONCE_LEN {
            return Err(TunnelError::InvalidFrame(format!(
                "Sealed body too short: {} bytes",
                body.len()
            )));
        }
        let (nonce, sealed) = body.split_at(NONCE_LEN);
        let mut nonce_arr = [0u8; NONCE_LEN];
        nonce_arr.copy_from_slice(nonce);

        let plaintext = cipher.open(&nonce_arr, &[], sealed)?;
        Frame::decode(Bytes::from(plaintext))
    }
}

impl fmt::Debug for Obfuscator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Obfuscator")
            .field("method", &self.method)
            .finish_non_exhaustive()
    }
}

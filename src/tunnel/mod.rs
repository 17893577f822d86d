//! Tunnel layer - multiplexed session over disguised connections
//!
//! Provides:
//! - Frame encoding/decoding
//! - Frame obfuscation (plain, AES-256-GCM, ChaCha20-Poly1305)
//! - Sessions that spread frames over a connection pool
//! - Streams with in-order delivery

mod frame;
mod obfs;
mod session;
mod stream;

pub use frame::{Closing, Frame, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use obfs::{EncryptionMethod, Obfuscator};
pub use session::{Session, SessionConfig};
pub use stream::Stream;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Session closed")]
    SessionClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crate::crypto::CryptoError),
}

/// What the lifecycle manager needs from a session
#[async_trait]
pub trait SessionHandle: Send + Sync + 'static {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a new logical stream
    async fn open_stream(&self) -> Result<Self::Stream, TunnelError>;

    /// A closed session must be replaced
    fn is_closed(&self) -> bool;

    /// Tear the session down
    async fn close(&self);
}

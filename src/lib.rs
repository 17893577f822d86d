//! # Shroud
//!
//! Client side of a censorship-resistant transport. Local proxy traffic is
//! multiplexed into a session spread over several TCP connections to a
//! relay, and every connection opens with a handshake indistinguishable
//! from Firefox 99 talking TLS 1.3 to an ordinary web server.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                     Proxy Layer                      │
//! │      (accept loop, single-flight session, relay)     │
//! ├─────────────────────────────────────────────────────┤
//! │                   Bootstrap Layer                    │
//! │     (N concurrent lanes, retry, canonical key)       │
//! ├─────────────────────────────────────────────────────┤
//! │                    Tunnel Layer                      │
//! │       (frames, obfuscation, streams, sessions)       │
//! ├─────────────────────────────────────────────────────┤
//! │          Handshake + Obfuscation Layers              │
//! │   (key exchange hidden in a forged ClientHello)      │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │             (TCP, TLS record framing)                │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod bootstrap;
pub mod config;
pub mod crypto;
pub mod handshake;
pub mod obfuscation;
pub mod proxy;
pub mod transport;
pub mod tunnel;

pub use config::ClientConfig;

/// Protocol version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Fingerprint error: {0}")]
    Fingerprint(#[from] obfuscation::FingerprintError),

    #[error("Handshake error: {0}")]
    Handshake(#[from] handshake::HandshakeError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Bootstrap error: {0}")]
    Bootstrap(#[from] bootstrap::BootstrapError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

//! Transport layer
//!
//! Provides the connection plumbing under the disguised tunnel:
//! - `Dialer` seam for opening connections to the relay
//! - TCP dialer with connect timeout
//! - TLS record framing for the disguised byte stream

pub mod record;
mod tcp;

pub use record::{add_record_layer, read_record, write_record, ContentType, RECORD_HEADER_LEN};
pub use tcp::TcpDialer;

use async_trait::async_trait;
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Record too large: {0} bytes")]
    RecordTooLarge(usize),

    #[error("Connection closed")]
    Closed,

    #[error("Timeout")]
    Timeout,
}

/// A byte stream to the relay
///
/// Anything tokio can read and write from a spawned task qualifies: a TCP
/// socket in production, an in-memory duplex pipe in tests.
pub trait Connection: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> Connection for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// Opens new connections to the relay
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    type Conn: Connection;

    /// Dial `addr` (`host:port`)
    async fn dial(&self, addr: &str) -> Result<Self::Conn, TransportError>;
}

/// Join host and port, bracketing IPv6 literals
pub fn format_addr(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_addr() {
        assert_eq!(format_addr("example.com", 443), "example.com:443");
        assert_eq!(format_addr("127.0.0.1", 1984), "127.0.0.1:1984");
        assert_eq!(format_addr("::1", 443), "[::1]:443");
        assert_eq!(format_addr("[::1]", 443), "[::1]:443");
    }
}

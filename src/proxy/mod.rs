//! Local proxy front end
//!
//! Provides:
//! - Accept loop for local proxy clients
//! - Single-flight session management
//! - Stream relaying

mod manager;

pub use manager::{SessionManager, INITIAL_READ_BUF};

use crate::bootstrap::BootstrapError;
use crate::tunnel::TunnelError;
use thiserror::Error;

/// Proxy errors
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Session unavailable: {0}")]
    Bootstrap(#[from] BootstrapError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),
}

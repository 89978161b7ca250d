//! Transport layer implementations
//!
//! Provides:
//! - The `Reusable` capability carried by pooled connections
//! - Pluggable dialers: raw TCP and TLS 1.3
//! - A connection pool that recycles connections certified clean by the
//!   close handshake

mod pool;
mod tcp;

#[cfg(feature = "tls")]
mod tls;

pub use pool::{ConnectionPool, PoolConfig, PooledConnection};
pub use tcp::TcpDialer;

#[cfg(feature = "tls")]
pub use tls::{load_certs, load_private_key, TlsDialer};

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

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Timeout")]
    Timeout,
}

/// Capability of a transport connection that may be recycled
///
/// Once marked unusable a connection stays unusable; the pool discards it
/// on release instead of keeping it idle.
pub trait Reusable {
    /// Flag the connection as unfit for another session
    fn mark_unusable(&self);

    /// Whether the connection was flagged
    fn is_unusable(&self) -> bool;
}

/// Opens new transport connections to the relay server
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Connection type produced by this dialer
    type Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Open a fresh connection
    async fn dial(&self) -> Result<Self::Conn, TransportError>;

    /// Remote address, for logging
    fn remote(&self) -> &str;
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Connection timeout in seconds
    pub connect_timeout: u64,
    /// Disable Nagle's algorithm
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: 10,
            nodelay: true,
        }
    }
}

//! # Mirage Tunnel
//!
//! A traffic-obfuscating proxy whose encrypted transport connections are
//! pooled and reused across many proxied sessions.
//!
//! ## Features
//!
//! - **AEAD encryption** with AES-256-GCM or ChaCha20-Poly1305, keys
//!   stretched from a shared password
//! - **Length obfuscation**: sealed frame headers and random padding of
//!   short payloads
//! - **Connection reuse** certified by a FIN/ACK close handshake
//! - **TLS transport** (optional) and **SOCKS5 / HTTP CONNECT** front-ends
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Application Layer                   │
//! │              (SOCKS5, HTTP CONNECT proxy)            │
//! ├─────────────────────────────────────────────────────┤
//! │                   Session Layer                      │
//! │      (address header, relay engine, close handshake) │
//! ├─────────────────────────────────────────────────────┤
//! │                   Tunnel Layer                       │
//! │        (AEAD, sealed frame headers, padding)         │
//! ├─────────────────────────────────────────────────────┤
//! │                  Transport Layer                     │
//! │           (TCP or TLS, pooled connections)           │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod config;
pub mod crypto;
pub mod logging;
pub mod protocol;
pub mod proxy;
pub mod session;
pub mod transport;
pub mod tunnel;

pub use config::Config;

/// Crate version
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

    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] tunnel::TunnelError),

    #[error("Session error: {0}")]
    Session(#[from] session::SessionError),

    #[error("Proxy error: {0}")]
    Proxy(#[from] proxy::ProxyError),

    #[error("Configuration error: {0}")]
    Config(String),
}

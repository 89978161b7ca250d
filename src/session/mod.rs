//! Session drivers
//!
//! A logical session is one proxied TCP connection carried over a pooled
//! transport connection. Its first data frame holds the encoded target
//! [`Address`](crate::protocol::Address); its flags name the session
//! protocol. After that the relay engine owns the stream until the close
//! handshake decides whether the transport may carry the next session.

mod client;
mod server;

pub use client::client_session;
pub use server::serve_connection;

use crate::protocol::ProtocolError;
use crate::transport::TransportError;
use crate::tunnel::{Flags, TunnelError};
use thiserror::Error;

/// Session errors
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Tunnel error: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Extract the single protocol flag of a session's first frame
pub fn session_protocol(flags: Flags) -> Result<Flags, ProtocolError> {
    let protocols = [Flags::TCP, Flags::UDP, Flags::ICMP];
    let mut set = protocols.iter().copied().filter(|p| flags.contains(*p));

    match (set.next(), set.next()) {
        (Some(protocol), None) => Ok(protocol),
        _ => Err(ProtocolError::UnsupportedProtocol(flags.bits())),
    }
}

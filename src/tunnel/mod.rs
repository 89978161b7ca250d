//! Tunnel layer - encrypted session framing
//!
//! Provides:
//! - Frame encoding/decoding with traffic-shape padding
//! - The cipher stream adapter over one transport connection
//! - The FIN/ACK close handshake that certifies a connection for reuse
//! - The bidirectional relay engine

mod close;
mod frame;
mod relay;
mod stream;

pub use close::{transition, CloseAction, CloseEvent, CloseHandshake, CloseState};
pub use frame::{
    decode_body, decode_header, sealed_body_len, sealed_header_len, Flags, Frame, FrameHeader,
    FrameType, FRAME_HEADER_SIZE, MAX_DECLARED_LENGTH, MAX_PADDING, MAX_PAYLOAD_SIZE,
    MIN_PADDING, PADDING_THRESHOLD,
};
pub use relay::{relay, relay_with_timeout, RelayOutcome};
pub use stream::{CipherReader, CipherStream, CipherWriter};

use crate::crypto::CryptoError;
use std::io;
use thiserror::Error;

/// Tunnel layer errors
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Frame too large: {0} > {1}")]
    FrameTooLarge(usize, usize),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Authentication failed")]
    AuthenticationFailed,

    #[error("Malformed ciphertext: {0} bytes")]
    MalformedCiphertext(usize),

    #[error("Unexpected frame: {0}")]
    UnexpectedFrame(String),

    #[error("Invalid payload size: {0}")]
    PayloadSizeInvalid(usize),

    #[error("FIN received")]
    FinReceived,

    #[error("ACK received")]
    AckReceived,

    #[error("Encryption failed: {0}")]
    Encrypt(CryptoError),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl TunnelError {
    /// Close-handshake signals surfaced through the error channel
    pub fn is_signal(&self) -> bool {
        matches!(self, TunnelError::FinReceived | TunnelError::AckReceived)
    }

    /// Failures of the AEAD layer on received data
    pub fn is_crypto(&self) -> bool {
        matches!(
            self,
            TunnelError::AuthenticationFailed | TunnelError::MalformedCiphertext(_)
        )
    }

    /// Recover a tunnel error that travelled through `std::io::Error`
    pub fn from_io(err: io::Error) -> Self {
        let wrapped = err
            .get_ref()
            .map_or(false, |inner| inner.is::<TunnelError>());
        if !wrapped {
            return TunnelError::Io(err);
        }

        let kind = err.kind();
        match err.into_inner().map(|inner| inner.downcast::<TunnelError>()) {
            Some(Ok(tunnel)) => *tunnel,
            Some(Err(other)) => TunnelError::Io(io::Error::new(kind, other)),
            None => TunnelError::Io(io::Error::from(kind)),
        }
    }
}

impl From<CryptoError> for TunnelError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::AuthenticationFailed => TunnelError::AuthenticationFailed,
            CryptoError::MalformedCiphertext(len) => TunnelError::MalformedCiphertext(len),
            other => TunnelError::Encrypt(other),
        }
    }
}

impl From<TunnelError> for io::Error {
    fn from(err: TunnelError) -> Self {
        match err {
            TunnelError::Io(e) => e,
            other => io::Error::other(other),
        }
    }
}

//! Bidirectional relay between a plaintext stream and a cipher stream
//!
//! Two copy loops run concurrently inside one task. The first loop to stop
//! decides how the session ends. A plaintext EOF or read error starts the
//! close handshake as initiator and a peer FIN starts it as responder. Any
//! other stop on the cipher -> plaintext path skips the handshake and
//! condemns the transport, as does any failure of the cipher stream.

use super::close::CloseHandshake;
use super::stream::{CipherReader, CipherStream, CipherWriter};
use super::TunnelError;
use crate::protocol::{CLOSE_HANDSHAKE_TIMEOUT, RELAY_BUFFER_SIZE};
use crate::transport::Reusable;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Result of one relayed session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelayOutcome {
    /// Plaintext bytes sent into the cipher stream
    pub to_cipher: u64,
    /// Plaintext bytes delivered out of the cipher stream
    pub to_plain: u64,
    /// The transport connection must be discarded rather than pooled
    pub must_close: bool,
}

/// How the plaintext -> cipher loop stopped
enum Upstream {
    Eof,
    PlainError(io::Error),
    CipherError(TunnelError),
}

/// How the cipher -> plaintext loop stopped
enum Downstream {
    Fin,
    TransportClosed,
    CipherError(TunnelError),
    PlainError(io::Error),
}

enum Finished {
    Up(Upstream),
    Down(Downstream),
}

/// Relay one session with the default close handshake window
pub async fn relay<T, P>(stream: &mut CipherStream<T>, plain: P) -> RelayOutcome
where
    T: AsyncRead + AsyncWrite + Unpin,
    P: AsyncRead + AsyncWrite + Unpin,
{
    relay_with_timeout(stream, plain, CLOSE_HANDSHAKE_TIMEOUT).await
}

/// Relay one session, bounding the close handshake by `close_timeout`
///
/// The plaintext stream is shut down before the handshake starts. The
/// cipher stream is marked unusable whenever the session did not end with
/// a completed handshake.
pub async fn relay_with_timeout<T, P>(
    stream: &mut CipherStream<T>,
    plain: P,
    close_timeout: Duration,
) -> RelayOutcome
where
    T: AsyncRead + AsyncWrite + Unpin,
    P: AsyncRead + AsyncWrite + Unpin,
{
    let (mut plain_r, mut plain_w) = tokio::io::split(plain);
    let mut to_cipher = 0u64;
    let mut to_plain = 0u64;

    let finished = {
        let (reader, writer) = stream.halves();
        let up = plain_to_cipher(&mut plain_r, writer, &mut to_cipher);
        let down = cipher_to_plain(reader, &mut plain_w, &mut to_plain);
        tokio::pin!(up);
        tokio::pin!(down);

        tokio::select! {
            outcome = &mut up => Finished::Up(outcome),
            outcome = &mut down => Finished::Down(outcome),
        }
    };

    plain_w.shutdown().await.ok();

    let handshake = match finished {
        Finished::Up(Upstream::Eof) => {
            debug!("Plaintext side finished, closing as initiator");
            Some(CloseHandshake::initiator())
        }
        Finished::Up(Upstream::PlainError(e)) => {
            debug!("Plaintext read failed ({}), closing as initiator", e);
            Some(CloseHandshake::initiator())
        }
        Finished::Down(Downstream::PlainError(e)) => {
            debug!("Plaintext write failed mid-session: {}", e);
            None
        }
        Finished::Down(Downstream::Fin) => {
            debug!("Peer finished, closing as responder");
            Some(CloseHandshake::responder())
        }
        Finished::Up(Upstream::CipherError(e)) | Finished::Down(Downstream::CipherError(e)) => {
            debug!("Cipher stream failed: {}", e);
            None
        }
        Finished::Down(Downstream::TransportClosed) => {
            debug!("Transport closed by peer mid-session");
            None
        }
    };

    match handshake {
        Some(mut machine) => {
            let (reader, writer) = stream.halves();
            let result = tokio::time::timeout(close_timeout, machine.run(reader, writer)).await;
            match result {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!("Close handshake failed in {:?}: {}", machine.state(), e);
                    stream.mark_unusable();
                }
                Err(_) => {
                    debug!("Close handshake timed out in {:?}", machine.state());
                    stream.mark_unusable();
                }
            }
        }
        None => stream.mark_unusable(),
    }

    let outcome = RelayOutcome {
        to_cipher,
        to_plain,
        must_close: stream.is_unusable(),
    };
    debug!(
        "Session relayed: {} bytes out, {} bytes in, must_close={}",
        outcome.to_cipher, outcome.to_plain, outcome.must_close
    );
    outcome
}

async fn plain_to_cipher<R, W>(
    plain: &mut R,
    writer: &mut CipherWriter<W>,
    count: &mut u64,
) -> Upstream
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = match plain.read(&mut buf).await {
            Ok(0) => return Upstream::Eof,
            Ok(n) => n,
            Err(e) => return Upstream::PlainError(e),
        };
        if let Err(e) = writer.write(&buf[..n]).await {
            return Upstream::CipherError(e);
        }
        *count += n as u64;
    }
}

async fn cipher_to_plain<R, W>(
    reader: &mut CipherReader<R>,
    plain: &mut W,
    count: &mut u64,
) -> Downstream
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => return Downstream::TransportClosed,
            Ok(n) => n,
            Err(TunnelError::FinReceived) => return Downstream::Fin,
            Err(e) => return Downstream::CipherError(e),
        };
        if let Err(e) = plain.write_all(&buf[..n]).await {
            return Downstream::PlainError(e);
        }
        *count += n as u64;
    }
}

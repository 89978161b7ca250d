//! Client side of a session

use super::SessionError;
use crate::crypto::Cipher;
use crate::protocol::Address;
use crate::transport::{ConnectionPool, Dialer, Reusable};
use crate::tunnel::{relay, CipherStream, Flags, Frame, RelayOutcome};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

/// Carry one local TCP connection to `address` through the relay server
///
/// The transport comes from `pool` and goes back to it afterwards; the
/// pool drops it when the relay reported it unfit for reuse.
pub async fn client_session<D, P>(
    pool: &ConnectionPool<D>,
    cipher: Arc<Cipher>,
    socket: P,
    address: &Address,
) -> Result<RelayOutcome, SessionError>
where
    D: Dialer,
    P: AsyncRead + AsyncWrite + Unpin,
{
    let header = address.encode()?;
    let conn = pool.acquire().await?;
    let session = conn.sessions();

    let mut stream = CipherStream::new(conn, cipher, Flags::TCP);
    if let Err(e) = stream.write_frame(&Frame::data(Flags::TCP, header)).await {
        stream.mark_unusable();
        pool.release(stream.into_inner()).await;
        return Err(e.into());
    }
    debug!("Session {} on this connection opened to {}", session, address);

    let outcome = relay(&mut stream, socket).await;
    pool.release(stream.into_inner()).await;

    debug!(
        "Session to {} finished ({} up, {} down{})",
        address,
        outcome.to_cipher,
        outcome.to_plain,
        if outcome.must_close { ", transport closed" } else { "" }
    );
    Ok(outcome)
}

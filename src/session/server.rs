//! Server side: sessions over one accepted transport connection

use super::{session_protocol, SessionError};
use crate::crypto::Cipher;
use crate::protocol::{Address, ProtocolError, RELAY_BUFFER_SIZE};
use crate::transport::{TcpDialer, TransportConfig};
use crate::tunnel::{relay, CipherStream, Flags, Frame, FrameType, TunnelError};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Serve sessions on `transport` until it is closed or found unusable
///
/// Waits at most `idle_timeout` for each session's first frame. Returns
/// the number of sessions carried.
pub async fn serve_connection<T>(
    transport: T,
    cipher: Arc<Cipher>,
    idle_timeout: Duration,
) -> Result<u64, SessionError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut stream = CipherStream::new(transport, cipher, Flags::TCP);
    let target_config = TransportConfig::default();
    let mut sessions = 0u64;

    loop {
        let frame = match tokio::time::timeout(idle_timeout, next_session_frame(&mut stream)).await
        {
            Ok(Ok(frame)) => frame,
            Ok(Err(TunnelError::ConnectionClosed)) => {
                debug!("Client closed connection after {} session(s)", sessions);
                return Ok(sessions);
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => {
                debug!("Connection idle for {:?}, closing", idle_timeout);
                return Ok(sessions);
            }
        };

        let protocol = session_protocol(frame.flags)?;
        if protocol != Flags::TCP {
            return Err(ProtocolError::UnsupportedProtocol(protocol.bits()).into());
        }
        stream.set_protocol(protocol);

        let (address, used) = Address::decode(&frame.payload)?;
        let early = frame.payload.slice(used..);
        sessions += 1;
        debug!("Session {} to {}", sessions, address);

        let outcome = match TcpDialer::connect(&address.to_string(), &target_config).await {
            Ok(mut target) => {
                if !early.is_empty() {
                    target.write_all(&early).await?;
                }
                relay(&mut stream, target).await
            }
            Err(e) => {
                warn!("Failed to connect to {}: {}", address, e);
                // Close the session towards the client right away and
                // discard whatever it already sent
                let (local, mut remote) = tokio::io::duplex(RELAY_BUFFER_SIZE);
                tokio::spawn(async move {
                    remote.shutdown().await.ok();
                    tokio::io::copy(&mut remote, &mut tokio::io::sink()).await.ok();
                });
                relay(&mut stream, local).await
            }
        };

        if outcome.must_close {
            debug!("Connection unusable after session {}, closing", sessions);
            return Ok(sessions);
        }
    }
}

/// Wait for the data frame that opens the next session
async fn next_session_frame<T>(stream: &mut CipherStream<T>) -> Result<Frame, TunnelError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = stream.read_frame().await?;
        match frame.frame_type {
            FrameType::Ping => continue,
            FrameType::Data => return Ok(frame),
            other => {
                return Err(TunnelError::UnexpectedFrame(format!(
                    "{:?} frame with flags {:?} before session start",
                    other, frame.flags
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Method;
    use tokio::io::duplex;

    fn cipher() -> Arc<Cipher> {
        Arc::new(Cipher::from_password(Method::Aes256Gcm, "server-test").unwrap())
    }

    #[tokio::test]
    async fn test_idle_connection_is_closed() {
        let (_client, server) = duplex(1024);
        let served = serve_connection(server, cipher(), Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(served, 0);
    }

    #[tokio::test]
    async fn test_client_hangup_between_sessions() {
        let (client, server) = duplex(1024);
        drop(client);
        let served = serve_connection(server, cipher(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(served, 0);
    }

    #[tokio::test]
    async fn test_udp_session_rejected() {
        let (client, server) = duplex(1024);
        let cipher = cipher();
        let mut client = CipherStream::new(client, Arc::clone(&cipher), Flags::UDP);

        let address = Address::Ipv4([127, 0, 0, 1], 53).encode().unwrap();
        client
            .write_frame(&Frame::data(Flags::UDP, address))
            .await
            .unwrap();

        let result = serve_connection(server, cipher, Duration::from_secs(5)).await;
        assert!(matches!(
            result,
            Err(SessionError::Protocol(ProtocolError::UnsupportedProtocol(0x02)))
        ));
    }

    #[tokio::test]
    async fn test_stray_signal_before_session() {
        let (client, server) = duplex(1024);
        let cipher = cipher();
        let mut client = CipherStream::new(client, Arc::clone(&cipher), Flags::TCP);
        client.ping().await.unwrap();
        client.write_frame(&Frame::fin()).await.unwrap();

        let result = serve_connection(server, cipher, Duration::from_secs(5)).await;
        assert!(matches!(
            result,
            Err(SessionError::Tunnel(TunnelError::UnexpectedFrame(_)))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_target_still_closes_cleanly() {
        let (client, server) = duplex(64 * 1024);
        let cipher = cipher();
        let mut client = CipherStream::new(client, Arc::clone(&cipher), Flags::TCP);

        // Port 1 on loopback refuses connections
        let address = Address::Ipv4([127, 0, 0, 1], 1).encode().unwrap();
        client
            .write_frame(&Frame::data(Flags::TCP, address))
            .await
            .unwrap();

        let server_task = tokio::spawn(serve_connection(
            server,
            Arc::clone(&cipher),
            Duration::from_millis(200),
        ));

        // The server hangs up the session with a FIN; answer as responder
        let mut buf = [0u8; 16];
        assert!(matches!(
            client.read(&mut buf).await,
            Err(TunnelError::FinReceived)
        ));
        client.write_frame(&Frame::ack()).await.unwrap();
        client.write_frame(&Frame::fin()).await.unwrap();
        assert!(client.read_frame().await.unwrap().is_ack());

        // Connection survived; the server now idles out
        assert_eq!(server_task.await.unwrap().unwrap(), 1);
    }
}

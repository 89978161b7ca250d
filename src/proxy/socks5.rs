//! SOCKS5 proxy implementation (RFC 1928, RFC 1929 auth)

use super::{Credentials, ProxyError};
use crate::protocol::{Address, ProtocolError};
use bytes::BytesMut;
use std::future::Future;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// SOCKS5 version
const SOCKS_VERSION: u8 = 0x05;

/// Username/password subnegotiation version
const AUTH_VERSION: u8 = 0x01;

/// Authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum AuthMethod {
    NoAuth = 0x00,
    UsernamePassword = 0x02,
    NoAcceptable = 0xFF,
}

/// SOCKS5 commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Command {
    Connect = 0x01,
    Bind = 0x02,
    UdpAssociate = 0x03,
}

impl TryFrom<u8> for Command {
    type Error = ProxyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Command::Connect),
            0x02 => Ok(Command::Bind),
            0x03 => Ok(Command::UdpAssociate),
            _ => Err(ProxyError::UnsupportedCommand(value)),
        }
    }
}

/// Reply codes
#[derive(Debug, Clone, Copy)]
#[repr(u8)]
enum Reply {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

/// SOCKS5 proxy server
pub struct Socks5Server {
    listener: TcpListener,
    /// Optional username/password authentication
    auth: Option<Credentials>,
}

impl Socks5Server {
    /// Create a new SOCKS5 server
    pub async fn bind(addr: &str) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        info!("SOCKS5 server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            auth: None,
        })
    }

    /// Enable username/password authentication
    pub fn with_auth(mut self, credentials: Credentials) -> Self {
        self.auth = Some(credentials);
        self
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever, handing each CONNECT to `handler`
    pub async fn run<F, Fut>(&self, handler: F) -> Result<(), ProxyError>
    where
        F: Fn(TcpStream, Address) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<(), ProxyError>> + Send,
    {
        loop {
            let (mut stream, peer_addr) = self.listener.accept().await?;
            debug!("New SOCKS5 connection from {}", peer_addr);

            let handler = handler.clone();
            let auth = self.auth.clone();

            tokio::spawn(async move {
                let result = match handshake(&mut stream, auth.as_ref()).await {
                    Ok(address) => handler(stream, address).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    error!("SOCKS5 connection from {} failed: {}", peer_addr, e);
                }
            });
        }
    }
}

/// Run the SOCKS5 negotiation and return the CONNECT destination
///
/// On success the client has already been told the connection succeeded
/// and the stream carries session data from here on.
pub(crate) async fn handshake<S>(
    stream: &mut S,
    auth: Option<&Credentials>,
) -> Result<Address, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting
    let mut buf = [0u8; 255];
    stream.read_exact(&mut buf[..2]).await?;

    if buf[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(buf[0]));
    }

    let nmethods = buf[1] as usize;
    stream.read_exact(&mut buf[..nmethods]).await?;
    let offered = &buf[..nmethods];

    let method = match auth {
        Some(_) if offered.contains(&(AuthMethod::UsernamePassword as u8)) => {
            AuthMethod::UsernamePassword
        }
        None if offered.contains(&(AuthMethod::NoAuth as u8)) => AuthMethod::NoAuth,
        _ => AuthMethod::NoAcceptable,
    };

    stream.write_all(&[SOCKS_VERSION, method as u8]).await?;

    match (method, auth) {
        (AuthMethod::NoAcceptable, _) => return Err(ProxyError::AuthenticationFailed),
        (AuthMethod::UsernamePassword, Some(expected)) => {
            authenticate(stream, expected).await?;
        }
        _ => {}
    }

    // Request
    stream.read_exact(&mut buf[..4]).await?;

    if buf[0] != SOCKS_VERSION {
        return Err(ProxyError::InvalidSocksVersion(buf[0]));
    }

    let command = buf[1];
    // buf[2] is reserved
    let atyp = buf[3];

    let address = match Address::read_from(stream, atyp).await {
        Ok(address) => address,
        Err(ProtocolError::InvalidAddressType(atyp)) => {
            send_reply(stream, Reply::AddressTypeNotSupported).await?;
            return Err(ProtocolError::InvalidAddressType(atyp).into());
        }
        Err(e) => {
            send_reply(stream, Reply::GeneralFailure).await?;
            return Err(e.into());
        }
    };

    let command = match Command::try_from(command) {
        Ok(command) => command,
        Err(e) => {
            send_reply(stream, Reply::CommandNotSupported).await?;
            return Err(e);
        }
    };

    debug!("SOCKS5 {:?} to {}", command, address);

    match command {
        Command::Connect => {
            send_reply(stream, Reply::Succeeded).await?;
            Ok(address)
        }
        Command::Bind | Command::UdpAssociate => {
            send_reply(stream, Reply::CommandNotSupported).await?;
            Err(ProxyError::UnsupportedCommand(command as u8))
        }
    }
}

async fn authenticate<S>(stream: &mut S, expected: &Credentials) -> Result<(), ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;
    if version != AUTH_VERSION {
        return Err(ProxyError::InvalidRequest(format!(
            "auth subnegotiation version {}",
            version
        )));
    }

    let username = read_short_string(stream).await?;
    let password = read_short_string(stream).await?;

    let success = expected.matches(&username, &password);
    stream
        .write_all(&[AUTH_VERSION, if success { 0x00 } else { 0x01 }])
        .await?;

    if success {
        Ok(())
    } else {
        Err(ProxyError::AuthenticationFailed)
    }
}

async fn read_short_string<S>(stream: &mut S) -> Result<String, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let len = stream.read_u8().await? as usize;
    let mut raw = vec![0u8; len];
    stream.read_exact(&mut raw).await?;
    Ok(String::from_utf8_lossy(&raw).into_owned())
}

/// Reply with an unspecified IPv4 bound address
async fn send_reply<S>(stream: &mut S, reply: Reply) -> Result<(), ProxyError>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = BytesMut::with_capacity(10);
    buf.extend_from_slice(&[SOCKS_VERSION, reply as u8, 0x00]);
    Address::Ipv4([0; 4], 0).write_to(&mut buf)?;
    stream.write_all(&buf).await?;
    Ok(())
}

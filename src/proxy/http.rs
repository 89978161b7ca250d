//! HTTP CONNECT proxy implementation

use super::{Credentials, ProxyError};
use crate::protocol::Address;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use std::collections::HashMap;
use std::future::Future;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info};

/// Longest request line or header line accepted
const MAX_LINE: usize = 8192;

/// HTTP CONNECT proxy server
pub struct HttpProxyServer {
    listener: TcpListener,
    /// Optional basic authentication
    auth: Option<Credentials>,
}

impl HttpProxyServer {
    /// Create a new HTTP proxy server
    pub async fn bind(addr: &str) -> Result<Self, ProxyError> {
        let listener = TcpListener::bind(addr).await?;
        info!("HTTP proxy server listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            auth: None,
        })
    }

    /// Enable basic authentication
    pub fn with_auth(mut self, credentials: Credentials) -> Self {
        self.auth = Some(credentials);
        self
    }

    pub fn local_addr(&self) -> std::io::Result<std::net::SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept connections forever, handing each CONNECT to `handler`
    ///
    /// The handler receives the buffered reader so bytes the client sent
    /// right after its request headers are not lost.
    pub async fn run<F, Fut>(&self, handler: F) -> Result<(), ProxyError>
    where
        F: Fn(BufReader<TcpStream>, Address) -> Fut + Clone + Send + 'static,
        Fut: Future<Output = Result<(), ProxyError>> + Send,
    {
        loop {
            let (stream, peer_addr) = self.listener.accept().await?;
            debug!("New HTTP proxy connection from {}", peer_addr);

            let handler = handler.clone();
            let auth = self.auth.clone();

            tokio::spawn(async move {
                let mut reader = BufReader::new(stream);
                let result = match handshake(&mut reader, auth.as_ref()).await {
                    Ok(address) => handler(reader, address).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = result {
                    error!("HTTP proxy connection from {} failed: {}", peer_addr, e);
                }
            });
        }
    }
}

/// Parse one CONNECT request and answer it
///
/// Returns the destination once `200 Connection Established` was sent.
pub(crate) async fn handshake<S>(
    reader: &mut BufReader<S>,
    auth: Option<&Credentials>,
) -> Result<Address, ProxyError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request_line = read_line(reader).await?;

    let parts: Vec<&str> = request_line.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(ProxyError::InvalidRequest(format!(
            "request line '{}'",
            request_line
        )));
    }
    let method = parts[0];
    let target = parts[1];

    let mut headers = HashMap::new();
    loop {
        let line = read_line(reader).await?;
        if line.is_empty() {
            break;
        }
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }

    if let Some(expected) = auth {
        let authorized = headers
            .get("proxy-authorization")
            .and_then(|value| basic_credentials(value))
            .map_or(false, |(user, pass)| expected.matches(&user, &pass));

        if !authorized {
            reader
                .write_all(
                    b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                      Proxy-Authenticate: Basic realm=\"mirage\"\r\n\r\n",
                )
                .await?;
            return Err(ProxyError::AuthenticationFailed);
        }
    }

    if !method.eq_ignore_ascii_case("CONNECT") {
        reader
            .write_all(b"HTTP/1.1 405 Method Not Allowed\r\n\r\n")
            .await?;
        return Err(ProxyError::InvalidRequest(format!(
            "unsupported method {}",
            method
        )));
    }

    let address = match target.parse::<Address>() {
        Ok(address) => address,
        Err(_) => {
            reader.write_all(b"HTTP/1.1 400 Bad Request\r\n\r\n").await?;
            return Err(ProxyError::InvalidAddress(target.to_string()));
        }
    };

    debug!("HTTP CONNECT to {}", address);

    reader
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;
    Ok(address)
}

async fn read_line<S>(reader: &mut BufReader<S>) -> Result<String, ProxyError>
where
    S: AsyncRead + Unpin,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(ProxyError::InvalidRequest("connection closed mid-request".into()));
    }
    if line.len() > MAX_LINE {
        return Err(ProxyError::InvalidRequest("header line too long".into()));
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

/// Decode a `Basic` Proxy-Authorization value into user and password
fn basic_credentials(value: &str) -> Option<(String, String)> {
    let encoded = value.strip_prefix("Basic ")?;
    let decoded = STANDARD.decode(encoded.trim()).ok()?;
    let credentials = String::from_utf8(decoded).ok()?;
    let (user, pass) = credentials.split_once(':')?;
    Some((user.to_string(), pass.to_string()))
}

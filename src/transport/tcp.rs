//! Raw TCP dialer

use super::{Dialer, TransportConfig, TransportError};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;

/// Dials plain TCP connections to a fixed address
#[derive(Debug, Clone)]
pub struct TcpDialer {
    addr: String,
    config: TransportConfig,
}

impl TcpDialer {
    /// Create a new TCP dialer
    pub fn new(addr: impl Into<String>, config: TransportConfig) -> Self {
        Self {
            addr: addr.into(),
            config,
        }
    }

    /// Open a TCP connection to `addr` with the dialer's options applied
    pub(crate) async fn connect(
        addr: &str,
        config: &TransportConfig,
    ) -> Result<TcpStream, TransportError> {
        let timeout = Duration::from_secs(config.connect_timeout);

        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", addr, e)))?;

        if config.nodelay {
            stream.set_nodelay(true).ok();
        }

        Ok(stream)
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    type Conn = TcpStream;

    async fn dial(&self) -> Result<TcpStream, TransportError> {
        Self::connect(&self.addr, &self.config).await
    }

    fn remote(&self) -> &str {
        &self.addr
    }
}

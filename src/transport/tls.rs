//! TLS transport
//!
//! Wraps relay connections in TLS 1.3 so the encrypted session stream
//! travels inside ordinary-looking HTTPS traffic. The client trusts the
//! webpki root set plus an optional extra CA file (for self-signed relay
//! certificates).

use super::tcp::TcpDialer;
use super::{Dialer, TransportConfig, TransportError};
use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::RootCertStore;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tracing::debug;

/// Dials TLS connections to a fixed address
pub struct TlsDialer {
    addr: String,
    sni: ServerName<'static>,
    connector: TlsConnector,
    config: TransportConfig,
}

impl TlsDialer {
    /// Create a new TLS dialer
    ///
    /// `extra_ca` names a PEM file whose certificates are trusted in
    /// addition to the webpki roots.
    pub fn new(
        addr: impl Into<String>,
        sni: &str,
        extra_ca: Option<&Path>,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let mut roots = RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        if let Some(path) = extra_ca {
            for cert in load_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|e| TransportError::Tls(format!("Invalid CA certificate: {}", e)))?;
            }
        }

        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let tls_config = rustls::ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TransportError::Tls(e.to_string()))?
            .with_root_certificates(roots)
            .with_no_client_auth();

        let sni = ServerName::try_from(sni)
            .map_err(|e| TransportError::Tls(format!("Invalid SNI '{}': {}", sni, e)))?
            .to_owned();

        Ok(Self {
            addr: addr.into(),
            sni,
            connector: TlsConnector::from(Arc::new(tls_config)),
            config,
        })
    }
}

#[async_trait]
impl Dialer for TlsDialer {
    type Conn = TlsStream<TcpStream>;

    async fn dial(&self) -> Result<Self::Conn, TransportError> {
        let tcp_stream = TcpDialer::connect(&self.addr, &self.config).await?;

        let timeout = Duration::from_secs(self.config.connect_timeout);
        let tls_stream = tokio::time::timeout(
            timeout,
            self.connector.connect(self.sni.clone(), tcp_stream),
        )
        .await
        .map_err(|_| TransportError::Timeout)?
        .map_err(|e| TransportError::Tls(e.to_string()))?;

        debug!("TLS handshake complete with {}", self.addr);
        Ok(tls_stream)
    }

    fn remote(&self) -> &str {
        &self.addr
    }
}

/// Load a certificate chain from a PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TransportError> {
    let file = std::fs::File::open(path).map_err(|e| {
        TransportError::Tls(format!("Failed to open cert file {}: {}", path.display(), e))
    })?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::Tls(format!("Failed to parse PEM certificates: {}", e)))?;

    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

/// Load a private key from a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TransportError> {
    let file = std::fs::File::open(path).map_err(|e| {
        TransportError::Tls(format!("Failed to open key file {}: {}", path.display(), e))
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| TransportError::Tls(format!("Failed to parse PEM private key: {}", e)))?
        .ok_or_else(|| TransportError::Tls(format!("No private key found in {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_dialer() {
        let dialer =
            TlsDialer::new("203.0.113.1:443", "www.example.com", None, TransportConfig::default())
                .unwrap();
        assert_eq!(dialer.remote(), "203.0.113.1:443");
    }

    #[test]
    fn test_invalid_sni() {
        let result = TlsDialer::new("203.0.113.1:443", "", None, TransportConfig::default());
        assert!(matches!(result, Err(TransportError::Tls(_))));
    }

    #[test]
    fn test_missing_cert_file() {
        let result = load_certs(Path::new("/nonexistent/cert.pem"));
        assert!(matches!(result, Err(TransportError::Tls(_))));
    }
}

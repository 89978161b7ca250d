//! Mirage Tunnel Server
//!
//! Accepts transport connections from clients, optionally over TLS, and
//! serves any number of sequential sessions on each of them.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use mirage_tunnel::{
    config::Config,
    crypto::Cipher,
    session::serve_connection,
    transport::{load_certs, load_private_key},
};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// Mirage Tunnel Server - relay end of the encrypted tunnel
#[derive(Parser, Debug)]
#[command(name = "mirage-server")]
#[command(about = "Mirage Tunnel Server - traffic-obfuscating relay")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listen address (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Log level filter (overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

/// Server state shared across connections
struct ServerState {
    cipher: Arc<Cipher>,
    tls_acceptor: Option<TlsAcceptor>,
    idle_timeout: Duration,
    /// Limits concurrent transport connections
    conn_semaphore: Semaphore,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config).context("Failed to load configuration")?;
    mirage_tunnel::logging::init(&config.logging, args.log_level.as_deref())
        .context("Failed to initialize logging")?;

    let server_config = config
        .server
        .clone()
        .ok_or_else(|| anyhow!("No [server] section in config file"))?;

    let method = server_config.method()?;
    let cipher = Arc::new(
        Cipher::from_password(method, &server_config.password)
            .context("Failed to derive session key")?,
    );

    let tls_acceptor = match (&server_config.tls_cert, &server_config.tls_key) {
        (Some(cert_path), Some(key_path)) => {
            let acceptor = build_tls_acceptor(cert_path, key_path)?;
            info!("TLS enabled with cert: {}", cert_path);
            Some(acceptor)
        }
        _ => {
            info!("TLS disabled (no tls_cert/tls_key configured)");
            None
        }
    };

    let state = Arc::new(ServerState {
        cipher,
        tls_acceptor,
        idle_timeout: server_config.idle_timeout(),
        conn_semaphore: Semaphore::new(server_config.max_connections),
    });

    let listen_addr = args.listen.unwrap_or(server_config.listen);

    info!("Mirage Tunnel Server v{}", mirage_tunnel::VERSION);
    info!("Cipher method: {}", method);

    let listener = TcpListener::bind(&listen_addr)
        .await
        .context("Failed to bind to address")?;
    info!("Listening on {}", listener.local_addr()?);

    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer_addr)) => {
                        debug!("New connection from {}", peer_addr);

                        let state = Arc::clone(&state);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, peer_addr, state).await {
                                debug!("Connection from {} ended with error: {:#}", peer_addr, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Accept error: {}", e);
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    Ok(())
}

fn build_tls_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor> {
    let certs = load_certs(Path::new(cert_path)).context("Failed to load TLS certificate")?;
    let key = load_private_key(Path::new(key_path)).context("Failed to load TLS private key")?;
    info!("Loaded {} certificate(s) from {}", certs.len(), cert_path);

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let tls_config = rustls::ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("Failed to select TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("Failed to build TLS server config")?;

    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

/// Handle a single transport connection
async fn handle_connection(
    stream: TcpStream,
    peer_addr: SocketAddr,
    state: Arc<ServerState>,
) -> Result<()> {
    let _permit = state
        .conn_semaphore
        .acquire()
        .await
        .context("Failed to acquire connection permit")?;

    // Close-handshake signals are tiny; don't let Nagle hold them back
    stream.set_nodelay(true)?;

    let cipher = Arc::clone(&state.cipher);
    let sessions = match &state.tls_acceptor {
        Some(acceptor) => {
            let tls_stream = acceptor
                .accept(stream)
                .await
                .context("TLS accept failed")?;
            debug!("TLS handshake complete with {}", peer_addr);
            serve_connection(tls_stream, cipher, state.idle_timeout).await?
        }
        None => serve_connection(stream, cipher, state.idle_timeout).await?,
    };

    debug!(
        "Connection from {} closed after {} session(s)",
        peer_addr, sessions
    );
    Ok(())
}

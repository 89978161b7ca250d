//! Mirage Tunnel Client
//!
//! Runs local SOCKS5/HTTP proxies and carries every accepted connection
//! as one session over a pool of reusable encrypted transport connections.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use mirage_tunnel::{
    config::{generate_example_config, ClientConfig, Config},
    crypto::Cipher,
    proxy::{Credentials, HttpProxyServer, ProxyError, Socks5Server},
    session::client_session,
    transport::{ConnectionPool, Dialer, PoolConfig, TcpDialer, TlsDialer, TransportConfig},
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Mirage Tunnel Client - local proxy end of the encrypted tunnel
#[derive(Parser, Debug)]
#[command(name = "mirage-client")]
#[command(about = "Mirage Tunnel Client - traffic-obfuscating local proxy")]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Print an example configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Server address (overrides config)
    #[arg(short, long)]
    server: Option<String>,

    /// Local SOCKS5 proxy address (overrides config)
    #[arg(long)]
    socks5: Option<String>,

    /// Local HTTP proxy address (overrides config)
    #[arg(long)]
    http: Option<String>,

    /// Log level filter (overrides config)
    #[arg(short = 'v', long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.generate_config {
        let example = toml::to_string_pretty(&generate_example_config())
            .context("Failed to serialize example config")?;
        println!("{}", example);
        return Ok(());
    }

    let config = Config::load(&args.config).context("Failed to load configuration")?;
    mirage_tunnel::logging::init(&config.logging, args.log_level.as_deref())
        .context("Failed to initialize logging")?;

    let mut client_config = config
        .client
        .clone()
        .ok_or_else(|| anyhow!("No [client] section in config file"))?;

    if let Some(server) = args.server {
        client_config.server = server;
    }
    if args.socks5.is_some() {
        client_config.socks5_listen = args.socks5;
    }
    if args.http.is_some() {
        client_config.http_listen = args.http;
    }

    let method = client_config.method()?;
    let cipher = Arc::new(
        Cipher::from_password(method, &client_config.password)
            .context("Failed to derive session key")?,
    );

    info!("Mirage Tunnel Client v{}", mirage_tunnel::VERSION);
    info!("Server: {}", client_config.server);
    info!("Cipher method: {}", method);

    let transport = TransportConfig {
        connect_timeout: client_config.connect_timeout_secs,
        ..TransportConfig::default()
    };

    match client_config.tls_sni.clone() {
        Some(sni) => {
            info!("TLS wrapping enabled, SNI: {}", sni);
            let dialer = TlsDialer::new(
                client_config.server.clone(),
                &sni,
                client_config.tls_ca.as_deref().map(Path::new),
                transport,
            )
            .context("Failed to set up TLS transport")?;
            run(dialer, cipher, client_config).await
        }
        None => {
            info!("TLS wrapping disabled (raw TCP)");
            let dialer = TcpDialer::new(client_config.server.clone(), transport);
            run(dialer, cipher, client_config).await
        }
    }
}

/// Start the configured front-ends and wait for shutdown
async fn run<D>(dialer: D, cipher: Arc<Cipher>, config: ClientConfig) -> Result<()>
where
    D: Dialer + 'static,
{
    let pool = Arc::new(ConnectionPool::new(
        dialer,
        PoolConfig {
            max_idle: config.pool_size,
            ..PoolConfig::default()
        },
    ));
    let credentials = config.credentials();

    if let Some(addr) = config.socks5_listen.clone() {
        let pool = Arc::clone(&pool);
        let cipher = Arc::clone(&cipher);
        let credentials = credentials.clone();
        tokio::spawn(async move {
            if let Err(e) = run_socks5_proxy(&addr, pool, cipher, credentials).await {
                error!("SOCKS5 proxy error: {:#}", e);
            }
        });
    }

    if let Some(addr) = config.http_listen.clone() {
        let pool = Arc::clone(&pool);
        let cipher = Arc::clone(&cipher);
        tokio::spawn(async move {
            if let Err(e) = run_http_proxy(&addr, pool, cipher, credentials).await {
                error!("HTTP proxy error: {:#}", e);
            }
        });
    }

    let mut report = tokio::time::interval(Duration::from_secs(60));
    report.tick().await;
    loop {
        tokio::select! {
            _ = report.tick() => {
                info!("Idle transport connections: {}", pool.idle_len().await);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                return Ok(());
            }
        }
    }
}

async fn run_socks5_proxy<D>(
    addr: &str,
    pool: Arc<ConnectionPool<D>>,
    cipher: Arc<Cipher>,
    credentials: Option<Credentials>,
) -> Result<()>
where
    D: Dialer + 'static,
{
    let mut server = Socks5Server::bind(addr)
        .await
        .context("Failed to start SOCKS5 proxy")?;
    if let Some(credentials) = credentials {
        server = server.with_auth(credentials);
    }

    server
        .run(move |stream, address| {
            let pool = Arc::clone(&pool);
            let cipher = Arc::clone(&cipher);
            async move {
                client_session(&pool, cipher, stream, &address).await?;
                Ok::<(), ProxyError>(())
            }
        })
        .await?;
    Ok(())
}

async fn run_http_proxy<D>(
    addr: &str,
    pool: Arc<ConnectionPool<D>>,
    cipher: Arc<Cipher>,
    credentials: Option<Credentials>,
) -> Result<()>
where
    D: Dialer + 'static,
{
    let mut server = HttpProxyServer::bind(addr)
        .await
        .context("Failed to start HTTP proxy")?;
    if let Some(credentials) = credentials {
        server = server.with_auth(credentials);
    }

    server
        .run(move |stream, address| {
            let pool = Arc::clone(&pool);
            let cipher = Arc::clone(&cipher);
            async move {
                client_session(&pool, cipher, stream, &address).await?;
                Ok::<(), ProxyError>(())
            }
        })
        .await?;
    Ok(())
}

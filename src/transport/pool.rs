//! Connection pool for transport connections
//!
//! A connection goes back into the idle list only when the session that
//! used it finished with a clean close handshake. Anything flagged
//! unusable is dropped on release.

use super::{Dialer, Reusable, TransportError};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::Mutex;
use tracing::{debug, trace};

/// Pool configuration
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of idle connections kept
    pub max_idle: usize,
    /// Idle connections older than this are discarded instead of reused
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: 16,
            idle_timeout: Duration::from_secs(60),
        }
    }
}

/// A transport connection owned by the pool between sessions
pub struct PooledConnection<T> {
    inner: T,
    unusable: AtomicBool,
    created: Instant,
    idle_since: Option<Instant>,
    sessions: u64,
}

impl<T> PooledConnection<T> {
    pub fn new(inner: T) -> Self {
        Self {
            inner,
            unusable: AtomicBool::new(false),
            created: Instant::now(),
            idle_since: None,
            sessions: 0,
        }
    }

    /// Time since the connection was established
    pub fn age(&self) -> Duration {
        self.created.elapsed()
    }

    /// Number of sessions this connection has carried so far
    pub fn sessions(&self) -> u64 {
        self.sessions
    }

    fn idle_for(&self) -> Duration {
        self.idle_since.map(|t| t.elapsed()).unwrap_or_default()
    }
}

impl<T> Reusable for PooledConnection<T> {
    fn mark_unusable(&self) {
        if !self.unusable.swap(true, Ordering::AcqRel) {
            debug!(
                "Connection marked unusable after {} session(s)",
                self.sessions
            );
        }
    }

    fn is_unusable(&self) -> bool {
        self.unusable.load(Ordering::Acquire)
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for PooledConnection<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_read(cx, buf)
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for PooledConnection<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Pool of transport connections to one relay server
pub struct ConnectionPool<D: Dialer> {
    dialer: D,
    config: PoolConfig,
    idle: Mutex<Vec<PooledConnection<D::Conn>>>,
}

impl<D: Dialer> ConnectionPool<D> {
    pub fn new(dialer: D, config: PoolConfig) -> Self {
        Self {
            dialer,
            config,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// Take an idle connection, or dial a new one when none is left
    pub async fn acquire(&self) -> Result<PooledConnection<D::Conn>, TransportError> {
        let reused = {
            let mut idle = self.idle.lock().await;
            let mut found = None;
            while let Some(conn) = idle.pop() {
                if conn.idle_for() < self.config.idle_timeout {
                    found = Some(conn);
                    break;
                }
                trace!("Discarding stale idle connection (idle {:?})", conn.idle_for());
            }
            found
        };

        let mut conn = match reused {
            Some(conn) => {
                debug!(
                    "Reusing connection to {} ({} prior session(s))",
                    self.dialer.remote(),
                    conn.sessions
                );
                conn
            }
            None => {
                debug!("Dialing new connection to {}", self.dialer.remote());
                PooledConnection::new(self.dialer.dial().await?)
            }
        };

        conn.idle_since = None;
        conn.sessions += 1;
        Ok(conn)
    }

    /// Return a connection after its session ended
    pub async fn release(&self, mut conn: PooledConnection<D::Conn>) {
        if conn.is_unusable() {
            debug!(
                "Dropping unusable connection to {} (age {:?}, {} session(s))",
                self.dialer.remote(),
                conn.age(),
                conn.sessions
            );
            return;
        }

        let mut idle = self.idle.lock().await;
        if idle.len() >= self.config.max_idle {
            trace!("Idle pool full, closing connection");
            return;
        }

        conn.idle_since = Some(Instant::now());
        idle.push(conn);
    }

    /// Number of idle connections currently held
    pub async fn idle_len(&self) -> usize {
        self.idle.lock().await.len()
    }
}

//! Multiplexed sessions over a single tunnel connection.
//!
//! The framing, flow control and keep-alive work is done by yamux. This module
//! owns the glue: a driver task that polls the yamux session, a queue of
//! inbound streams, and a pair of cancellation tokens. One token requests the
//! close, the other reports that the session has stopped serving.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_yamux::session::SessionType;
use tokio_yamux::{Control, Session, StreamHandle};
use tracing::{debug, trace, warn};

/// A logical, independently flow-controlled connection inside a session.
pub type TunnelStream = StreamHandle;

/// Default keep-alive ping interval.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(1);

/// Default time after which a stalled connection is treated as dead.
pub const DEFAULT_KEEP_ALIVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of inbound streams that may wait for `accept_stream`.
pub const DEFAULT_ACCEPT_BACKLOG: usize = 256;

/// Session errors.
#[derive(Debug, Error)]
pub enum SessionError {
    /// The session is gone. Terminal for any accept loop.
    #[error("session closed")]
    Closed,
    /// No stream arrived before the accept deadline. Callers retry.
    #[error("accept stream timeout")]
    Timeout,
    /// The multiplexer rejected the operation.
    #[error("multiplex: {0}")]
    Multiplex(String),
}

/// Which end of the tunnel this session is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

impl From<Role> for SessionType {
    fn from(role: Role) -> Self {
        match role {
            Role::Client => SessionType::Client,
            Role::Server => SessionType::Server,
        }
    }
}

/// Session tuning.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// How often keep-alive pings are sent.
    pub keep_alive_interval: Duration,
    /// A connection that has received nothing for this long is closed.
    /// Also bounds how long a single write may stall.
    pub keep_alive_timeout: Duration,
    /// Deadline for a single `accept_stream` call. `None` waits forever.
    pub accept_timeout: Option<Duration>,
    /// Inbound streams queued for `accept_stream` before new ones are dropped.
    pub accept_backlog: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            keep_alive_timeout: DEFAULT_KEEP_ALIVE_TIMEOUT,
            accept_timeout: None,
            accept_backlog: DEFAULT_ACCEPT_BACKLOG,
        }
    }
}

impl SessionConfig {
    fn yamux_config(&self) -> tokio_yamux::Config {
        tokio_yamux::Config {
            enable_keepalive: true,
            keepalive_interval: self.keep_alive_interval,
            connection_write_timeout: self.keep_alive_timeout,
            ..tokio_yamux::Config::default()
        }
    }
}

/// Records when bytes last arrived on the wrapped connection.
struct ReadActivity<T> {
    inner: T,
    epoch: Instant,
    last_read_ms: Arc<AtomicU64>,
}

impl<T> ReadActivity<T> {
    fn new(inner: T) -> (Self, IdleClock) {
        let epoch = Instant::now();
        let last_read_ms = Arc::new(AtomicU64::new(0));
        let clock = IdleClock {
            epoch,
            last_read_ms: last_read_ms.clone(),
        };
        (
            Self {
                inner,
                epoch,
                last_read_ms,
            },
            clock,
        )
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for ReadActivity<T> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let res = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            if buf.filled().len() > before {
                let now = self.epoch.elapsed().as_millis() as u64;
                self.last_read_ms.store(now, Ordering::Relaxed);
            }
        }
        res
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for ReadActivity<T> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Read side of [`ReadActivity`], held by the driver.
struct IdleClock {
    epoch: Instant,
    last_read_ms: Arc<AtomicU64>,
}

impl IdleClock {
    /// Time since the last inbound bytes (or since the session started).
    fn idle(&self) -> Duration {
        let last = Duration::from_millis(self.last_read_ms.load(Ordering::Relaxed));
        self.epoch.elapsed().saturating_sub(last)
    }
}

struct Inner {
    role: Role,
    control: Mutex<Control>,
    incoming: tokio::sync::Mutex<mpsc::Receiver<TunnelStream>>,
    accept_timeout: Option<Duration>,
    /// Cancelled to request the close.
    shutdown: CancellationToken,
    /// Cancelled by the driver once the session has stopped.
    closed: CancellationToken,
    local_addr: OnceLock<SocketAddr>,
}

/// A multiplexed session over one authenticated tunnel connection.
///
/// Cloning is cheap; all clones refer to the same session.
#[derive(Clone)]
pub struct TunnelSession {
    inner: Arc<Inner>,
}

impl TunnelSession {
    /// Create the client side of a session over `conn`.
    ///
    /// The session closes when `parent` is cancelled.
    pub fn client<T>(conn: T, config: &SessionConfig, parent: &CancellationToken) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::spawn(conn, config, Role::Client, parent)
    }

    /// Create the server side of a session over `conn`.
    pub fn server<T>(conn: T, config: &SessionConfig, parent: &CancellationToken) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        Self::spawn(conn, config, Role::Server, parent)
    }

    fn spawn<T>(conn: T, config: &SessionConfig, role: Role, parent: &CancellationToken) -> Self
    where
        T: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (conn, idle_clock) = ReadActivity::new(conn);
        let mut session = Session::new(conn, config.yamux_config(), role.into());
        let keep_alive_timeout = config.keep_alive_timeout;
        let check_every = config
            .keep_alive_interval
            .min(keep_alive_timeout)
            .max(Duration::from_millis(10));
        let mut idle_check = tokio::time::interval(check_every);
        idle_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let control = session.control();
        let (tx, rx) = mpsc::channel(config.accept_backlog.max(1));
        let shutdown = parent.child_token();
        let closed = CancellationToken::new();

        let driver_shutdown = shutdown.clone();
        let driver_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = driver_shutdown.cancelled() => {
                        debug!(%role, "session close requested");
                        break;
                    }
                    _ = idle_check.tick() => {
                        let idle = idle_clock.idle();
                        if idle > keep_alive_timeout {
                            warn!(%role, ?idle, "keep-alive timeout, closing session");
                            break;
                        }
                    }
                    next = session.next() => match next {
                        Some(Ok(stream)) => {
                            if let Err(e) = tx.try_send(stream) {
                                match e {
                                    mpsc::error::TrySendError::Full(_) => {
                                        warn!(%role, "accept backlog full, dropping inbound stream")
                                    }
                                    mpsc::error::TrySendError::Closed(_) => {
                                        trace!(%role, "nobody accepting, dropping inbound stream")
                                    }
                                }
                            }
                        }
                        Some(Err(e)) => {
                            debug!(%role, error = %e, "multiplexed session failed");
                            break;
                        }
                        None => {
                            debug!(%role, "peer closed multiplexed session");
                            break;
                        }
                    }
                }
            }
            // Dropping the session releases the underlying connection.
            drop(session);
            driver_closed.cancel();
        });

        Self {
            inner: Arc::new(Inner {
                role,
                control: Mutex::new(control),
                incoming: tokio::sync::Mutex::new(rx),
                accept_timeout: config.accept_timeout,
                shutdown,
                closed,
                local_addr: OnceLock::new(),
            }),
        }
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    /// Record the local address of the underlying connection.
    pub fn set_local_addr(&self, addr: SocketAddr) {
        let _ = self.inner.local_addr.set(addr);
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.get().copied()
    }

    /// Open a new outbound stream.
    pub async fn open_stream(&self) -> Result<TunnelStream, SessionError> {
        if self.is_closed() || self.inner.shutdown.is_cancelled() {
            return Err(SessionError::Closed);
        }
        let mut control = self
            .inner
            .control
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        tokio::select! {
            _ = self.inner.closed.cancelled() => Err(SessionError::Closed),
            res = control.open_stream() => res.map_err(|e| {
                if self.is_closed() {
                    SessionError::Closed
                } else {
                    SessionError::Multiplex(format!("{:?}", e))
                }
            }),
        }
    }

    /// Wait for the peer to open a stream.
    pub async fn accept_stream(&self) -> Result<TunnelStream, SessionError> {
        let mut incoming = self.inner.incoming.lock().await;
        let next = async {
            tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => Err(SessionError::Closed),
                _ = self.inner.closed.cancelled() => Err(SessionError::Closed),
                stream = incoming.recv() => stream.ok_or(SessionError::Closed),
            }
        };
        match self.inner.accept_timeout {
            Some(deadline) => tokio::time::timeout(deadline, next)
                .await
                .map_err(|_| SessionError::Timeout)?,
            None => next.await,
        }
    }

    /// Completes once the session can no longer serve streams.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Request the close. Idempotent; completion is observed via [`closed`].
    ///
    /// [`closed`]: TunnelSession::closed
    pub fn close(&self) {
        if !self.inner.shutdown.is_cancelled() {
            debug!(role = %self.inner.role, "closing session");
        }
        self.inner.shutdown.cancel();
    }
}

impl std::fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession")
            .field("role", &self.inner.role)
            .field("closed", &self.is_closed())
            .finish()
    }
}

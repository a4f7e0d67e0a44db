//! Tunnel workers.
//!
//! Every configured entry gets its own worker, its own connection to the
//! server and its own session. Relay workers pipe each stream the server opens
//! to a fixed target; proxy workers answer SOCKS5 on them.

use std::sync::Arc;

use rtun_core::backoff::Backoff;
use rtun_core::protocol::DEFAULT_HANDSHAKE_TIMEOUT;
use rtun_core::{
    write_handshake, SessionConfig, SessionError, SessionListener, ShutdownSignal, TunnelError,
    TunnelSession, TunnelStream,
};
use rustls::pki_types::ServerName;
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_rustls::TlsConnector;
use tracing::{debug, error, info, warn};

use crate::config::{ClientConfig, WorkerEntry, WorkerKind};
use crate::socks5;
use crate::tls;

/// The tunnel client.
pub struct TunnelClient {
    config: ClientConfig,
    session_config: SessionConfig,
    tls: Option<(TlsConnector, ServerName<'static>)>,
    shutdown: ShutdownSignal,
}

impl TunnelClient {
    pub fn new(config: ClientConfig, shutdown: ShutdownSignal) -> Result<Self, TunnelError> {
        config.validate()?;

        let tls = match &config.ca_cert {
            Some(ca) if !config.insecure => Some(tls::load_tls_connector(ca, &config.server_name)?),
            _ => {
                warn!("Running with --insecure: tunnel traffic to {} is not encrypted", config.server);
                None
            }
        };

        Ok(Self {
            session_config: config.session_config(),
            config,
            tls,
            shutdown,
        })
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Number of workers still running.
    pub fn active_workers(&self) -> usize {
        self.shutdown.active_connection_count()
    }

    /// Run one worker per entry and return once all of them have stopped.
    pub async fn run(self: Arc<Self>) {
        let mut workers = JoinSet::new();
        for entry in self.config.entries() {
            let client = self.clone();
            workers.spawn(async move { client.run_worker(entry).await });
        }

        while let Some(res) = workers.join_next().await {
            if let Err(e) = res {
                if e.is_panic() {
                    error!("worker panicked: {}", e);
                }
            }
        }
        info!("client stopped");
    }

    async fn run_worker(&self, entry: WorkerEntry) {
        let _guard = self.shutdown.register_connection();
        let port = entry.remote_port;
        let mut backoff = Backoff::reconnect();

        loop {
            match self.run_session(&entry).await {
                Ok(true) => {
                    info!("Tunnel for port {} ended", port);
                    backoff.reset();
                }
                Ok(false) => {
                    warn!(port, "server closed the tunnel right after the handshake");
                }
                Err(TunnelError::Cancelled) => break,
                Err(e) => {
                    error!(port, category = %e.category(), "tunnel failed: {}", e);
                    if !e.is_retryable() {
                        break;
                    }
                }
            }

            if !self.config.reconnect || self.shutdown.is_shutting_down() {
                break;
            }
            let delay = backoff.next_delay();
            info!("Reconnecting port {} in {:?} (attempt {})", port, delay, backoff.attempts());
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        debug!(port, "worker stopped");
    }

    /// Run one session to completion.
    ///
    /// Returns whether the session was established: it carried at least one
    /// stream or stayed up for a full keep-alive timeout. Only established
    /// sessions reset the reconnect backoff.
    async fn run_session(&self, entry: &WorkerEntry) -> Result<bool, TunnelError> {
        let started = Instant::now();
        let session = self.connect(entry.remote_port).await?;

        let streams = match &entry.kind {
            WorkerKind::Relay { target_addr } => {
                info!("Relaying server port {} to {}", entry.remote_port, target_addr);
                relay(&session, target_addr).await
            }
            WorkerKind::Proxy => {
                info!("Serving SOCKS5 on server port {}", entry.remote_port);
                socks5::serve(SessionListener::new(session.clone()), self.shutdown.child_token())
                    .await
            }
        };

        session.close();
        Ok(streams > 0 || started.elapsed() >= self.session_config.keep_alive_timeout)
    }

    /// Dial the server, authenticate for `port` and start a client session.
    pub async fn connect(&self, port: u16) -> Result<TunnelSession, TunnelError> {
        let addr = self.config.server.as_str();
        debug!("Connecting to {}", addr);

        let stream = tokio::select! {
            _ = self.shutdown.cancelled() => return Err(TunnelError::Cancelled),
            res = TcpStream::connect(addr) => res.map_err(|source| TunnelError::DialFailed {
                addr: addr.to_string(),
                source,
            })?,
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("set_nodelay failed: {}", e);
        }
        let local_addr = stream.local_addr().ok();

        let session = match &self.tls {
            Some((connector, name)) => {
                let handshake = tokio::time::timeout(
                    DEFAULT_HANDSHAKE_TIMEOUT,
                    connector.connect(name.clone(), stream),
                );
                let mut tls_stream = tokio::select! {
                    _ = self.shutdown.cancelled() => return Err(TunnelError::Cancelled),
                    res = handshake => res
                        .map_err(|_| TunnelError::HandshakeTimeout(DEFAULT_HANDSHAKE_TIMEOUT))?
                        .map_err(|e| TunnelError::Tls(e.to_string()))?,
                };
                write_handshake(&mut tls_stream, port, &self.config.token).await?;
                TunnelSession::client(tls_stream, &self.session_config, self.shutdown.token())
            }
            None => {
                let mut stream = stream;
                write_handshake(&mut stream, port, &self.config.token).await?;
                TunnelSession::client(stream, &self.session_config, self.shutdown.token())
            }
        };

        if let Some(local) = local_addr {
            session.set_local_addr(local);
        }
        info!("Connected to {} for port {}", addr, port);
        Ok(session)
    }
}

/// Relay every stream of `session` to `target` until the session closes.
/// Returns the number of streams relayed.
async fn relay(session: &TunnelSession, target: &str) -> usize {
    let mut streams = JoinSet::new();
    let mut backoff = Backoff::accept();
    let mut accepted = 0;

    loop {
        tokio::select! {
            res = session.accept_stream() => match res {
                Ok(stream) => {
                    backoff.reset();
                    accepted += 1;
                    streams.spawn(relay_stream(session.clone(), stream, target.to_string()));
                }
                Err(SessionError::Closed) => break,
                Err(SessionError::Timeout) => {
                    debug!("accept stream timeout");
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, ?delay, "accept stream failed");
                    tokio::select! {
                        _ = session.closed() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            },
            Some(_) = streams.join_next(), if !streams.is_empty() => {}
        }
    }

    streams.shutdown().await;
    accepted
}

async fn relay_stream(session: TunnelSession, mut stream: TunnelStream, target: String) {
    let dialed = tokio::select! {
        _ = session.closed() => return,
        res = TcpStream::connect(&target) => res,
    };
    let mut conn = match dialed {
        Ok(conn) => conn,
        Err(e) => {
            // Dropping the stream resets it; the session stays up.
            warn!("Failed to connect to {}: {}", target, e);
            return;
        }
    };
    if let Err(e) = conn.set_nodelay(true) {
        debug!(%target, error = %e, "set_nodelay failed");
    }

    match copy_bidirectional(&mut stream, &mut conn).await {
        Ok((down, up)) => debug!(%target, up, down, "relay finished"),
        Err(e) => debug!(%target, error = %e, "relay ended"),
    }
}

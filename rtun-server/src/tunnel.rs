//! Tunnel acceptance and public port forwarding.
//!
//! Each authenticated tunnel connection becomes a server-role session plus a
//! public TCP listener on the port the client asked for. Every public
//! connection is forwarded through a freshly opened stream. The listener lives
//! exactly as long as the session: when the session closes the port is
//! released and all forwards on it are torn down.

use std::net::SocketAddr;
use std::sync::Arc;

use rtun_core::backoff::Backoff;
use rtun_core::{
    read_handshake, SessionConfig, ShutdownSignal, TokenValidator, TunnelError, TunnelSession,
};
use tokio::io::{copy_bidirectional, AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::tls;

/// The tunnel server.
pub struct TunnelServer {
    config: ServerConfig,
    validator: TokenValidator,
    session_config: SessionConfig,
    tls: Option<TlsAcceptor>,
    shutdown: ShutdownSignal,
}

impl TunnelServer {
    pub fn new(config: ServerConfig, shutdown: ShutdownSignal) -> Result<Self, TunnelError> {
        config.validate()?;
        let validator =
            TokenValidator::new(&config.token).map_err(|e| TunnelError::Config(e.to_string()))?;

        let tls = match config.tls_paths()? {
            Some((cert, key)) => Some(tls::load_tls_acceptor(cert, key)?),
            None => {
                warn!("Running with --insecure: tunnel traffic is not encrypted");
                None
            }
        };

        info!("Token fingerprint: {}", validator.fingerprint());

        Ok(Self {
            session_config: config.session_config(),
            config,
            validator,
            tls,
            shutdown,
        })
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Number of tunnels currently holding a public port.
    pub fn active_tunnels(&self) -> usize {
        self.shutdown.active_connection_count()
    }

    /// Bind the tunnel listener. Failure here is fatal for the process.
    pub async fn bind(&self) -> Result<TcpListener, TunnelError> {
        TcpListener::bind(&self.config.listen)
            .await
            .map_err(|e| TunnelError::Config(format!("cannot listen on {}: {}", self.config.listen, e)))
    }

    /// Accept tunnel connections until shutdown.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        match listener.local_addr() {
            Ok(addr) => info!("Tunnel server listening on {}", addr),
            Err(e) => warn!("Tunnel server listening on unknown address: {}", e),
        }

        let mut connections = JoinSet::new();
        let mut backoff = Backoff::accept();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                res = listener.accept() => match res {
                    Ok((stream, peer)) => {
                        backoff.reset();
                        let server = self.clone();
                        connections.spawn(async move {
                            server.handle_tunnel_connection(stream, peer).await;
                        });
                    }
                    Err(e) => {
                        let delay = backoff.next_delay();
                        warn!(error = %e, ?delay, "accept tunnel connection failed");
                        tokio::select! {
                            _ = self.shutdown.cancelled() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                },
                Some(res) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = res {
                        if e.is_panic() {
                            error!("tunnel task panicked: {}", e);
                        }
                    }
                }
            }
        }

        drop(listener);
        info!("Tunnel listener closed, waiting for {} tunnel(s)", connections.len());

        // Sessions hold child tokens of the shutdown signal, so they are already closing.
        if !self.shutdown.wait_for_drain().await {
            warn!("aborting {} tunnel task(s) still running", connections.len());
        }
        connections.shutdown().await;
        info!("Server stopped");
    }

    async fn handle_tunnel_connection(&self, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, error = %e, "set_nodelay failed");
        }

        match self.accept_tunnel(stream, peer).await {
            Ok(()) => {}
            Err(e @ TunnelError::AuthFailed) => warn!(%peer, "validate token failed: {}", e),
            Err(e @ TunnelError::HandshakeTimeout(_)) => warn!(%peer, "handshake timeout: {}", e),
            Err(e @ TunnelError::MalformedHandshake(_)) => warn!(%peer, "read handshake failed: {}", e),
            Err(e @ TunnelError::Tls(_)) => warn!(%peer, "TLS accept failed: {}", e),
            Err(e @ TunnelError::PortBindFailed { .. }) => error!(%peer, "{}", e),
            Err(e) => error!(%peer, category = %e.category(), "tunnel failed: {}", e),
        }
    }

    /// Serve a tunnel over a raw connection, running the TLS accept first when
    /// TLS is configured.
    ///
    /// The TLS accept and the handshake read share one deadline of
    /// `handshake_timeout`, counted from the moment this is called.
    pub async fn accept_tunnel<S>(&self, stream: S, peer: SocketAddr) -> Result<(), TunnelError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let deadline = Instant::now() + self.config.handshake_timeout();
        match &self.tls {
            Some(acceptor) => {
                let tls_stream = tokio::time::timeout_at(deadline, acceptor.accept(stream))
                    .await
                    .map_err(|_| TunnelError::HandshakeTimeout(self.config.handshake_timeout()))?
                    .map_err(|e| TunnelError::Tls(e.to_string()))?;
                self.serve_until(tls_stream, peer, deadline).await
            }
            None => self.serve_until(stream, peer, deadline).await,
        }
    }

    /// Serve a single tunnel over an already accepted (and decrypted) connection.
    ///
    /// Returns once the tunnel is fully torn down: the public port is released
    /// and every forward on it has finished.
    pub async fn serve_connection<S>(&self, io: S, peer: SocketAddr) -> Result<(), TunnelError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let deadline = Instant::now() + self.config.handshake_timeout();
        self.serve_until(io, peer, deadline).await
    }

    async fn serve_until<S>(
        &self,
        mut io: S,
        peer: SocketAddr,
        handshake_deadline: Instant,
    ) -> Result<(), TunnelError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let remaining = handshake_deadline.saturating_duration_since(Instant::now());
        let packet = read_handshake(&mut io, remaining)
            .await
            .map_err(|e| match e {
                TunnelError::HandshakeTimeout(_) => {
                    TunnelError::HandshakeTimeout(self.config.handshake_timeout())
                }
                other => other,
            })?;
        self.validator
            .verify(&packet.token_digest)
            .map_err(|_| TunnelError::AuthFailed)?;
        debug!(%peer, port = packet.port, "tunnel authenticated");

        let session = TunnelSession::server(io, &self.session_config, self.shutdown.token());

        let listener = match TcpListener::bind((self.config.public_host.as_str(), packet.port)).await {
            Ok(listener) => listener,
            Err(source) => {
                session.close();
                return Err(TunnelError::PortBindFailed {
                    port: packet.port,
                    source,
                });
            }
        };
        let port = listener.local_addr().map(|a| a.port()).unwrap_or(packet.port);

        let _guard = self.shutdown.register_connection();
        info!("Tunnel from {} listening on {}:{}", peer, self.config.public_host, port);

        serve_public(listener, &session, port).await;
        session.close();

        info!("Tunnel from {} on port {} closed", peer, port);
        Ok(())
    }
}

/// Accept public connections until the session closes.
async fn serve_public(listener: TcpListener, session: &TunnelSession, port: u16) {
    let mut forwards = JoinSet::new();
    let mut backoff = Backoff::accept();

    loop {
        tokio::select! {
            _ = session.closed() => {
                debug!(port, "session closed, releasing public port");
                break;
            }
            res = listener.accept() => match res {
                Ok((conn, remote)) => {
                    backoff.reset();
                    debug!(port, %remote, "public connection accepted");
                    forwards.spawn(forward(session.clone(), conn, remote));
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(port, error = %e, ?delay, "accept public connection failed");
                    tokio::select! {
                        _ = session.closed() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            },
            Some(_) = forwards.join_next(), if !forwards.is_empty() => {}
        }
    }

    drop(listener);
    forwards.shutdown().await;
}

/// Pipe one public connection through a new stream.
async fn forward(session: TunnelSession, mut conn: TcpStream, remote: SocketAddr) {
    if let Err(e) = conn.set_nodelay(true) {
        debug!(%remote, error = %e, "set_nodelay failed");
    }
    let mut stream = match session.open_stream().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(%remote, "open stream failed: {}", e);
            return;
        }
    };

    match copy_bidirectional(&mut conn, &mut stream).await {
        Ok((up, down)) => debug!(%remote, up, down, "public connection finished"),
        Err(e) => debug!(%remote, error = %e, "public connection ended"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_config;
    use rtun_core::write_handshake;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::sync::CancellationToken;

    /// Poll `f` until it holds or `within` elapses.
    async fn eventually(within: Duration, mut f: impl FnMut() -> bool) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        while tokio::time::Instant::now() < deadline {
            if f() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        f()
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    fn server(token: &str) -> Arc<TunnelServer> {
        Arc::new(TunnelServer::new(test_config(token), ShutdownSignal::new(2)).unwrap())
    }

    async fn free_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    /// Start a tunnel for `port` and return the client side of its session.
    async fn open_tunnel(
        server: &Arc<TunnelServer>,
        token: &str,
        port: u16,
        client_token: &CancellationToken,
    ) -> (TunnelSession, tokio::task::JoinHandle<Result<(), TunnelError>>) {
        let (mut client_io, server_io) = tokio::io::duplex(64 * 1024);
        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.serve_connection(server_io, peer()).await })
        };
        write_handshake(&mut client_io, port, token).await.unwrap();
        let session = TunnelSession::client(client_io, &SessionConfig::default(), client_token);
        (session, task)
    }

    /// Echo every stream the server opens on this session.
    fn spawn_echo(session: TunnelSession) {
        tokio::spawn(async move {
            while let Ok(mut stream) = session.accept_stream().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                                let _ = stream.flush().await;
                            }
                        }
                    }
                });
            }
        });
    }

    fn tls_server(token: &str) -> Arc<TunnelServer> {
        let config = ServerConfig {
            cert_path: Some(fixture("server.pem")),
            key_path: Some(fixture("server-key.pem")),
            insecure: false,
            ..test_config(token)
        };
        Arc::new(TunnelServer::new(config, ShutdownSignal::new(2)).unwrap())
    }

    fn fixture(name: &str) -> String {
        format!("{}/../testdata/tls/{}", env!("CARGO_MANIFEST_DIR"), name)
    }

    /// A TLS 1.3 client connector trusting the test CA.
    fn tls_connector() -> tokio_rustls::TlsConnector {
        let pem = std::fs::read(fixture("ca.pem")).unwrap();
        let mut roots = rustls::RootCertStore::empty();
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            roots.add(cert.unwrap()).unwrap();
        }
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = rustls::ClientConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13])
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();
        tokio_rustls::TlsConnector::from(Arc::new(config))
    }

    fn localhost() -> rustls::pki_types::ServerName<'static> {
        rustls::pki_types::ServerName::try_from("localhost").unwrap()
    }

    async fn roundtrip(port: u16, payload: &[u8]) -> Vec<u8> {
        let mut conn = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        conn.write_all(payload).await.unwrap();
        let mut buf = vec![0u8; payload.len()];
        conn.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn test_wrong_token_rejected() {
        let server = server("right");
        let (mut client_io, server_io) = tokio::io::duplex(1024);
        write_handshake(&mut client_io, free_port().await, "wrong")
            .await
            .unwrap();

        let res = server.serve_connection(server_io, peer()).await;
        assert!(matches!(res, Err(TunnelError::AuthFailed)));
        assert_eq!(server.active_tunnels(), 0);

        // The connection is dropped without any reply.
        let mut buf = [0u8; 1];
        assert_eq!(client_io.read(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_short_handshake_is_malformed() {
        let server = server("t");
        let (mut client_io, server_io) = tokio::io::duplex(1024);
        client_io.write_all(&[0u8; 10]).await.unwrap();
        drop(client_io);

        let res = server.serve_connection(server_io, peer()).await;
        assert!(matches!(res, Err(TunnelError::MalformedHandshake(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_client_times_out() {
        let server = server("t");
        let (_client_io, server_io) = tokio::io::duplex(1024);

        let res = server.serve_connection(server_io, peer()).await;
        assert!(matches!(res, Err(TunnelError::HandshakeTimeout(_))));
        assert_eq!(server.active_tunnels(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tls_and_handshake_share_one_deadline() {
        let server = tls_server("t");
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);

        // Finish TLS late, then never send the 34-byte handshake.
        let client = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(3)).await;
            let stream = tls_connector().connect(localhost(), client_io).await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(stream);
        });

        let started = tokio::time::Instant::now();
        let res = server.accept_tunnel(server_io, peer()).await;
        let elapsed = started.elapsed();
        assert!(matches!(res, Err(TunnelError::HandshakeTimeout(d)) if d == Duration::from_secs(5)));
        assert!(elapsed >= Duration::from_secs(5), "gave up early: {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(6), "deadline restarted after TLS: {:?}", elapsed);
        assert_eq!(server.active_tunnels(), 0);
        client.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_tls_accept_times_out() {
        let server = tls_server("t");
        let (_client_io, server_io) = tokio::io::duplex(1024);

        let res = server.accept_tunnel(server_io, peer()).await;
        assert!(matches!(res, Err(TunnelError::HandshakeTimeout(_))));
    }

    #[tokio::test]
    async fn test_tunnel_over_tls() {
        let server = tls_server("t");
        let port = free_port().await;
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.accept_tunnel(server_io, peer()).await })
        };

        let mut stream = tls_connector().connect(localhost(), client_io).await.unwrap();
        assert_eq!(
            stream.get_ref().1.protocol_version(),
            Some(rustls::ProtocolVersion::TLSv1_3)
        );
        write_handshake(&mut stream, port, "t").await.unwrap();
        let client_token = CancellationToken::new();
        let session = TunnelSession::client(stream, &SessionConfig::default(), &client_token);
        spawn_echo(session);

        assert!(eventually(Duration::from_secs(2), || server.active_tunnels() == 1).await);
        assert_eq!(roundtrip(port, b"encrypted").await, b"encrypted");

        client_token.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_public_connection_is_forwarded() {
        let server = server("t");
        let port = free_port().await;
        let client_token = CancellationToken::new();
        let (session, task) = open_tunnel(&server, "t", port, &client_token).await;
        spawn_echo(session);

        assert!(eventually(Duration::from_secs(2), || server.active_tunnels() == 1).await);
        assert_eq!(roundtrip(port, b"ping").await, b"ping");
        assert_eq!(roundtrip(port, b"second").await, b"second");

        client_token.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_port_contention_leaves_first_tunnel_intact() {
        let server = server("t");
        let port = free_port().await;
        let client_token = CancellationToken::new();

        let (first, first_task) = open_tunnel(&server, "t", port, &client_token).await;
        spawn_echo(first);
        assert!(eventually(Duration::from_secs(2), || server.active_tunnels() == 1).await);

        let (second, second_task) = open_tunnel(&server, "t", port, &client_token).await;
        let res = tokio::time::timeout(Duration::from_secs(2), second_task)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(res, Err(TunnelError::PortBindFailed { port: p, .. }) if p == port));
        tokio::time::timeout(Duration::from_secs(5), second.closed())
            .await
            .expect("rejected session was not closed");

        assert_eq!(server.active_tunnels(), 1);
        assert_eq!(roundtrip(port, b"still here").await, b"still here");

        client_token.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(5), first_task).await;
    }

    #[tokio::test]
    async fn test_session_close_releases_port() {
        let server = server("t");
        let port = free_port().await;
        let client_token = CancellationToken::new();
        let (session, task) = open_tunnel(&server, "t", port, &client_token).await;
        spawn_echo(session.clone());

        assert!(eventually(Duration::from_secs(2), || server.active_tunnels() == 1).await);
        let mut public = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        public.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        public.read_exact(&mut buf).await.unwrap();

        session.close();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("tunnel did not tear down")
            .unwrap()
            .unwrap();
        assert_eq!(server.active_tunnels(), 0);

        // In-flight forwards are gone and the port can be bound again.
        let mut rest = Vec::new();
        let _ = tokio::time::timeout(Duration::from_secs(2), public.read_to_end(&mut rest)).await;
        TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_tunnels() {
        let server = server("t");
        let port = free_port().await;
        let client_token = CancellationToken::new();
        let (session, task) = open_tunnel(&server, "t", port, &client_token).await;
        spawn_echo(session.clone());
        assert!(eventually(Duration::from_secs(2), || server.active_tunnels() == 1).await);

        server.shutdown_signal().initiate_shutdown();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), session.closed())
            .await
            .expect("client never saw the tunnel close");
        assert_eq!(server.active_tunnels(), 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let server = server("t");
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(server.clone().run(listener));

        let mut conn = TcpStream::connect(addr).await.unwrap();
        write_handshake(&mut conn, free_port().await, "t").await.unwrap();
        let client_token = CancellationToken::new();
        let session = TunnelSession::client(conn, &SessionConfig::default(), &client_token);
        assert!(eventually(Duration::from_secs(2), || server.active_tunnels() == 1).await);

        server.shutdown_signal().initiate_shutdown();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("server did not stop")
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), session.closed())
            .await
            .unwrap();
        assert!(TcpStream::connect(addr).await.is_err());
    }
}

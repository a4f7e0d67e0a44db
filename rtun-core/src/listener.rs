//! A listening-socket capability that both TCP listeners and tunnel sessions
//! can provide.
//!
//! Protocol servers that only know how to `accept()` connections (the SOCKS5
//! server, for one) are written against [`Listener`] and can then run on top of
//! a multiplexed session exactly as they would on a bound port.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use crate::multiplex::{SessionError, TunnelSession, TunnelStream};

/// Something that hands out duplex connections.
#[async_trait]
pub trait Listener: Send {
    type Conn: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Wait for the next connection.
    ///
    /// `BrokenPipe` means the listener is gone for good. `TimedOut` is
    /// transient.
    async fn accept(&mut self) -> io::Result<Self::Conn>;

    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Stop accepting. Idempotent.
    async fn close(&mut self) -> io::Result<()>;
}

#[async_trait]
impl Listener for TcpListener {
    type Conn = TcpStream;

    async fn accept(&mut self) -> io::Result<TcpStream> {
        TcpListener::accept(self).await.map(|(stream, _)| stream)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }

    async fn close(&mut self) -> io::Result<()> {
        // The socket is released on drop.
        Ok(())
    }
}

/// Exposes the inbound streams of a session as a [`Listener`].
pub struct SessionListener {
    session: TunnelSession,
}

impl SessionListener {
    pub fn new(session: TunnelSession) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &TunnelSession {
        &self.session
    }
}

impl From<SessionError> for io::Error {
    fn from(err: SessionError) -> Self {
        let kind = match err {
            SessionError::Closed => io::ErrorKind::BrokenPipe,
            SessionError::Timeout => io::ErrorKind::TimedOut,
            SessionError::Multiplex(_) => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

#[async_trait]
impl Listener for SessionListener {
    type Conn = TunnelStream;

    async fn accept(&mut self) -> io::Result<TunnelStream> {
        Ok(self.session.accept_stream().await?)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.session
            .local_addr()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "session has no local address"))
    }

    async fn close(&mut self) -> io::Result<()> {
        self.session.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiplex::SessionConfig;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio_util::sync::CancellationToken;

    #[tokio::test]
    async fn test_session_listener_accepts_streams() {
        let token = CancellationToken::new();
        let (a, b) = tokio::io::duplex(64 * 1024);
        let config = SessionConfig::default();
        let client = TunnelSession::client(a, &config, &token);
        let server = TunnelSession::server(b, &config, &token);
        client.set_local_addr("127.0.0.1:4000".parse().unwrap());

        let mut listener = SessionListener::new(client);
        assert_eq!(listener.local_addr().unwrap().port(), 4000);

        let mut opened = server.open_stream().await.unwrap();
        opened.write_all(b"hi").await.unwrap();
        assert!(listener.accept().await.is_ok());
        token.cancel();
    }

    #[tokio::test]
    async fn test_closed_session_maps_to_broken_pipe() {
        let token = CancellationToken::new();
        let (a, _b) = tokio::io::duplex(1024);
        let session = TunnelSession::client(a, &SessionConfig::default(), &token);
        let mut listener = SessionListener::new(session);

        listener.close().await.unwrap();
        let err = tokio::time::timeout(Duration::from_secs(1), listener.accept())
            .await
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
        assert!(listener.local_addr().is_err());
    }

    #[test]
    fn test_timeout_maps_to_timed_out() {
        let err: io::Error = SessionError::Timeout.into();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}

//! A small SOCKS5 server (RFC 1928): no authentication, CONNECT only.
//!
//! It is written against [`Listener`], so the same code serves plain TCP in
//! tests and the streams of a tunnel session in proxy mode.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use rtun_core::backoff::Backoff;
use rtun_core::Listener;
use tokio::io::{copy_bidirectional, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const SOCKS_VERSION: u8 = 0x05;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NOT_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_HOST_UNREACHABLE: u8 = 0x04;
pub const REPLY_CONNECTION_REFUSED: u8 = 0x05;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// Destination requested by a CONNECT.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    Ip(SocketAddr),
    Domain(String, u16),
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TargetAddr::Ip(addr) => write!(f, "{}", addr),
            TargetAddr::Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

/// Serve SOCKS5 clients from `listener` until it closes or `shutdown` fires.
///
/// Returns the number of connections accepted.
pub async fn serve<L: Listener>(mut listener: L, shutdown: CancellationToken) -> usize {
    let mut clients = JoinSet::new();
    let mut backoff = Backoff::accept();
    let mut accepted = 0;

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            res = listener.accept() => match res {
                Ok(conn) => {
                    backoff.reset();
                    accepted += 1;
                    clients.spawn(async move {
                        if let Err(e) = handle_client(conn).await {
                            debug!("socks5 request failed: {}", e);
                        }
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {
                    debug!("socks5 listener closed");
                    break;
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => continue,
                Err(e) => {
                    let delay = backoff.next_delay();
                    warn!(error = %e, ?delay, "socks5 accept failed");
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            },
            Some(_) = clients.join_next(), if !clients.is_empty() => {}
        }
    }

    if let Err(e) = listener.close().await {
        debug!("close socks5 listener: {}", e);
    }
    clients.shutdown().await;
    accepted
}

/// Run one SOCKS5 exchange on `client` and then relay it to the target.
pub async fn handle_client<S>(mut client: S) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Greeting: VER NMETHODS METHODS...
    let mut header = [0u8; 2];
    client.read_exact(&mut header).await?;
    if header[0] != SOCKS_VERSION {
        return Err(invalid(format!("unsupported SOCKS version: {}", header[0])));
    }
    let mut methods = vec![0u8; header[1] as usize];
    client.read_exact(&mut methods).await?;

    if !methods.contains(&METHOD_NO_AUTH) {
        client
            .write_all(&[SOCKS_VERSION, METHOD_NOT_ACCEPTABLE])
            .await?;
        client.flush().await?;
        return Err(invalid("client offers no acceptable auth method"));
    }
    client.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
    client.flush().await?;

    // Request: VER CMD RSV ATYP DST.ADDR DST.PORT
    let mut request = [0u8; 4];
    client.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION {
        return Err(invalid("invalid SOCKS version in request"));
    }
    if request[1] != CMD_CONNECT {
        write_reply(&mut client, REPLY_COMMAND_NOT_SUPPORTED, None).await?;
        return Err(invalid(format!("unsupported command: {}", request[1])));
    }

    let target = match request[3] {
        ATYP_IPV4 => {
            let mut ip = [0u8; 4];
            client.read_exact(&mut ip).await?;
            let port = client.read_u16().await?;
            TargetAddr::Ip(SocketAddr::from((Ipv4Addr::from(ip), port)))
        }
        ATYP_DOMAIN => {
            let len = client.read_u8().await? as usize;
            let mut domain = vec![0u8; len];
            client.read_exact(&mut domain).await?;
            let port = client.read_u16().await?;
            let domain = String::from_utf8(domain).map_err(|_| invalid("domain is not UTF-8"))?;
            TargetAddr::Domain(domain, port)
        }
        ATYP_IPV6 => {
            let mut ip = [0u8; 16];
            client.read_exact(&mut ip).await?;
            let port = client.read_u16().await?;
            TargetAddr::Ip(SocketAddr::from((Ipv6Addr::from(ip), port)))
        }
        atyp => {
            write_reply(&mut client, REPLY_ADDRESS_NOT_SUPPORTED, None).await?;
            return Err(invalid(format!("unsupported address type: {}", atyp)));
        }
    };

    debug!(%target, "socks5 connect");
    let dialed = match &target {
        TargetAddr::Ip(addr) => TcpStream::connect(addr).await,
        TargetAddr::Domain(host, port) => TcpStream::connect((host.as_str(), *port)).await,
    };
    let mut upstream = match dialed {
        Ok(stream) => stream,
        Err(e) => {
            write_reply(&mut client, reply_code(&e), None).await?;
            return Err(e);
        }
    };

    write_reply(&mut client, REPLY_SUCCEEDED, upstream.local_addr().ok()).await?;

    let (up, down) = copy_bidirectional(&mut client, &mut upstream).await?;
    debug!(%target, up, down, "socks5 connection finished");
    Ok(())
}

fn reply_code(err: &io::Error) -> u8 {
    match err.kind() {
        io::ErrorKind::ConnectionRefused => REPLY_CONNECTION_REFUSED,
        // Resolution failures, timeouts and unreachable networks.
        _ => REPLY_HOST_UNREACHABLE,
    }
}

async fn write_reply<W>(w: &mut W, code: u8, bound: Option<SocketAddr>) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut reply = vec![SOCKS_VERSION, code, 0x00];
    match bound {
        Some(SocketAddr::V6(addr)) => {
            reply.push(ATYP_IPV6);
            reply.extend_from_slice(&addr.ip().octets());
            reply.extend_from_slice(&addr.port().to_be_bytes());
        }
        Some(SocketAddr::V4(addr)) => {
            reply.push(ATYP_IPV4);
            reply.extend_from_slice(&addr.ip().octets());
            reply.extend_from_slice(&addr.port().to_be_bytes());
        }
        None => {
            reply.push(ATYP_IPV4);
            reply.extend_from_slice(&[0, 0, 0, 0, 0, 0]);
        }
    }
    w.write_all(&reply).await?;
    w.flush().await
}

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

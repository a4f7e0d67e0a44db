//! Wire protocol for tunnel communication.
//!
//! A tunnel connection starts with exactly one fixed-size handshake packet,
//! written by the client before any multiplexed traffic:
//!
//! ```text
//! offset 0   token digest   [32 bytes]
//! offset 32  port           [u16, big-endian]
//! ```
//!
//! The server never answers the handshake. A rejected client simply sees the
//! connection close.

use std::time::Duration;

use bytes::{Buf, BufMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::auth::{TokenDigest, DIGEST_LEN};
use crate::error::TunnelError;

/// Size of an encoded handshake packet.
pub const HANDSHAKE_LEN: usize = DIGEST_LEN + 2;

/// Default time a server waits for the handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Handshake sent once per tunnel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakePacket {
    /// Digest of the shared secret.
    pub token_digest: TokenDigest,
    /// Public port the client wants the server to listen on.
    pub port: u16,
}

impl HandshakePacket {
    /// Build a packet for `port`, digesting `token`.
    pub fn new(port: u16, token: &str) -> Self {
        Self {
            token_digest: TokenDigest::of(token),
            port,
        }
    }

    /// Encode to the 34-byte wire form.
    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut out = [0u8; HANDSHAKE_LEN];
        let mut buf = &mut out[..];
        buf.put_slice(self.token_digest.as_bytes());
        buf.put_u16(self.port);
        out
    }

    /// Decode from the wire form.
    pub fn decode(mut data: &[u8]) -> Result<Self, TunnelError> {
        if data.len() < HANDSHAKE_LEN {
            return Err(TunnelError::MalformedHandshake(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("expected {} bytes, got {}", HANDSHAKE_LEN, data.len()),
            )));
        }
        let mut token = [0u8; DIGEST_LEN];
        data.copy_to_slice(&mut token);
        let port = data.get_u16();
        Ok(Self {
            token_digest: TokenDigest(token),
            port,
        })
    }
}

/// Write the handshake for `port` on a freshly established tunnel connection.
pub async fn write_handshake<W>(io: &mut W, port: u16, token: &str) -> Result<(), TunnelError>
where
    W: AsyncWrite + Unpin,
{
    let packet = HandshakePacket::new(port, token);
    io.write_all(&packet.encode()).await?;
    io.flush().await?;
    Ok(())
}

/// Read the handshake, giving up after `deadline`.
pub async fn read_handshake<R>(io: &mut R, deadline: Duration) -> Result<HandshakePacket, TunnelError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = [0u8; HANDSHAKE_LEN];
    match tokio::time::timeout(deadline, io.read_exact(&mut buf)).await {
        Err(_) => Err(TunnelError::HandshakeTimeout(deadline)),
        Ok(Err(e)) => Err(TunnelError::MalformedHandshake(e)),
        Ok(Ok(_)) => HandshakePacket::decode(&buf),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_layout() {
        let packet = HandshakePacket::new(0x1234, "token");
        let bytes = packet.encode();
        assert_eq!(bytes.len(), 34);
        assert_eq!(&bytes[..32], TokenDigest::of("token").as_bytes());
        assert_eq!(&bytes[32..], &[0x12, 0x34]);
    }

    #[test]
    fn test_round_trip_port_extremes() {
        for port in [0u16, 1, 80, 9000, 65535] {
            let packet = HandshakePacket::new(port, "s");
            let decoded = HandshakePacket::decode(&packet.encode()).unwrap();
            assert_eq!(decoded, packet);
        }
    }

    #[test]
    fn test_decode_short_input() {
        let err = HandshakePacket::decode(&[0u8; 33]).unwrap_err();
        assert!(matches!(err, TunnelError::MalformedHandshake(_)));
    }

    #[tokio::test]
    async fn test_write_then_read() {
        let (mut client, mut server) = tokio::io::duplex(64);
        write_handshake(&mut client, 9000, "secret").await.unwrap();
        let packet = read_handshake(&mut server, DEFAULT_HANDSHAKE_TIMEOUT)
            .await
            .unwrap();
        assert_eq!(packet.port, 9000);
        assert_eq!(packet.token_digest, TokenDigest::of("secret"));
    }

    #[tokio::test]
    async fn test_truncated_handshake_is_malformed() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&[1, 2, 3]).await.unwrap();
        drop(client);
        let err = read_handshake(&mut server, DEFAULT_HANDSHAKE_TIMEOUT)
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::MalformedHandshake(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peer_times_out() {
        let (_client, mut server) = tokio::io::duplex(64);
        let err = read_handshake(&mut server, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::HandshakeTimeout(d) if d == Duration::from_secs(5)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_but_timely_handshake_succeeds() {
        let (mut client, mut server) = tokio::io::duplex(64);
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(4900)).await;
            write_handshake(&mut client, 443, "secret").await.unwrap();
            client
        });
        let packet = read_handshake(&mut server, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(packet.port, 443);
        drop(writer.await.unwrap());
    }
}

//! Core types and protocols for the rtun reverse tunnel.
//!
//! This crate provides shared functionality between the tunnel server and client,
//! including the handshake wire format, authentication, the multiplexed session
//! adapter and the shutdown plumbing.

pub mod auth;
pub mod backoff;
pub mod error;
pub mod listener;
pub mod multiplex;
pub mod protocol;
pub mod shutdown;

pub use auth::{digest, TokenDigest, TokenValidator};
pub use error::{ErrorCategory, TunnelError, TunnelResult};
pub use listener::{Listener, SessionListener};
pub use multiplex::{Role, SessionConfig, SessionError, TunnelSession, TunnelStream};
pub use protocol::{read_handshake, write_handshake, HandshakePacket};
pub use shutdown::{ConnectionGuard, ShutdownSignal};

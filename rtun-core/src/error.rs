//! Error types for the tunnel system.
//!
//! Every failure is classified into an [`ErrorCategory`] so callers can decide
//! at the boundary where it happened whether to retry, drop a single stream,
//! or tear down a whole tunnel.

use std::fmt;
use std::time::Duration;

use thiserror::Error;

use crate::multiplex::SessionError;

/// Error categories for the tunnel system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Authentication-related errors.
    Authentication,
    /// Connection and network errors.
    Connection,
    /// Protocol parsing/validation errors.
    Protocol,
    /// Configuration errors.
    Configuration,
    /// A local resource (usually a port) could not be acquired.
    Resource,
    /// Timeout errors.
    Timeout,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Authentication => write!(f, "authentication"),
            ErrorCategory::Connection => write!(f, "connection"),
            ErrorCategory::Protocol => write!(f, "protocol"),
            ErrorCategory::Configuration => write!(f, "configuration"),
            ErrorCategory::Resource => write!(f, "resource"),
            ErrorCategory::Timeout => write!(f, "timeout"),
        }
    }
}

/// A tunnel error.
#[derive(Debug, Error)]
pub enum TunnelError {
    /// The handshake packet was short, truncated or unreadable.
    #[error("malformed handshake: {0}")]
    MalformedHandshake(#[source] std::io::Error),

    /// The presented token digest does not match the configured one.
    #[error("token digest mismatch")]
    AuthFailed,

    /// No complete handshake arrived within the deadline.
    #[error("no handshake within {0:?}")]
    HandshakeTimeout(Duration),

    /// The requested public port could not be bound.
    #[error("failed to bind public port {port}: {source}")]
    PortBindFailed {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    /// The multiplexed session failed or went away.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A TCP dial did not succeed.
    #[error("failed to dial {addr}: {source}")]
    DialFailed {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// Transport encryption could not be established.
    #[error("tls: {0}")]
    Tls(String),

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The operation was abandoned because shutdown was requested.
    #[error("cancelled")]
    Cancelled,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl TunnelError {
    /// The category of this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            TunnelError::MalformedHandshake(_) => ErrorCategory::Protocol,
            TunnelError::AuthFailed => ErrorCategory::Authentication,
            TunnelError::HandshakeTimeout(_) => ErrorCategory::Timeout,
            TunnelError::PortBindFailed { .. } => ErrorCategory::Resource,
            TunnelError::Session(SessionError::Timeout) => ErrorCategory::Timeout,
            TunnelError::Session(_) => ErrorCategory::Connection,
            TunnelError::DialFailed { .. } => ErrorCategory::Connection,
            TunnelError::Tls(_) => ErrorCategory::Connection,
            TunnelError::Config(_) => ErrorCategory::Configuration,
            TunnelError::Cancelled => ErrorCategory::Connection,
            TunnelError::Io(_) => ErrorCategory::Connection,
        }
    }

    /// Check if this is a retryable error.
    ///
    /// Authentication, protocol and configuration failures will fail the
    /// same way on every attempt.
    pub fn is_retryable(&self) -> bool {
        if matches!(self, TunnelError::Cancelled) {
            return false;
        }
        matches!(
            self.category(),
            ErrorCategory::Connection | ErrorCategory::Timeout | ErrorCategory::Resource
        )
    }
}

/// Result type using TunnelError.
pub type TunnelResult<T> = Result<T, TunnelError>;

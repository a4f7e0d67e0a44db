//! rtun server - the public side of the reverse tunnel.
//!
//! Accepts authenticated tunnel connections, binds the public port each one
//! asks for and forwards every public connection through the tunnel.

pub mod config;
pub mod tls;
pub mod tunnel;

pub use config::ServerConfig;
pub use tunnel::TunnelServer;

//! rtun client - the NAT side of the reverse tunnel.
//!
//! Opens one tunnel per configured entry. Relay entries forward every stream
//! to a fixed local target; proxy entries run a SOCKS5 server on the streams.

pub mod config;
pub mod socks5;
pub mod tls;
pub mod tunnel;

pub use config::{ClientConfig, RelayEntry, WorkerEntry, WorkerKind};
pub use tunnel::TunnelClient;

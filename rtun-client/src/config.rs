//! Client configuration.

use std::collections::HashSet;
use std::time::Duration;

use clap::Parser;
use rtun_core::multiplex::SessionConfig;
use rtun_core::TunnelError;

/// A relay mapping: a public port on the server forwarded to a fixed target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayEntry {
    /// Port the server exposes publicly
    pub remote_port: u16,
    /// `host:port` every stream is relayed to
    pub target_addr: String,
}

impl std::str::FromStr for RelayEntry {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // Format: "remote_port:target_host:target_port"
        let (port_str, target) = s
            .split_once(':')
            .ok_or_else(|| format!("Invalid relay '{}': expected PORT:HOST:PORT", s))?;
        let remote_port = port_str
            .parse::<u16>()
            .map_err(|_| format!("Invalid port number: {}", port_str))?;
        if target.is_empty() || !target.contains(':') {
            return Err(format!("Invalid relay target '{}': expected HOST:PORT", target));
        }
        Ok(RelayEntry {
            remote_port,
            target_addr: target.to_string(),
        })
    }
}

/// What a worker does with the streams of its tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerKind {
    Relay { target_addr: String },
    Proxy,
}

/// One tunnel the client keeps open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerEntry {
    pub remote_port: u16,
    pub kind: WorkerKind,
}

/// rtun client - expose local services or a SOCKS5 proxy through a server.
#[derive(Parser, Debug, Clone)]
#[command(name = "rtun-client")]
#[command(author, version, about, long_about = None)]
pub struct ClientConfig {
    /// Tunnel server address (host:port)
    #[arg(short, long, env = "RTUN_SERVER", default_value = "127.0.0.1:7835")]
    pub server: String,

    /// Shared secret configured on the server
    #[arg(short, long, env = "RTUN_TOKEN")]
    pub token: String,

    /// Relays to open.
    /// Format: REMOTE_PORT:TARGET_HOST:TARGET_PORT
    /// Example: --relays 9000:127.0.0.1:7000,9001:db.local:5432
    #[arg(long, env = "RTUN_RELAYS", value_delimiter = ',', value_parser = parse_relay_entry)]
    pub relays: Vec<RelayEntry>,

    /// Server ports that expose a SOCKS5 proxy running on this client
    #[arg(long, env = "RTUN_PROXIES", value_delimiter = ',')]
    pub proxies: Vec<u16>,

    /// CA certificate (PEM) the server certificate must chain to
    #[arg(long, env = "RTUN_CA_CERT")]
    pub ca_cert: Option<String>,

    /// Connect without TLS (insecure, for development only)
    #[arg(long, env = "RTUN_INSECURE")]
    pub insecure: bool,

    /// Name the server certificate is verified against
    #[arg(long, env = "RTUN_SERVER_NAME", default_value = "localhost")]
    pub server_name: String,

    /// Redial the server with exponential backoff when a tunnel fails
    #[arg(long, env = "RTUN_RECONNECT")]
    pub reconnect: bool,

    /// Seconds between keep-alive pings on a tunnel
    #[arg(long, env = "RTUN_KEEP_ALIVE_INTERVAL", default_value = "1")]
    pub keep_alive_interval: u64,

    /// Seconds a stalled tunnel is tolerated before it is dropped
    #[arg(long, env = "RTUN_KEEP_ALIVE_TIMEOUT", default_value = "5")]
    pub keep_alive_timeout: u64,

    /// Enable debug logging
    #[arg(long, env = "RTUN_DEBUG")]
    pub debug: bool,
}

fn parse_relay_entry(s: &str) -> Result<RelayEntry, String> {
    s.parse()
}

impl ClientConfig {
    /// All workers, relays first.
    pub fn entries(&self) -> Vec<WorkerEntry> {
        let relays = self.relays.iter().map(|r| WorkerEntry {
            remote_port: r.remote_port,
            kind: WorkerKind::Relay {
                target_addr: r.target_addr.clone(),
            },
        });
        let proxies = self.proxies.iter().map(|&port| WorkerEntry {
            remote_port: port,
            kind: WorkerKind::Proxy,
        });
        relays.chain(proxies).collect()
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            keep_alive_interval: Duration::from_secs(self.keep_alive_interval),
            keep_alive_timeout: Duration::from_secs(self.keep_alive_timeout),
            ..SessionConfig::default()
        }
    }

    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.token.is_empty() {
            return Err(TunnelError::Config("token must not be empty".to_string()));
        }
        if self.relays.is_empty() && self.proxies.is_empty() {
            return Err(TunnelError::Config(
                "nothing to do: pass --relays and/or --proxies".to_string(),
            ));
        }
        match (self.insecure, &self.ca_cert) {
            (false, None) => {
                return Err(TunnelError::Config(
                    "TLS requires --ca-cert (or --insecure for plaintext)".to_string(),
                ))
            }
            (true, Some(_)) => {
                return Err(TunnelError::Config(
                    "--insecure cannot be combined with --ca-cert".to_string(),
                ))
            }
            _ => {}
        }
        if self.keep_alive_interval == 0 || self.keep_alive_timeout < self.keep_alive_interval {
            return Err(TunnelError::Config(
                "keep-alive timeout must be >= keep-alive interval > 0".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for entry in self.entries() {
            if entry.remote_port != 0 && !seen.insert(entry.remote_port) {
                return Err(TunnelError::Config(format!(
                    "remote port {} is requested twice",
                    entry.remote_port
                )));
            }
        }
        Ok(())
    }
}

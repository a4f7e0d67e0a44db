//! Server configuration.

use std::time::Duration;

use clap::Parser;
use rtun_core::multiplex::SessionConfig;
use rtun_core::TunnelError;

/// rtun server - accept tunnels and expose their ports publicly.
#[derive(Parser, Debug, Clone)]
#[command(name = "rtun-server")]
#[command(author, version, about, long_about = None)]
pub struct ServerConfig {
    /// Address tunnel clients connect to
    #[arg(short, long, env = "RTUN_LISTEN", default_value = "0.0.0.0:7835")]
    pub listen: String,

    /// Shared secret; clients must present its digest
    #[arg(short, long, env = "RTUN_TOKEN")]
    pub token: String,

    /// Interface public listeners bind on
    #[arg(long, env = "RTUN_PUBLIC_HOST", default_value = "0.0.0.0")]
    pub public_host: String,

    /// Seconds a new connection has to complete its handshake
    #[arg(long, env = "RTUN_HANDSHAKE_TIMEOUT", default_value = "5")]
    pub handshake_timeout: u64,

    /// Seconds between keep-alive pings on a tunnel
    #[arg(long, env = "RTUN_KEEP_ALIVE_INTERVAL", default_value = "1")]
    pub keep_alive_interval: u64,

    /// Seconds a stalled tunnel is tolerated before it is dropped
    #[arg(long, env = "RTUN_KEEP_ALIVE_TIMEOUT", default_value = "5")]
    pub keep_alive_timeout: u64,

    /// Path to TLS certificate file (PEM format)
    #[arg(long, env = "RTUN_CERT_PATH")]
    pub cert_path: Option<String>,

    /// Path to TLS private key file (PEM format)
    #[arg(long, env = "RTUN_KEY_PATH")]
    pub key_path: Option<String>,

    /// Accept plaintext tunnels without TLS (development only)
    #[arg(long, env = "RTUN_INSECURE")]
    pub insecure: bool,

    /// Enable debug logging
    #[arg(long, env = "RTUN_DEBUG")]
    pub debug: bool,
}

impl ServerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout)
    }

    /// Session settings for every accepted tunnel.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            keep_alive_interval: Duration::from_secs(self.keep_alive_interval),
            keep_alive_timeout: Duration::from_secs(self.keep_alive_timeout),
            ..SessionConfig::default()
        }
    }

    /// TLS material. `None` only when running with `--insecure`.
    pub fn tls_paths(&self) -> Result<Option<(&str, &str)>, TunnelError> {
        match (&self.cert_path, &self.key_path) {
            (Some(cert), Some(key)) if !self.insecure => Ok(Some((cert.as_str(), key.as_str()))),
            (None, None) if self.insecure => Ok(None),
            (None, None) => Err(TunnelError::Config(
                "TLS requires --cert-path and --key-path (or --insecure for plaintext)".to_string(),
            )),
            (Some(_), Some(_)) => Err(TunnelError::Config(
                "--insecure cannot be combined with --cert-path/--key-path".to_string(),
            )),
            _ => Err(TunnelError::Config(
                "--cert-path and --key-path must be given together".to_string(),
            )),
        }
    }

    pub fn validate(&self) -> Result<(), TunnelError> {
        if self.token.is_empty() {
            return Err(TunnelError::Config("token must not be empty".to_string()));
        }
        if self.handshake_timeout == 0 {
            return Err(TunnelError::Config(
                "handshake timeout must be at least one second".to_string(),
            ));
        }
        if self.keep_alive_interval == 0 || self.keep_alive_timeout < self.keep_alive_interval {
            return Err(TunnelError::Config(
                "keep-alive timeout must be >= keep-alive interval > 0".to_string(),
            ));
        }
        self.tls_paths()?;
        Ok(())
    }
}

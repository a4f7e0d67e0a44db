//! TLS connector with a pinned CA certificate.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rtun_core::TunnelError;
use rustls::pki_types::ServerName;
use rustls::RootCertStore;
use tokio_rustls::TlsConnector;
use tracing::info;

/// Build a TLS 1.3-only connector trusting only the certificates in `ca_path`.
pub fn load_tls_connector(
    ca_path: &str,
    server_name: &str,
) -> Result<(TlsConnector, ServerName<'static>), TunnelError> {
    let file = File::open(ca_path)
        .map_err(|e| TunnelError::Config(format!("cannot open {}: {}", ca_path, e)))?;
    let mut reader = BufReader::new(file);

    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        roots
            .add(cert?)
            .map_err(|e| TunnelError::Tls(format!("bad CA certificate: {}", e)))?;
    }
    if roots.is_empty() {
        return Err(TunnelError::Config(format!("No certificates found in {}", ca_path)));
    }

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TunnelError::Tls(e.to_string()))?
        .with_root_certificates(roots)
        .with_no_client_auth();

    let name = ServerName::try_from(server_name.to_string())
        .map_err(|e| TunnelError::Config(format!("invalid server name {}: {}", server_name, e)))?;

    info!("Loaded CA certificate from {}", ca_path);
    Ok((TlsConnector::from(Arc::new(config)), name))
}

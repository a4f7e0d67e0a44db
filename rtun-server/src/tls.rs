//! TLS configuration and certificate management.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rtun_core::TunnelError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls_pemfile::{certs, private_key};
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// Load a TLS 1.3-only acceptor from certificate and key files.
pub fn load_tls_acceptor(cert_path: &str, key_path: &str) -> Result<TlsAcceptor, TunnelError> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let config = rustls::ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| TunnelError::Tls(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| TunnelError::Tls(e.to_string()))?;

    info!("TLS configuration loaded successfully");
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Load certificates from a PEM file.
fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, TunnelError> {
    let file = File::open(Path::new(path))
        .map_err(|e| TunnelError::Config(format!("cannot open {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = certs(&mut reader)
        .filter_map(|cert| cert.ok())
        .collect();

    if certs.is_empty() {
        return Err(TunnelError::Config(format!("No certificates found in {}", path)));
    }

    info!("Loaded {} certificate(s) from {}", certs.len(), path);
    Ok(certs)
}

/// Load a private key from a PEM file.
fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>, TunnelError> {
    let file = File::open(Path::new(path))
        .map_err(|e| TunnelError::Config(format!("cannot open {}: {}", path, e)))?;
    let mut reader = BufReader::new(file);

    let key = private_key(&mut reader)?
        .ok_or_else(|| TunnelError::Config(format!("No private key found in {}", path)))?;

    info!("Loaded private key from {}", path);
    Ok(key)
}

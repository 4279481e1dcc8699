//! Server TLS setup for the QUIC endpoint.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Build a rustls server config from PEM files.  Both paths are required.
pub fn server_config(cert: Option<&Path>, key: Option<&Path>) -> Result<rustls::ServerConfig> {
    let cert = cert.ok_or_else(|| anyhow!("tls_cert is required"))?;
    let key = key.ok_or_else(|| anyhow!("tls_key is required"))?;

    let chain = CertificateDer::pem_file_iter(cert)
        .with_context(|| format!("Failed to open {}", cert.display()))?
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificates in {}", cert.display()))?;
    if chain.is_empty() {
        return Err(anyhow!("no certificates in {}", cert.display()));
    }
    let key = PrivateKeyDer::from_pem_file(key)
        .with_context(|| format!("Failed to parse private key {}", key.display()))?;

    rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .context("certificate and key do not form a valid server identity")
}

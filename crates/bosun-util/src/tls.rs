//! Mutual-TLS configuration for both ends of the job manager connection.
//!
//! The server requires and verifies a client certificate against the
//! configured CA; the client verifies the server against the same CA. The
//! subject common name of the client certificate becomes the caller's user
//! identity on the server side.

use crate::fs::Fs;
use anyhow::{Context as _, Result};
use std::path::Path;
use tonic::transport::{Certificate, ClientTlsConfig, Identity, ServerTlsConfig};

/// Build the server-side TLS configuration: present `cert`/`key`, and demand
/// a client certificate signed by `ca_cert`.
pub fn server_config(ca_cert: &Path, cert: &Path, key: &Path) -> Result<ServerTlsConfig> {
    let fs = Fs::new();
    let ca = fs.read(ca_cert).context("loading CA certificate")?;
    let identity = load_identity(&fs, cert, key)?;
    Ok(ServerTlsConfig::new()
        .identity(identity)
        .client_ca_root(Certificate::from_pem(ca)))
}

/// Build the client-side TLS configuration: present `cert`/`key` and verify
/// the server against `ca_cert`. `domain` overrides the name the server
/// certificate is checked against; by default the dialed host is used.
pub fn client_config(
    ca_cert: &Path,
    cert: &Path,
    key: &Path,
    domain: Option<&str>,
) -> Result<ClientTlsConfig> {
    let fs = Fs::new();
    let ca = fs.read(ca_cert).context("loading CA certificate")?;
    let identity = load_identity(&fs, cert, key)?;
    let mut config = ClientTlsConfig::new()
        .identity(identity)
        .ca_certificate(Certificate::from_pem(ca));
    if let Some(domain) = domain {
        config = config.domain_name(domain);
    }
    Ok(config)
}

fn load_identity(fs: &Fs, cert: &Path, key: &Path) -> Result<Identity> {
    let cert = fs.read(cert).context("loading certificate")?;
    let key = fs.read(key).context("loading private key")?;
    Ok(Identity::from_pem(cert, key))
}

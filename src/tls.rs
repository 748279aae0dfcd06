//! TLS context construction for both sides of the forwarder.
//!
//! The server context terminates inbound TLS on the listener; the client
//! context originates TLS toward the target, trusting the bundled web PKI
//! roots plus any extra CA bundle supplied by the operator.

use std::path::Path;

use rustls::pki_types::{CertificateDer, ServerName};
use rustls::{ClientConfig, RootCertStore, ServerConfig};

use crate::error::{Error, Result};

/// Load a server context from PEM files.
///
/// When `key_path` is `None` the private key is expected in the same file as
/// the certificate chain.
pub fn load_server_config(cert_path: &Path, key_path: Option<&Path>) -> Result<ServerConfig> {
    let cert_pem = read_pem(cert_path)?;
    let key_pem = match key_path {
        Some(path) => read_pem(path)?,
        None => cert_pem.clone(),
    };
    build_server_config(&cert_pem, &key_pem)
}

/// Parse PEM certificate chain and private key, then build a rustls ServerConfig.
pub fn build_server_config(cert_pem: &[u8], key_pem: &[u8]) -> Result<ServerConfig> {
    let certs = parse_certs(cert_pem)?;

    let key = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| Error::CertParse(format!("failed to parse private key PEM: {e}")))?
        .ok_or_else(|| Error::CertParse("no private key found in PEM".into()))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::Tls(format!("failed to build TLS server config: {e}")))?;

    Ok(config)
}

/// Load a client context, optionally trusting an extra CA bundle from disk.
pub fn load_client_config(ca_path: Option<&Path>) -> Result<ClientConfig> {
    let extra = ca_path.map(read_pem).transpose()?;
    build_client_config(extra.as_deref())
}

/// Build a client context trusting the web PKI roots and `extra_ca_pem`.
pub fn build_client_config(extra_ca_pem: Option<&[u8]>) -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    if let Some(pem) = extra_ca_pem {
        for cert in parse_certs(pem)? {
            roots
                .add(cert)
                .map_err(|e| Error::CertParse(format!("invalid CA certificate: {e}")))?;
        }
    }

    Ok(ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth())
}

/// Resolve the name presented to (and verified against) the target.
pub fn server_name(name: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(name.to_string())
        .map_err(|e| Error::Config(format!("invalid TLS server name '{name}': {e}")))
}

fn parse_certs(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::CertParse(format!("failed to parse certificate PEM: {e}")))?;

    if certs.is_empty() {
        return Err(Error::CertParse("no certificates found in PEM".into()));
    }
    Ok(certs)
}

fn read_pem(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path)
        .map_err(|e| Error::Config(format!("failed to read '{}': {e}", path.display())))
}

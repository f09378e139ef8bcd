//! TLS acceptor for the attachment listener

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info};
use wgmesh_common::{Error, Result};

fn open(path: &Path, what: &str) -> Result<BufReader<File>> {
    if !path.is_file() {
        return Err(Error::config(format!(
            "You need to provide an ssl certificate for the controller's webserver ({}). \
             You can create one with openssl, e.g. \
             \"openssl req -new -x509 -nodes -keyout key.pem -out server.pem -subj /CN=<controller>\". \
             A self-signed certificate (or its CA) must be provisioned on the nodes",
            path.display()
        )));
    }
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| Error::Tls(format!("Failed to open {what} file '{}': {e}", path.display())))
}

/// Load certificates from a PEM file
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open(path, "certificate")?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            Error::Tls(format!("Failed to parse certificates from '{}': {e}", path.display()))
        })?;
    if certs.is_empty() {
        return Err(Error::Tls(format!("No certificates found in '{}'", path.display())));
    }
    debug!(count = certs.len(), path = %path.display(), "Loaded certificates");
    Ok(certs)
}

/// Load the first private key (PKCS#1, PKCS#8 or SEC1) from a PEM file
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open(path, "private key")?;
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| {
            Error::Tls(format!("Failed to parse private key from '{}': {e}", path.display()))
        })?
        .ok_or_else(|| Error::Tls(format!("No private key found in '{}'", path.display())))
}

pub fn create_tls_acceptor(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let certs = load_certs(cert_path)?;
    let key = load_private_key(key_path)?;

    let config = ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .map_err(|e| Error::Tls(format!("Unsupported protocol versions: {e}")))?
    .with_no_client_auth()
    .with_single_cert(certs, key)
    .map_err(|e| Error::Tls(format!("Failed to create TLS config: {e}")))?;

    info!(cert_path = %cert_path.display(), "Created TLS acceptor");
    Ok(TlsAcceptor::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_certificate_is_a_configuration_error() {
        let err = load_certs(Path::new("/nonexistent/server.pem")).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(err.to_string().contains("openssl"));
    }

    #[test]
    fn test_empty_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("server.pem");
        let key = dir.path().join("key.pem");
        std::fs::write(&cert, "").unwrap();
        std::fs::write(&key, "").unwrap();
        assert!(matches!(load_certs(&cert), Err(Error::Tls(_))));
        assert!(matches!(load_private_key(&key), Err(Error::Tls(_))));
    }
}

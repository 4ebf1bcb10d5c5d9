//! TLS client configuration for `wss://` endpoints
//!
//! Uses rustls (pure Rust, easy static linking) with the platform root store,
//! optionally extended with a PEM bundle for networks that re-sign TLS.

use crate::error::TransportError;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tracing::{debug, warn};

/// Build the rustls client configuration
pub fn client_config(trusted_root: Option<&Path>) -> Result<Arc<ClientConfig>, TransportError> {
    let mut roots = RootCertStore::empty();

    // Add system root certificates
    let native = rustls_native_certs::load_native_certs();
    for err in &native.errors {
        warn!("Skipping unreadable system certificate: {}", err);
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    debug!("Loaded {} system root certificates ({} ignored)", added, ignored);

    if let Some(path) = trusted_root {
        let added = add_pem_roots(&mut roots, path)?;
        debug!("Loaded {} trusted root(s) from {}", added, path.display());
    }

    if roots.is_empty() {
        return Err(TransportError::Tls(
            "No trusted root certificates available".to_string(),
        ));
    }

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(Arc::new(config))
}

/// Add every certificate in a PEM file, returning how many were added
fn add_pem_roots(roots: &mut RootCertStore, path: &Path) -> Result<usize, TransportError> {
    let file = std::fs::File::open(path).map_err(|e| {
        TransportError::Tls(format!("Failed to open certificate file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| {
            TransportError::Tls(format!("Failed to parse certificates from {}: {}", path.display(), e))
        })?;
    if certs.is_empty() {
        return Err(TransportError::Tls(format!(
            "No certificates found in {}",
            path.display()
        )));
    }

    let count = certs.len();
    for cert in certs {
        roots
            .add(cert)
            .map_err(|e| TransportError::Tls(format!("Rejected certificate from {}: {}", path.display(), e)))?;
    }
    Ok(count)
}

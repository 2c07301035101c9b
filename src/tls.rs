//! Listener-side TLS configuration
//!
//! The proxy terminates TLS itself: it presents the configured server
//! certificate and verifies presented client certificates against the
//! configured CA bundle during the handshake. A connection that presents
//! no certificate still completes the handshake; the dispatcher answers
//! it with 401 before any routing. A certificate the CA did not sign
//! fails the handshake outright.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};

use crate::error::{Error, Result};

/// Where the server's TLS material lives
#[derive(Debug, Clone)]
pub struct TlsPaths {
    /// CA bundle that signs acceptable client certificates
    pub client_ca: PathBuf,
    /// Server certificate chain, PEM
    pub cert: PathBuf,
    /// Server private key, PEM
    pub key: PathBuf,
}

/// Build the rustls server configuration for the proxy listener
pub fn build_server_tls(paths: &TlsPaths) -> Result<Arc<ServerConfig>> {
    let roots = load_ca_pool(&paths.client_ca)?;

    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .allow_unauthenticated()
        .build()
        .map_err(|e| Error::Config(format!("building client cert verifier: {e}")))?;

    let cert_pem = std::fs::read(&paths.cert)
        .map_err(|e| Error::Config(format!("reading {}: {e}", paths.cert.display())))?;
    let certs = rustls_pemfile::certs(&mut cert_pem.as_slice())
        .collect::<std::io::Result<Vec<_>>>()
        .map_err(|e| Error::Config(format!("parsing {}: {e}", paths.cert.display())))?;
    if certs.is_empty() {
        return Err(Error::Config(format!(
            "no certificates in {}",
            paths.cert.display()
        )));
    }

    let key_pem = std::fs::read(&paths.key)
        .map_err(|e| Error::Config(format!("reading {}: {e}", paths.key.display())))?;
    let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
        .map_err(|e| Error::Config(format!("parsing {}: {e}", paths.key.display())))?
        .ok_or_else(|| Error::Config(format!("no private key in {}", paths.key.display())))?;

    let mut config = ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .map_err(|e| Error::Config(format!("server certificate rejected: {e}")))?;

    // Upgrades need HTTP/1.1; everything else may negotiate h2
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// Load the client CA bundle into a rustls root store
fn load_ca_pool(path: &Path) -> Result<RootCertStore> {
    let ca_pem = std::fs::read(path)
        .map_err(|e| Error::Config(format!("reading client CA {}: {e}", path.display())))?;

    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut ca_pem.as_slice()) {
        let cert =
            cert.map_err(|e| Error::Config(format!("parsing client CA {}: {e}", path.display())))?;
        roots
            .add(cert)
            .map_err(|e| Error::Config(format!("unusable client CA {}: {e}", path.display())))?;
    }
    if roots.is_empty() {
        return Err(Error::Config(format!(
            "no CA certificates in {}",
            path.display()
        )));
    }
    Ok(roots)
}

//! Caller identity from mTLS client certificates
//!
//! The TLS layer verifies presented client certificates against the
//! configured CA and stores the peer chain in a [`ClientCertChain`]
//! request extension. The dispatcher then runs the chain through a
//! [`CertAuthenticator`], which re-reads the CA bundle for every
//! request: a bundle that cannot be loaded is an authentication
//! infrastructure failure (501), a caller without a usable certificate
//! is an authentication failure (401), and a replaced bundle takes
//! effect without a restart. The resulting [`IdentityContext`] uses the
//! Kubernetes common-name conversion (CN becomes the user, O entries
//! become the groups) and is applied to outbound requests as
//! impersonation headers.
//!
//! The proxy's own credentials authenticate it to each backend; the
//! impersonation headers are how the caller's identity travels. Inbound
//! `Impersonate-*` headers are always stripped first so a caller cannot
//! smuggle a different identity through the proxy.

use std::collections::BTreeMap;
use std::path::PathBuf;

use axum::http::{HeaderMap, HeaderName, HeaderValue};
use x509_parser::prelude::*;

use crate::error::{Error, Result};

/// Impersonation header names that must never pass through from callers
const IMPERSONATION_HEADERS: &[&str] = &[
    "Impersonate-User",
    "Impersonate-Group",
    "Impersonate-Uid",
    // Impersonate-Extra-* headers are handled with a prefix check
];

/// Caller identity for one request, forwarded to every backend it touches
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentityContext {
    /// User name from the certificate Common Name
    pub user: String,
    /// Groups from the certificate Organization entries
    pub groups: Vec<String>,
    /// Extra key/value scopes; client certificates carry none, but the
    /// impersonation wire format supports them
    pub extra: BTreeMap<String, Vec<String>>,
}

/// Client certificate chain captured from the TLS connection.
///
/// Stored as a request extension by the connection acceptor so handlers
/// can authenticate the caller.
#[derive(Clone, Debug, Default)]
pub struct ClientCertChain(pub Vec<Vec<u8>>);

impl ClientCertChain {
    /// Create from certificate DER bytes
    pub fn new(certs: Vec<Vec<u8>>) -> Self {
        Self(certs)
    }

    /// Check if any certificates were provided
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Per-request client certificate authenticator.
///
/// Rebuilt logically on every request by re-reading the CA bundle from
/// disk, so CA rotation needs no restart and a broken bundle surfaces
/// as a request-time infrastructure failure rather than only at boot.
pub struct CertAuthenticator {
    ca_path: PathBuf,
}

impl CertAuthenticator {
    /// Authenticator verifying callers against the CA bundle at `ca_path`
    pub fn new(ca_path: PathBuf) -> Self {
        Self { ca_path }
    }

    /// Authenticate one request's certificate chain.
    ///
    /// Order matters: a CA bundle that cannot be loaded or parsed fails
    /// with [`Error::AuthInfra`] before the chain is examined; only then
    /// does an absent, unreadable, unsigned, or expired certificate fail
    /// with [`Error::Unauthorized`].
    pub async fn authenticate(&self, chain: &ClientCertChain) -> Result<IdentityContext> {
        let ca_pem = tokio::fs::read(&self.ca_path).await.map_err(|e| {
            Error::AuthInfra(format!("reading client CA {}: {e}", self.ca_path.display()))
        })?;
        let roots = rustls_pemfile::certs(&mut ca_pem.as_slice())
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|e| {
                Error::AuthInfra(format!("parsing client CA {}: {e}", self.ca_path.display()))
            })?;
        if roots.is_empty() {
            return Err(Error::AuthInfra(format!(
                "no CA certificates in {}",
                self.ca_path.display()
            )));
        }

        let leaf_der = chain
            .0
            .first()
            .ok_or_else(|| Error::Unauthorized("no client certificate provided".into()))?;
        let (_, leaf) = parse_x509_certificate(leaf_der)
            .map_err(|e| Error::Unauthorized(format!("unreadable client certificate: {e}")))?;

        let signed_by_root = roots.iter().any(|root| {
            parse_x509_certificate(root.as_ref())
                .map(|(_, ca)| leaf.verify_signature(Some(ca.public_key())).is_ok())
                .unwrap_or(false)
        });
        if !signed_by_root {
            return Err(Error::Unauthorized(
                "client certificate not signed by a trusted CA".into(),
            ));
        }

        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64;
        if now < leaf.validity().not_before.timestamp() {
            return Err(Error::Unauthorized("client certificate not yet valid".into()));
        }
        if now > leaf.validity().not_after.timestamp() {
            return Err(Error::Unauthorized("client certificate expired".into()));
        }

        identity_from_cert(&leaf)
    }
}

/// Extract the caller identity from the first certificate of a chain.
///
/// Reads CN as the user name and O entries as groups; no trust decisions
/// are made here.
pub fn identity_from_chain(chain: &ClientCertChain) -> Result<IdentityContext> {
    let cert_der = chain
        .0
        .first()
        .ok_or_else(|| Error::Unauthorized("no client certificate provided".into()))?;

    let (_, cert) = parse_x509_certificate(cert_der)
        .map_err(|e| Error::Unauthorized(format!("unreadable client certificate: {e}")))?;

    identity_from_cert(&cert)
}

fn identity_from_cert(cert: &X509Certificate<'_>) -> Result<IdentityContext> {
    let user = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .ok_or_else(|| Error::Unauthorized("client certificate has no Common Name".into()))?
        .to_string();

    let groups = cert
        .subject()
        .iter_organization()
        .filter_map(|o| o.as_str().ok())
        .map(|o| o.to_string())
        .collect();

    tracing::debug!(user = %user, "extracted identity from client certificate");

    Ok(IdentityContext {
        user,
        groups,
        extra: BTreeMap::new(),
    })
}

/// Remove any caller-supplied impersonation headers
pub fn strip_impersonation_headers(headers: &mut HeaderMap) {
    for header in IMPERSONATION_HEADERS {
        headers.remove(*header);
    }

    let extra: Vec<HeaderName> = headers
        .keys()
        .filter(|k| k.as_str().starts_with("impersonate-extra-"))
        .cloned()
        .collect();
    for key in extra {
        headers.remove(&key);
    }
}

/// Set impersonation headers for the given identity on an outbound header map
pub fn apply_impersonation(headers: &mut HeaderMap, identity: &IdentityContext) -> Result<()> {
    let value = |s: &str| {
        HeaderValue::from_str(s)
            .map_err(|e| Error::Internal(format!("identity not header-safe: {e}")))
    };

    headers.insert("Impersonate-User", value(&identity.user)?);
    for group in &identity.groups {
        headers.append("Impersonate-Group", value(group)?);
    }
    for (key, values) in &identity.extra {
        let name = HeaderName::try_from(format!("Impersonate-Extra-{key}"))
            .map_err(|e| Error::Internal(format!("bad extra key {key:?}: {e}")))?;
        for v in values {
            headers.append(name.clone(), value(v)?);
        }
    }
    Ok(())
}

//! Central registry access: placements, clusters, and backend configs
//!
//! The central registry is a Kubernetes API whose objects describe the
//! federation. This module resolves a namespace to its placement, a
//! cluster name to a [`BackendConfig`], and bootstraps the registry
//! client itself from the well-known `kubeconfig-central` secret on the
//! local API server.
//!
//! Access goes through the [`RegistryClient`] trait so request handling
//! can be tested against a mock registry.

use std::hash::{Hash, Hasher};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use secrecy::ExposeSecret;

use crate::crd::{
    FederatedCluster, NamespacePlacement, NamespacePlacementSpec, CENTRAL_KUBECONFIG_SECRET,
    CLUSTER_SECRET_NAMESPACE, FEDERATION_NAMESPACE, KUBECONFIG_SECRET_KEY,
};
use crate::error::{Error, Result};

/// Everything needed to open an authenticated connection to one backend
/// API server. Derived from a FederatedCluster plus its kubeconfig
/// secret, or from the proxy's own credentials for the local server.
#[derive(Debug, Clone, Default)]
pub struct BackendConfig {
    /// Cluster name; empty for the local API server
    pub cluster: String,
    /// Base URL of the API server, always ending in "/"
    pub endpoint: String,
    /// DER-encoded roots that sign the backend's serving certificate
    pub root_certs: Vec<Vec<u8>>,
    /// PEM bundle (client certificate followed by key) authenticating the
    /// proxy itself, when the kubeconfig uses certificate auth
    pub identity_pem: Option<Vec<u8>>,
    /// Bearer token authenticating the proxy, when the kubeconfig uses
    /// token auth
    pub bearer_token: Option<String>,
    /// TCP keep-alive period; `None` disables keep-alive probes
    pub keepalive: Option<Duration>,
}

impl BackendConfig {
    /// Stable fingerprint of the connection-relevant material, used to
    /// decide whether a memoized transport is still valid
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = std::collections::hash_map::DefaultHasher::new();
        self.endpoint.hash(&mut hasher);
        self.root_certs.hash(&mut hasher);
        self.identity_pem.hash(&mut hasher);
        self.bearer_token.hash(&mut hasher);
        self.keepalive.hash(&mut hasher);
        hasher.finish()
    }
}

/// Read-only view of the central registry
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RegistryClient: Send + Sync {
    /// Fetch the placement for a tenant namespace
    async fn placement(&self, namespace: &str) -> Result<NamespacePlacementSpec>;

    /// Resolve a cluster name to a backend configuration
    async fn backend_config(&self, cluster: &str) -> Result<BackendConfig>;
}

/// Registry client backed by the central Kubernetes API
pub struct KubeRegistry {
    client: Client,
    keepalive: Option<Duration>,
}

impl KubeRegistry {
    /// Wrap a central-registry client
    pub fn new(client: Client, keepalive: Option<Duration>) -> Self {
        Self { client, keepalive }
    }
}

#[async_trait]
impl RegistryClient for KubeRegistry {
    async fn placement(&self, namespace: &str) -> Result<NamespacePlacementSpec> {
        let placements: Api<NamespacePlacement> =
            Api::namespaced(self.client.clone(), FEDERATION_NAMESPACE);
        match placements.get(namespace).await {
            Ok(placement) => Ok(placement.spec),
            Err(kube::Error::Api(e)) if e.code == 404 => {
                Err(Error::PlacementNotFound(namespace.to_string()))
            }
            Err(e) => Err(Error::Registry(format!(
                "fetching placement for {namespace}: {e}"
            ))),
        }
    }

    async fn backend_config(&self, cluster: &str) -> Result<BackendConfig> {
        let clusters: Api<FederatedCluster> =
            Api::namespaced(self.client.clone(), FEDERATION_NAMESPACE);
        let fed_cluster = match clusters.get(cluster).await {
            Ok(c) => c,
            Err(kube::Error::Api(e)) if e.code == 404 => {
                return Err(Error::ClusterNotFound(cluster.to_string()))
            }
            Err(e) => return Err(Error::Registry(format!("fetching cluster {cluster}: {e}"))),
        };

        let secret_name = &fed_cluster.spec.secret_ref.name;
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), CLUSTER_SECRET_NAMESPACE);
        let secret = match secrets.get(secret_name).await {
            Ok(s) => s,
            Err(kube::Error::Api(e)) if e.code == 404 => {
                return Err(Error::ClusterNotFound(format!(
                    "{cluster}: credential secret {CLUSTER_SECRET_NAMESPACE}/{secret_name} missing"
                )))
            }
            Err(e) => {
                return Err(Error::Registry(format!(
                    "fetching secret {CLUSTER_SECRET_NAMESPACE}/{secret_name}: {e}"
                )))
            }
        };

        let kubeconfig_bytes = secret
            .data
            .as_ref()
            .and_then(|d| d.get(KUBECONFIG_SECRET_KEY))
            .map(|b| b.0.clone())
            .ok_or_else(|| {
                Error::ClusterNotFound(format!(
                    "{cluster}: secret {secret_name} has no {KUBECONFIG_SECRET_KEY:?} key"
                ))
            })?;

        let kube_config = config_from_kubeconfig_bytes(&kubeconfig_bytes)
            .await
            .map_err(|e| Error::BackendBuild(format!("cluster {cluster}: {e}")))?;

        let endpoint_override = if fed_cluster.spec.api_endpoint.is_empty() {
            None
        } else {
            Some(fed_cluster.spec.api_endpoint.as_str())
        };

        let mut config =
            backend_config_from_kube(kube_config, endpoint_override, self.keepalive).await?;
        config.cluster = cluster.to_string();
        Ok(config)
    }
}

/// Parse inline kubeconfig bytes into a resolved kube [`Config`]
async fn config_from_kubeconfig_bytes(bytes: &[u8]) -> Result<Config> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| Error::BackendBuild(format!("kubeconfig is not UTF-8: {e}")))?;
    let kubeconfig = Kubeconfig::from_yaml(text)
        .map_err(|e| Error::BackendBuild(format!("unparseable kubeconfig: {e}")))?;
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::BackendBuild(format!("unusable kubeconfig: {e}")))
}

/// Flatten a resolved kube [`Config`] into a [`BackendConfig`].
///
/// Inline certificate data wins over on-disk paths; a token file is read
/// eagerly so the backend config stays an immutable record.
pub async fn backend_config_from_kube(
    config: Config,
    endpoint_override: Option<&str>,
    keepalive: Option<Duration>,
) -> Result<BackendConfig> {
    let mut endpoint = endpoint_override
        .map(|e| e.to_string())
        .unwrap_or_else(|| config.cluster_url.to_string());
    if !endpoint.ends_with('/') {
        endpoint.push('/');
    }

    let root_certs = config.root_cert.clone().unwrap_or_default();

    let auth = &config.auth_info;
    let b64 = base64::engine::general_purpose::STANDARD;

    let identity_pem = match (
        auth.client_certificate_data.as_deref(),
        auth.client_key_data.as_ref(),
    ) {
        (Some(cert_b64), Some(key_b64)) => {
            let mut pem = b64
                .decode(cert_b64.trim())
                .map_err(|e| Error::BackendBuild(format!("bad client certificate data: {e}")))?;
            let key = b64
                .decode(key_b64.expose_secret().trim())
                .map_err(|e| Error::BackendBuild(format!("bad client key data: {e}")))?;
            pem.push(b'\n');
            pem.extend_from_slice(&key);
            Some(pem)
        }
        _ => match (auth.client_certificate.as_deref(), auth.client_key.as_deref()) {
            (Some(cert_path), Some(key_path)) => {
                let mut pem = tokio::fs::read(cert_path).await.map_err(|e| {
                    Error::BackendBuild(format!("reading client certificate {cert_path}: {e}"))
                })?;
                let key = tokio::fs::read(key_path).await.map_err(|e| {
                    Error::BackendBuild(format!("reading client key {key_path}: {e}"))
                })?;
                pem.push(b'\n');
                pem.extend_from_slice(&key);
                Some(pem)
            }
            _ => None,
        },
    };

    let bearer_token = match &auth.token {
        Some(token) => Some(token.expose_secret().to_string()),
        None => match &auth.token_file {
            Some(path) => Some(
                tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| Error::BackendBuild(format!("reading token file {path}: {e}")))?
                    .trim()
                    .to_string(),
            ),
            None => None,
        },
    };

    Ok(BackendConfig {
        cluster: String::new(),
        endpoint,
        root_certs,
        identity_pem,
        bearer_token,
        keepalive,
    })
}

/// Kubernetes client for the local API server: in-cluster config first,
/// falling back to the default kubeconfig
pub async fn local_client() -> Result<Client> {
    Client::try_default()
        .await
        .map_err(|e| Error::Config(format!("building local client: {e}")))
}

/// Backend configuration for proxying to the local API server
pub async fn local_backend_config(keepalive: Option<Duration>) -> Result<BackendConfig> {
    let config = Config::infer()
        .await
        .map_err(|e| Error::Config(format!("inferring local config: {e}")))?;
    backend_config_from_kube(config, None, keepalive).await
}

/// Build the central-registry client from the `kubeconfig-central` secret
/// on the local API server. This single secret is the pointer to
/// everything federation related.
pub async fn central_registry_client(local: &Client) -> Result<Client> {
    let secrets: Api<Secret> = Api::namespaced(local.clone(), FEDERATION_NAMESPACE);
    let secret = secrets.get(CENTRAL_KUBECONFIG_SECRET).await.map_err(|e| {
        Error::Config(format!(
            "fetching {FEDERATION_NAMESPACE}/{CENTRAL_KUBECONFIG_SECRET}: {e}"
        ))
    })?;

    let bytes = secret
        .data
        .as_ref()
        .and_then(|d| d.get(KUBECONFIG_SECRET_KEY))
        .map(|b| b.0.clone())
        .ok_or_else(|| {
            Error::Config(format!(
                "secret {CENTRAL_KUBECONFIG_SECRET} has no {KUBECONFIG_SECRET_KEY:?} key"
            ))
        })?;

    let config = config_from_kubeconfig_bytes(&bytes)
        .await
        .map_err(|e| Error::Config(format!("central registry kubeconfig: {e}")))?;

    Client::try_from(config)
        .map_err(|e| Error::Config(format!("building central registry client: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, KeyPair};

    fn ca_cert_b64() -> String {
        let key = KeyPair::generate().unwrap();
        let cert = CertificateParams::default().self_signed(&key).unwrap();
        base64::engine::general_purpose::STANDARD.encode(cert.pem())
    }

    fn kubeconfig_yaml(token_line: &str) -> String {
        format!(
            r#"apiVersion: v1
kind: Config
clusters:
- name: w1
  cluster:
    server: https://10.0.0.10:6443
    certificate-authority-data: {ca}
contexts:
- name: w1
  context:
    cluster: w1
    user: w1-admin
current-context: w1
users:
- name: w1-admin
  user:
    {token_line}
"#,
            ca = ca_cert_b64(),
            token_line = token_line
        )
    }

    #[tokio::test]
    async fn test_backend_config_from_token_kubeconfig() {
        let yaml = kubeconfig_yaml("token: secret-token");
        let config = config_from_kubeconfig_bytes(yaml.as_bytes()).await.unwrap();
        let backend = backend_config_from_kube(config, None, None).await.unwrap();

        assert_eq!(backend.endpoint, "https://10.0.0.10:6443/");
        assert_eq!(backend.bearer_token.as_deref(), Some("secret-token"));
        assert!(backend.identity_pem.is_none());
        assert!(!backend.root_certs.is_empty());
    }

    #[tokio::test]
    async fn test_endpoint_override_wins() {
        let yaml = kubeconfig_yaml("token: secret-token");
        let config = config_from_kubeconfig_bytes(yaml.as_bytes()).await.unwrap();
        let backend = backend_config_from_kube(config, Some("https://w1.example.com:6443"), None)
            .await
            .unwrap();
        assert_eq!(backend.endpoint, "https://w1.example.com:6443/");
    }

    #[tokio::test]
    async fn test_unparseable_kubeconfig_is_backend_build_error() {
        let err = config_from_kubeconfig_bytes(b"not: [valid")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BackendBuild(_)));
    }

    #[tokio::test]
    async fn test_fingerprint_tracks_credentials() {
        let yaml = kubeconfig_yaml("token: secret-token");
        let config = config_from_kubeconfig_bytes(yaml.as_bytes()).await.unwrap();
        let a = backend_config_from_kube(config, None, None).await.unwrap();

        let mut b = a.clone();
        assert_eq!(a.fingerprint(), b.fingerprint());

        b.bearer_token = Some("rotated".into());
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[tokio::test]
    async fn test_keepalive_propagates() {
        let yaml = kubeconfig_yaml("token: secret-token");
        let config = config_from_kubeconfig_bytes(yaml.as_bytes()).await.unwrap();
        let backend = backend_config_from_kube(config, None, Some(Duration::from_secs(30)))
            .await
            .unwrap();
        assert_eq!(backend.keepalive, Some(Duration::from_secs(30)));
    }
}

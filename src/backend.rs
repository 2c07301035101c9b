//! Dynamic proxy toward one backend API server
//!
//! A [`Backend`] is a memoizable proxy target: reqwest clients built from
//! a [`BackendConfig`] (root CA, proxy credentials, dial timeout,
//! keep-alive), plus the forwarding logic. Plain requests are streamed so
//! watch chunks reach the client as they arrive; HTTP/1.1 upgrade
//! requests (SPDY and WebSocket, used by exec, attach, and portforward)
//! are bridged byte-for-byte in both directions over a dedicated
//! HTTP/1.1-only client, since upgrade semantics do not exist in HTTP/2.
//!
//! Both paths carry the caller's identity through impersonation headers;
//! the client credentials only authenticate the proxy itself.
//!
//! [`BackendPool`] memoizes built backends per cluster and rebuilds them
//! when a fresh resolve yields different connection material, so routine
//! traffic does not pay a TLS handshake per request.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::header::{
    HeaderMap, HeaderName, AUTHORIZATION, CONNECTION, CONTENT_LENGTH, HOST, TRANSFER_ENCODING,
    UPGRADE,
};
use axum::http::{Method, Request, StatusCode};
use axum::response::Response;
use dashmap::DashMap;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::identity::{apply_impersonation, strip_impersonation_headers, IdentityContext};
use crate::registry::{BackendConfig, RegistryClient};
use crate::routing::rewritten_path;

/// Dial timeout toward backends
const DIAL_TIMEOUT: Duration = Duration::from_secs(30);

/// Headers the proxy owns and never copies through in either direction
const HOP_BY_HOP: &[HeaderName] = &[
    AUTHORIZATION,
    CONNECTION,
    CONTENT_LENGTH,
    HOST,
    TRANSFER_ENCODING,
    UPGRADE,
];

/// Upgrade-related headers forwarded verbatim on the upgrade path
const UPGRADE_HEADERS: &[&str] = &[
    "Upgrade",
    "Connection",
    "Sec-WebSocket-Key",
    "Sec-WebSocket-Version",
    "Sec-WebSocket-Protocol",
    "Sec-WebSocket-Extensions",
];

/// One proxied API server
#[derive(Debug)]
pub struct Backend {
    cluster: String,
    endpoint: String,
    bearer_token: Option<String>,
    fingerprint: u64,
    client: reqwest::Client,
    upgrade_client: reqwest::Client,
}

impl Backend {
    /// Build clients for a backend. Fails on unusable TLS material or an
    /// unparseable endpoint, which the caller maps to 501.
    pub fn new(config: &BackendConfig) -> Result<Self> {
        reqwest::Url::parse(&config.endpoint)
            .map_err(|e| Error::BackendBuild(format!("bad endpoint {:?}: {e}", config.endpoint)))?;

        let client = client_builder(config)?
            .build()
            .map_err(|e| Error::BackendBuild(format!("building client: {e}")))?;
        let upgrade_client = client_builder(config)?
            .http1_only()
            .build()
            .map_err(|e| Error::BackendBuild(format!("building upgrade client: {e}")))?;

        Ok(Self {
            cluster: config.cluster.clone(),
            endpoint: config.endpoint.clone(),
            bearer_token: config.bearer_token.clone(),
            fingerprint: config.fingerprint(),
            client,
            upgrade_client,
        })
    }

    /// Cluster this backend points at; empty for the local API server
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Fingerprint of the config this backend was built from
    pub fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// Proxy one request, streaming the response body back.
    ///
    /// `api_prefix` is stripped from the path first (unless it starts
    /// with `/api`); a path outside the prefix is unroutable.
    pub async fn forward(
        &self,
        api_prefix: &str,
        identity: &IdentityContext,
        request: Request<Body>,
    ) -> Result<Response> {
        let path = request.uri().path().to_string();
        let rewritten = rewrite_path(api_prefix, &path)?;
        let query = request.uri().query().map(|q| q.to_string());
        let url = self.target_url(&rewritten, query.as_deref());

        if is_upgrade_request(request.headers()) {
            return self.forward_upgrade(&url, identity, request).await;
        }

        let method = request.method().clone();
        let headers = self.outbound_headers(request.headers(), identity)?;

        debug!(cluster = %self.cluster, method = %method, url = %url, "proxying request");

        let body = reqwest::Body::wrap_stream(request.into_body().into_data_stream());
        let upstream = self
            .client
            .request(method, &url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Backend(e.to_string()))?;

        stream_response(upstream)
    }

    /// Proxy one request with a buffered body, for the aggregator
    pub async fn fetch_buffered(
        &self,
        api_prefix: &str,
        identity: &IdentityContext,
        method: Method,
        path: &str,
        query: Option<&str>,
        inbound_headers: &HeaderMap,
        body: Bytes,
    ) -> Result<(StatusCode, Bytes)> {
        let rewritten = rewrite_path(api_prefix, path)?;
        let url = self.target_url(&rewritten, query);
        let headers = self.outbound_headers(inbound_headers, identity)?;

        debug!(cluster = %self.cluster, method = %method, url = %url, "fan-out request");

        let upstream = self
            .client
            .request(method, &url)
            .headers(headers)
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Backend(e.to_string()))?;

        let status = StatusCode::from_u16(upstream.status().as_u16())
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = upstream
            .bytes()
            .await
            .map_err(|e| Error::Backend(format!("reading response: {e}")))?;
        Ok((status, bytes))
    }

    /// Proxy an HTTP upgrade transparently: forward the handshake, then
    /// bridge the two upgraded connections until either side closes
    async fn forward_upgrade(
        &self,
        url: &str,
        identity: &IdentityContext,
        request: Request<Body>,
    ) -> Result<Response> {
        let method = request.method().clone();
        let incoming_headers = request.headers().clone();

        // Taking the upgrade handle consumes our claim on the connection
        let incoming_upgrade = hyper::upgrade::on(request);

        let mut headers = self.outbound_headers(&incoming_headers, identity)?;
        for name in UPGRADE_HEADERS {
            if let Some(value) = incoming_headers.get(*name) {
                headers.insert(
                    HeaderName::try_from(*name).expect("static header name"),
                    value.clone(),
                );
            }
        }

        debug!(cluster = %self.cluster, url = %url, "proxying upgrade request");

        let upstream = self
            .upgrade_client
            .request(method, url)
            .headers(headers)
            .send()
            .await
            .map_err(|e| Error::Backend(format!("upgrade request: {e}")))?;

        if upstream.status() != reqwest::StatusCode::SWITCHING_PROTOCOLS {
            // The backend declined the upgrade (RBAC, validation, ...);
            // relay its answer untouched
            return buffered_response(upstream).await;
        }

        let mut response = Response::builder().status(StatusCode::SWITCHING_PROTOCOLS);
        if let Some(response_headers) = response.headers_mut() {
            copy_response_headers(upstream.headers(), response_headers);
            for name in UPGRADE_HEADERS {
                if let Some(value) = upstream.headers().get(*name) {
                    response_headers.insert(
                        HeaderName::try_from(*name).expect("static header name"),
                        value.clone(),
                    );
                }
            }
        }

        let mut upstream_upgraded = upstream
            .upgrade()
            .await
            .map_err(|e| Error::Backend(format!("upgrading upstream connection: {e}")))?;

        let cluster = self.cluster.clone();
        tokio::spawn(async move {
            match incoming_upgrade.await {
                Ok(incoming) => {
                    let mut incoming = hyper_util::rt::TokioIo::new(incoming);
                    match tokio::io::copy_bidirectional(&mut incoming, &mut upstream_upgraded).await
                    {
                        Ok((from_client, from_server)) => {
                            info!(cluster = %cluster, from_client, from_server, "upgrade session ended");
                        }
                        Err(e) => {
                            debug!(cluster = %cluster, error = %e, "upgrade bridge error");
                        }
                    }
                }
                Err(e) => {
                    debug!(cluster = %cluster, error = %e, "client never completed upgrade");
                }
            }
        });

        response
            .body(Body::empty())
            .map_err(|e| Error::Internal(format!("building upgrade response: {e}")))
    }

    fn target_url(&self, path: &str, query: Option<&str>) -> String {
        // endpoint ends with '/' and the rewritten path starts with one
        let joined = format!("{}{}", self.endpoint.trim_end_matches('/'), path);
        match query {
            Some(q) if !q.is_empty() => format!("{joined}?{q}"),
            _ => joined,
        }
    }

    /// Copy forwardable inbound headers, then stamp the proxy's own
    /// credentials and the caller's impersonated identity
    fn outbound_headers(
        &self,
        inbound: &HeaderMap,
        identity: &IdentityContext,
    ) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (name, value) in inbound {
            if HOP_BY_HOP.contains(name) || name.as_str().starts_with("sec-websocket-") {
                continue;
            }
            headers.append(name.clone(), value.clone());
        }

        strip_impersonation_headers(&mut headers);
        apply_impersonation(&mut headers, identity)?;

        if let Some(token) = &self.bearer_token {
            let value = format!("Bearer {token}")
                .parse()
                .map_err(|e| Error::Internal(format!("bearer token not header-safe: {e}")))?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }
}

fn client_builder(config: &BackendConfig) -> Result<reqwest::ClientBuilder> {
    let mut builder = reqwest::Client::builder()
        .use_rustls_tls()
        .connect_timeout(DIAL_TIMEOUT)
        .tcp_keepalive(config.keepalive);

    for der in &config.root_certs {
        let cert = reqwest::Certificate::from_der(der)
            .map_err(|e| Error::BackendBuild(format!("bad root certificate: {e}")))?;
        builder = builder.add_root_certificate(cert);
    }
    if let Some(pem) = &config.identity_pem {
        let identity = reqwest::Identity::from_pem(pem)
            .map_err(|e| Error::BackendBuild(format!("bad client identity: {e}")))?;
        builder = builder.identity(identity);
    }
    Ok(builder)
}

/// Strip the API prefix, restoring the leading slash; outside the prefix
/// is a routing failure
fn rewrite_path(api_prefix: &str, path: &str) -> Result<String> {
    rewritten_path(api_prefix, path).ok_or_else(|| Error::PathUnroutable(path.to_string()))
}

/// Whether a request is asking for an HTTP/1.1 connection upgrade
pub fn is_upgrade_request(headers: &HeaderMap) -> bool {
    let wants_upgrade = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .any(|v| {
            v.split(',')
                .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
        });
    wants_upgrade && headers.contains_key(UPGRADE)
}

/// Stream an upstream response back to the client as it arrives
fn stream_response(upstream: reqwest::Response) -> Result<Response> {
    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        copy_response_headers(upstream.headers(), headers);
    }

    builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .map_err(|e| Error::Internal(format!("building response: {e}")))
}

/// Relay an upstream response with a buffered body
async fn buffered_response(upstream: reqwest::Response) -> Result<Response> {
    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
        copy_response_headers(upstream.headers(), headers);
    }
    let bytes = upstream
        .bytes()
        .await
        .map_err(|e| Error::Backend(format!("reading response: {e}")))?;
    builder
        .body(Body::from(bytes))
        .map_err(|e| Error::Internal(format!("building response: {e}")))
}

fn copy_response_headers(from: &HeaderMap, to: &mut HeaderMap) {
    for (name, value) in from {
        if HOP_BY_HOP.contains(name) {
            continue;
        }
        to.append(name.clone(), value.clone());
    }
}

/// Memoized backends keyed by cluster name
pub struct BackendPool {
    registry: Arc<dyn RegistryClient>,
    local: Arc<Backend>,
    clients: DashMap<String, Arc<Backend>>,
}

impl BackendPool {
    /// Create a pool with the local backend pre-built
    pub fn new(registry: Arc<dyn RegistryClient>, local_config: &BackendConfig) -> Result<Self> {
        Ok(Self {
            registry,
            local: Arc::new(Backend::new(local_config)?),
            clients: DashMap::new(),
        })
    }

    /// Backend for the local API server
    pub fn local(&self) -> Arc<Backend> {
        self.local.clone()
    }

    /// Backend for a member cluster, rebuilt when its config changed
    pub async fn for_cluster(&self, cluster: &str) -> Result<Arc<Backend>> {
        let config = self.registry.backend_config(cluster).await?;
        let fingerprint = config.fingerprint();

        if let Some(existing) = self.clients.get(cluster) {
            if existing.fingerprint() == fingerprint {
                return Ok(existing.clone());
            }
            debug!(cluster = %cluster, "backend config changed, rebuilding transport");
        }

        let backend = Arc::new(Backend::new(&config)?);
        self.clients.insert(cluster.to_string(), backend.clone());
        Ok(backend)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MockRegistryClient;

    fn test_config(cluster: &str, token: &str) -> BackendConfig {
        BackendConfig {
            cluster: cluster.to_string(),
            endpoint: "https://10.0.0.10:6443/".to_string(),
            root_certs: Vec::new(),
            identity_pem: None,
            bearer_token: Some(token.to_string()),
            keepalive: None,
        }
    }

    fn test_identity() -> IdentityContext {
        IdentityContext {
            user: "alice".into(),
            groups: vec!["dev".into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_backend_rejects_bad_endpoint() {
        let mut config = test_config("w1", "t");
        config.endpoint = "not a url".into();
        let err = Backend::new(&config).unwrap_err();
        assert!(matches!(err, Error::BackendBuild(_)));
    }

    #[test]
    fn test_backend_rejects_bad_identity_pem() {
        let mut config = test_config("w1", "t");
        config.identity_pem = Some(b"not pem".to_vec());
        let err = Backend::new(&config).unwrap_err();
        assert!(matches!(err, Error::BackendBuild(_)));
    }

    #[test]
    fn test_target_url_joins_cleanly() {
        let backend = Backend::new(&test_config("w1", "t")).unwrap();
        assert_eq!(
            backend.target_url("/api/v1/pods", None),
            "https://10.0.0.10:6443/api/v1/pods"
        );
        assert_eq!(
            backend.target_url("/api/v1/pods", Some("watch=true")),
            "https://10.0.0.10:6443/api/v1/pods?watch=true"
        );
    }

    #[test]
    fn test_outbound_headers_replace_credentials() {
        let backend = Backend::new(&test_config("w1", "proxy-token")).unwrap();
        let mut inbound = HeaderMap::new();
        inbound.insert("Authorization", "Bearer caller-token".parse().unwrap());
        inbound.insert("Impersonate-User", "evil".parse().unwrap());
        inbound.insert("Accept", "application/json".parse().unwrap());

        let out = backend
            .outbound_headers(&inbound, &test_identity())
            .unwrap();

        assert_eq!(out.get("Authorization").unwrap(), "Bearer proxy-token");
        assert_eq!(out.get("Impersonate-User").unwrap(), "alice");
        assert_eq!(out.get("Impersonate-Group").unwrap(), "dev");
        assert_eq!(out.get("Accept").unwrap(), "application/json");
    }

    #[test]
    fn test_rewrite_path_mismatch_is_unroutable() {
        let err = rewrite_path("/custom/", "/api/v1/pods").unwrap_err();
        assert!(matches!(err, Error::PathUnroutable(_)));
    }

    #[test]
    fn test_is_upgrade_request() {
        let mut headers = HeaderMap::new();
        assert!(!is_upgrade_request(&headers));

        headers.insert(CONNECTION, "Upgrade".parse().unwrap());
        assert!(!is_upgrade_request(&headers));

        headers.insert(UPGRADE, "SPDY/3.1".parse().unwrap());
        assert!(is_upgrade_request(&headers));

        let mut ws = HeaderMap::new();
        ws.insert(CONNECTION, "keep-alive, Upgrade".parse().unwrap());
        ws.insert(UPGRADE, "websocket".parse().unwrap());
        assert!(is_upgrade_request(&ws));
    }

    async fn read_http_head(sock: &mut tokio::net::TcpStream) -> String {
        use tokio::io::AsyncReadExt;
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = sock.read(&mut chunk).await.expect("read head");
            assert!(n > 0, "peer closed before end of header block");
            buf.extend_from_slice(&chunk[..n]);
            if buf.windows(4).any(|w| w == b"\r\n\r\n") {
                return String::from_utf8_lossy(&buf).to_string();
            }
        }
    }

    fn upgrade_request() -> Request<Body> {
        Request::builder()
            .uri("/api/v1/namespaces/team-a/pods/p1/exec")
            .header("Connection", "Upgrade")
            .header("Upgrade", "websocket")
            .header("Impersonate-User", "evil")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn test_upgrade_handshake_carries_caller_identity() {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (head_tx, head_rx) = tokio::sync::oneshot::channel::<String>();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let head = read_http_head(&mut sock).await;
            head_tx.send(head).unwrap();
            sock.write_all(
                b"HTTP/1.1 101 Switching Protocols\r\n\
                  Upgrade: websocket\r\n\
                  Connection: Upgrade\r\n\r\n",
            )
            .await
            .unwrap();
            // Hold the socket open until the bridge side goes away
            let mut chunk = [0u8; 64];
            use tokio::io::AsyncReadExt;
            while matches!(sock.read(&mut chunk).await, Ok(n) if n > 0) {}
        });

        let mut config = test_config("w1", "t");
        config.endpoint = format!("http://{addr}/");
        config.bearer_token = None;
        let backend = Backend::new(&config).unwrap();

        let response = backend
            .forward("/", &test_identity(), upgrade_request())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::SWITCHING_PROTOCOLS);

        let head = head_rx.await.unwrap().to_lowercase();
        assert!(head.contains("upgrade: websocket"));
        // The caller's verified identity, not the forged header
        assert!(head.contains("impersonate-user: alice"));
        assert!(head.contains("impersonate-group: dev"));
        assert!(!head.contains("evil"));
    }

    #[tokio::test]
    async fn test_declined_upgrade_is_relayed_untouched() {
        use tokio::io::AsyncWriteExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            let _ = read_http_head(&mut sock).await;
            sock.write_all(
                b"HTTP/1.1 403 Forbidden\r\n\
                  Content-Type: application/json\r\n\
                  Content-Length: 22\r\n\r\n\
                  {\"reason\":\"forbidden\"}",
            )
            .await
            .unwrap();
        });

        let mut config = test_config("w1", "t");
        config.endpoint = format!("http://{addr}/");
        config.bearer_token = None;
        let backend = Backend::new(&config).unwrap();

        let response = backend
            .forward("/", &test_identity(), upgrade_request())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body = axum::body::to_bytes(response.into_body(), 1 << 16)
            .await
            .unwrap();
        assert_eq!(&body[..], br#"{"reason":"forbidden"}"#);
    }

    #[tokio::test]
    async fn test_pool_memoizes_until_config_changes() {
        let mut registry = MockRegistryClient::new();
        let mut calls = 0;
        registry.expect_backend_config().returning(move |cluster| {
            calls += 1;
            let token = if calls <= 2 { "t1" } else { "rotated" };
            Ok(test_config(cluster, token))
        });

        let pool = BackendPool::new(Arc::new(registry), &test_config("", "local")).unwrap();

        let first = pool.for_cluster("w1").await.unwrap();
        let second = pool.for_cluster("w1").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        // Third resolve returns rotated credentials
        let third = pool.for_cluster("w1").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &third));
    }
}

//! Server bootstrap: shared state, router, listeners, and the accept loop
//!
//! Connections are accepted from a TCP or Unix-socket listener, TLS is
//! terminated with the proxy's server certificate, the verified client
//! certificate chain is stashed in a request extension, and the axum
//! router is served over the connection with upgrade support so exec,
//! attach, and portforward keep working end to end.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::Extension;
use axum::Router;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio_rustls::TlsAcceptor;
use tower_http::services::ServeDir;
use tracing::{debug, info, warn};

use crate::backend::BackendPool;
use crate::cache::RouteCache;
use crate::dispatch::{dispatch_handler, FederatedTypes};
use crate::error::{Error, Result};
use crate::filter::RequestFilter;
use crate::identity::{CertAuthenticator, ClientCertChain};
use crate::registry::RegistryClient;

/// Shared state for request handling
#[derive(Clone)]
pub struct AppState {
    /// Central registry view
    pub registry: Arc<dyn RegistryClient>,
    /// Per-request client certificate authenticator
    pub authenticator: Arc<CertAuthenticator>,
    /// Memoized per-cluster backends, local backend included
    pub backends: Arc<BackendPool>,
    /// Named-resource routes learned from fan-outs
    pub route_cache: Arc<RouteCache>,
    /// Accept/reject filter; `None` when disabled
    pub filter: Option<Arc<RequestFilter>>,
    /// Resource-type prefixes served by the master cluster
    pub federated_types: Arc<FederatedTypes>,
    /// URL prefix the proxied API is served under, ending in "/"
    pub api_prefix: String,
}

/// Static-content and prefix settings for the router
#[derive(Debug, Clone)]
pub struct ServeSettings {
    /// URL prefix for static content, ending in "/"
    pub static_prefix: String,
    /// Static content directory; static serving is off when `None`
    pub static_dir: Option<PathBuf>,
}

/// Build the request router: optional static files under the static
/// prefix, the dispatcher for everything else
pub fn build_router(state: AppState, settings: &ServeSettings) -> Result<Router> {
    let mut router = Router::new();

    if let Some(dir) = &settings.static_dir {
        let prefix = settings.static_prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return Err(Error::Config(
                "static prefix must not be the root when --www is set".into(),
            ));
        }
        router = router.nest_service(prefix, ServeDir::new(dir));
    }

    Ok(router.fallback(dispatch_handler).with_state(state))
}

/// A bound proxy listener
#[derive(Debug)]
pub enum ProxyListener {
    /// TCP socket
    Tcp(TcpListener),
    /// Unix domain socket
    Unix(UnixListener),
}

impl ProxyListener {
    /// Human-readable bound address, printed at startup
    pub fn local_addr_string(&self) -> String {
        match self {
            ProxyListener::Tcp(l) => l
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "<unknown>".into()),
            ProxyListener::Unix(l) => l
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
                .unwrap_or_else(|| "<unix socket>".into()),
        }
    }
}

/// Bind a TCP listener; port 0 asks the OS for a free port
pub async fn bind_tcp(address: &str, port: u16) -> Result<ProxyListener> {
    let listener = TcpListener::bind(format!("{address}:{port}"))
        .await
        .map_err(|e| Error::Config(format!("binding {address}:{port}: {e}")))?;
    Ok(ProxyListener::Tcp(listener))
}

/// Bind a Unix socket listener.
///
/// A pre-existing socket file at the path is removed, stale or not;
/// any other kind of file is left alone so the bind fails visibly. The
/// socket is created owner-only and the process umask is restored after.
pub fn bind_unix(path: &Path) -> Result<ProxyListener> {
    use std::os::unix::fs::FileTypeExt;

    if let Ok(meta) = std::fs::metadata(path) {
        if meta.file_type().is_socket() {
            std::fs::remove_file(path).map_err(|e| {
                Error::Config(format!("removing stale socket {}: {e}", path.display()))
            })?;
        }
    }

    let old_mask = unsafe { libc::umask(0o077) };
    let listener = UnixListener::bind(path);
    unsafe { libc::umask(old_mask) };

    listener
        .map(ProxyListener::Unix)
        .map_err(|e| Error::Config(format!("binding unix socket {}: {e}", path.display())))
}

/// Accept connections until interrupted; returns cleanly on ctrl-c
pub async fn serve(
    listener: ProxyListener,
    tls: Arc<rustls::ServerConfig>,
    app: Router,
) -> Result<()> {
    let acceptor = TlsAcceptor::from(tls);

    match listener {
        ProxyListener::Tcp(listener) => loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown requested");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "accepted connection");
                        tokio::spawn(handle_connection(stream, acceptor.clone(), app.clone()));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        },
        ProxyListener::Unix(listener) => loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown requested");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        debug!("accepted unix connection");
                        tokio::spawn(handle_connection(stream, acceptor.clone(), app.clone()));
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },
            }
        },
    }
}

/// Terminate TLS on one connection, capture the verified client chain,
/// and serve HTTP over it with upgrade support
async fn handle_connection<IO>(io: IO, acceptor: TlsAcceptor, app: Router)
where
    IO: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let tls_stream = match acceptor.accept(io).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(error = %e, "TLS handshake failed");
            return;
        }
    };

    let chain: Vec<Vec<u8>> = tls_stream
        .get_ref()
        .1
        .peer_certificates()
        .map(|certs| certs.iter().map(|c| c.as_ref().to_vec()).collect())
        .unwrap_or_default();

    let service = app.layer(Extension(ClientCertChain::new(chain)));

    if let Err(e) = auto::Builder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(
            TokioIo::new(tls_stream),
            TowerToHyperService::new(service),
        )
        .await
    {
        debug!(error = %e, "connection closed with error");
    }
}

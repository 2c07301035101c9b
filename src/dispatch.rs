//! Per-request routing brain
//!
//! For each authenticated request: classify the path, pick a strategy,
//! and drive the backend proxy or the aggregator.
//!
//! Strategies, in evaluation order:
//! - no namespace segment: proxy to the local API server
//! - a federated resource type: proxy to the namespace's master cluster
//! - a named resource with a cached route: proxy to that worker
//! - otherwise: resolve the worker set; one worker is proxied directly
//!   (the response passes through untouched), several are aggregated

use axum::body::Body;
use axum::extract::State;
use axum::http::header::HOST;
use axum::http::{Method, Request};
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use crate::aggregate::{fan_out, FanOutTarget};
use crate::cache::{RouteCache, RouteKey};
use crate::error::{Error, Result};
use crate::identity::ClientCertChain;
use crate::routing::{classify_path, PathTarget};
use crate::server::AppState;

/// Maximum buffered request body for fan-out requests (10 MB, plenty for
/// the list/table requests that aggregate)
const MAX_FAN_OUT_BODY: usize = 10 * 1024 * 1024;

/// Resource types served by the master cluster, matched case-insensitively
/// by prefix
#[derive(Debug, Clone)]
pub struct FederatedTypes {
    prefixes: Vec<String>,
}

impl FederatedTypes {
    /// Build from configured prefixes; matching is case-insensitive
    pub fn new<I: IntoIterator<Item = String>>(prefixes: I) -> Self {
        Self {
            prefixes: prefixes
                .into_iter()
                .map(|p| p.to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// Whether a path's resource type is owned by the master cluster
    pub fn matches(&self, resource_type: &str) -> bool {
        let resource_type = resource_type.to_lowercase();
        self.prefixes.iter().any(|p| resource_type.starts_with(p))
    }
}

impl Default for FederatedTypes {
    fn default() -> Self {
        Self::new(["federated".to_string()])
    }
}

/// Where a request should go
#[derive(Debug, Clone, PartialEq, Eq)]
enum Strategy {
    /// Local API server, using the proxy's own credentials
    Local,
    /// The namespace's master cluster
    Master,
    /// A single worker known from the route cache
    CachedWorker(String),
    /// Every worker in the namespace's placement
    AllWorkers,
}

fn select_strategy(
    target: &PathTarget,
    federated: &FederatedTypes,
    cache: &RouteCache,
) -> Strategy {
    if target.is_cluster_scoped() {
        return Strategy::Local;
    }
    if federated.matches(&target.resource_type) {
        return Strategy::Master;
    }
    if let Some(key) = RouteKey::new(
        &target.namespace,
        &target.resource_type,
        &target.resource_name,
    ) {
        if let Some(cluster) = cache.get(&key) {
            return Strategy::CachedWorker(cluster);
        }
    }
    Strategy::AllWorkers
}

/// Axum entry point for everything under the API prefix
pub async fn dispatch_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    match dispatch(&state, request).await {
        Ok(response) => response,
        Err(e) => {
            warn!(%method, %path, error = %e, "request failed");
            e.into_response()
        }
    }
}

async fn dispatch(state: &AppState, request: Request<Body>) -> Result<Response> {
    // mTLS identity. The TLS layer already checked any presented chain
    // during the handshake; the authenticator re-verifies against the CA
    // bundle as it is on disk right now, so a broken bundle is a 501 and
    // an absent or untrusted certificate a 401.
    let chain = request
        .extensions()
        .get::<ClientCertChain>()
        .cloned()
        .unwrap_or_default();
    let identity = state.authenticator.authenticate(&chain).await?;

    if let Some(filter) = &state.filter {
        let host = request
            .headers()
            .get(HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !filter.accepts(request.method().as_str(), request.uri().path(), host) {
            return Err(Error::Forbidden(format!(
                "{} {}",
                request.method(),
                request.uri().path()
            )));
        }
    }

    let target = classify_path(request.uri().path());
    let strategy = select_strategy(&target, &state.federated_types, &state.route_cache);
    debug!(
        user = %identity.user,
        namespace = %target.namespace,
        resource_type = %target.resource_type,
        resource_name = %target.resource_name,
        strategy = ?strategy,
        "dispatching request"
    );

    match strategy {
        Strategy::Local => {
            state
                .backends
                .local()
                .forward(&state.api_prefix, &identity, request)
                .await
        }
        Strategy::Master => {
            let placement = state.registry.placement(&target.namespace).await?;
            if placement.master_cluster.is_empty() {
                return Err(Error::ClusterNotFound(format!(
                    "placement for {} names no master cluster",
                    target.namespace
                )));
            }
            let backend = state.backends.for_cluster(&placement.master_cluster).await?;
            backend.forward(&state.api_prefix, &identity, request).await
        }
        Strategy::CachedWorker(cluster) => {
            let backend = state.backends.for_cluster(&cluster).await?;
            let method = request.method().clone();
            let response = backend.forward(&state.api_prefix, &identity, request).await?;

            // A deleted object has no home cluster any more
            if method == Method::DELETE && response.status().is_success() {
                if let Some(key) = RouteKey::new(
                    &target.namespace,
                    &target.resource_type,
                    &target.resource_name,
                ) {
                    state.route_cache.invalidate(&key);
                }
            }
            Ok(response)
        }
        Strategy::AllWorkers => {
            let placement = state.registry.placement(&target.namespace).await?;
            let workers = placement.worker_clusters;
            match workers.as_slice() {
                [] => Err(Error::PlacementNotFound(format!(
                    "placement for {} names no worker clusters",
                    target.namespace
                ))),
                [only] => {
                    // Single worker: no aggregation framing, the backend's
                    // response passes through untouched
                    let backend = state.backends.for_cluster(only).await?;
                    backend.forward(&state.api_prefix, &identity, request).await
                }
                _ => {
                    let mut targets = Vec::with_capacity(workers.len());
                    for worker in &workers {
                        targets.push(FanOutTarget {
                            cluster: worker.clone(),
                            backend: state.backends.for_cluster(worker).await?,
                        });
                    }

                    let (parts, body) = request.into_parts();
                    let bytes = axum::body::to_bytes(body, MAX_FAN_OUT_BODY)
                        .await
                        .map_err(|e| Error::Internal(format!("reading request body: {e}")))?;

                    fan_out(
                        &targets,
                        &state.api_prefix,
                        &identity,
                        parts.method,
                        parts.uri.path(),
                        parts.uri.query(),
                        &parts.headers,
                        bytes,
                        &target,
                        &state.route_cache,
                    )
                    .await
                }
            }
        }
    }
}

//! Error types for the federation proxy

use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for proxy operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Caller presented no client certificate, or one we could not read
    #[error("authentication failed: {0}")]
    Unauthorized(String),

    /// Client-certificate authenticator could not be built for this
    /// request (CA bundle unreadable or unparseable)
    #[error("authentication infrastructure failure: {0}")]
    AuthInfra(String),

    /// Request rejected by the path/host/method filter
    #[error("request rejected by filter: {0}")]
    Forbidden(String),

    /// Request path does not start with the configured API prefix
    #[error("path not found: {0}")]
    PathUnroutable(String),

    /// No NamespacePlacement for the requested namespace
    #[error("no placement for namespace: {0}")]
    PlacementNotFound(String),

    /// A cluster named by a placement has no FederatedCluster record
    #[error("cluster not found: {0}")]
    ClusterNotFound(String),

    /// Central registry unreachable or refused us
    #[error("central registry error: {0}")]
    Registry(String),

    /// Backend transport could not be constructed (TLS material, endpoint URL)
    #[error("backend configuration invalid: {0}")]
    BackendBuild(String),

    /// Dial, TLS, or HTTP failure talking to a backend
    #[error("backend error: {0}")]
    Backend(String),

    /// One or more clusters failed during a fan-out
    #[error("aggregation failed: {}", format_failures(.0))]
    Aggregate(Vec<ClusterFailure>),

    /// Fan-out body was neither a Table nor a *List
    #[error("cannot aggregate response: {0}")]
    AggregationParse(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal server error
    #[error("internal error: {0}")]
    Internal(String),
}

/// Per-cluster failure detail carried by [`Error::Aggregate`]
#[derive(Debug, Clone)]
pub struct ClusterFailure {
    /// Cluster the request was fanned out to
    pub cluster: String,
    /// What went wrong there
    pub message: String,
}

fn format_failures(failures: &[ClusterFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("{}: {}", f.cluster, f.message))
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    fn status(&self) -> StatusCode {
        match self {
            Error::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Error::AuthInfra(_) => StatusCode::NOT_IMPLEMENTED,
            Error::Forbidden(_) => StatusCode::FORBIDDEN,
            Error::PathUnroutable(_) => StatusCode::NOT_FOUND,
            Error::PlacementNotFound(_) | Error::ClusterNotFound(_) => StatusCode::BAD_GATEWAY,
            Error::Registry(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::BackendBuild(_) => StatusCode::NOT_IMPLEMENTED,
            Error::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::Aggregate(_) | Error::AggregationParse(_) => StatusCode::BAD_GATEWAY,
            Error::Config(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();

        // Kubernetes-style Status response so kubectl renders it sensibly
        let mut body = serde_json::json!({
            "kind": "Status",
            "apiVersion": "v1",
            "status": "Failure",
            "message": self.to_string(),
            "code": status.as_u16(),
        });

        if let Error::Aggregate(failures) = &self {
            let causes: Vec<serde_json::Value> = failures
                .iter()
                .map(|f| serde_json::json!({"field": f.cluster, "message": f.message}))
                .collect();
            body["details"] = serde_json::json!({ "causes": causes });
        }

        let bytes = serde_json::to_vec(&body).unwrap_or_default();
        Response::builder()
            .status(status)
            .header("Content-Type", "application/json")
            .body(Body::from(bytes))
            .unwrap_or_else(|_| {
                Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())
                    .unwrap()
            })
    }
}

impl From<kube::Error> for Error {
    fn from(e: kube::Error) -> Self {
        Error::Registry(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Backend(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            Error::Unauthorized("no cert".into()).status(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            Error::AuthInfra("ca unreadable".into()).status(),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(
            Error::Forbidden("path".into()).status(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            Error::PathUnroutable("/x".into()).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::PlacementNotFound("team-a".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            Error::Registry("down".into()).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::BackendBuild("bad pem".into()).status(),
            StatusCode::NOT_IMPLEMENTED
        );
        assert_eq!(
            Error::Backend("refused".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_aggregate_response_lists_clusters() {
        let err = Error::Aggregate(vec![
            ClusterFailure {
                cluster: "w1".into(),
                message: "connection refused".into(),
            },
            ClusterFailure {
                cluster: "w2".into(),
                message: "503".into(),
            },
        ]);
        assert_eq!(err.status(), StatusCode::BAD_GATEWAY);
        let rendered = err.to_string();
        assert!(rendered.contains("w1: connection refused"));
        assert!(rendered.contains("w2: 503"));
    }

    #[test]
    fn test_error_is_k8s_status_json() {
        let response = Error::PlacementNotFound("team-a".into()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
    }
}

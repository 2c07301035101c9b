//! Path utilities for the federation proxy
//!
//! Single source of truth for classifying request paths into
//! (namespace, resource type, resource name) and for the API-prefix
//! rewrite applied before forwarding to a backend.

use std::sync::LazyLock;

use regex::Regex;

/// Pattern for namespace-scoped resource paths, e.g.
/// `/api/v1/namespaces/{ns}/{type}[/{name}]`
static NAMESPACE_PATH: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r".*/namespaces/([^/]*)/([^/]*)/?(.*)").expect("namespace path pattern compiles")
});

/// What a request path says about its target resource
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathTarget {
    /// Namespace segment; empty when the request is not namespace-scoped
    pub namespace: String,
    /// Resource type segment, e.g. "pods" or "federatedservices"
    pub resource_type: String,
    /// Resource name and any trailing subresource path; empty for lists
    pub resource_name: String,
}

impl PathTarget {
    /// True when the path carried no `/namespaces/{ns}/{type}` segment
    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_empty()
    }
}

/// Classify a request path.
///
/// Returns the empty target when the path is not namespace-scoped, which
/// routes the request to the local API server.
pub fn classify_path(path: &str) -> PathTarget {
    match NAMESPACE_PATH.captures(path) {
        Some(caps) => PathTarget {
            namespace: caps[1].to_string(),
            resource_type: caps[2].to_string(),
            resource_name: caps[3].to_string(),
        },
        None => PathTarget::default(),
    }
}

/// Strip the API proxy prefix from a path, always leaving a leading slash.
///
/// Returns `None` when the path does not start with the prefix; the caller
/// answers that with 404. Prefixes starting with `/api` are never stripped,
/// since those paths are already shaped like API-server paths.
pub fn strip_api_prefix<'a>(prefix: &str, path: &'a str) -> Option<&'a str> {
    if prefix.starts_with("/api") {
        return Some(path);
    }
    let stripped = path.strip_prefix(prefix)?;
    if stripped.len() >= path.len() {
        // strip_prefix with an empty prefix; nothing was removed
        return Some(path);
    }
    Some(stripped)
}

/// Rewritten path with the leading slash restored when the strip ate it
pub fn rewritten_path(prefix: &str, path: &str) -> Option<String> {
    let stripped = strip_api_prefix(prefix, path)?;
    if stripped.is_empty() || !stripped.starts_with('/') {
        Some(format!("/{stripped}"))
    } else {
        Some(stripped.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_list_path() {
        let target = classify_path("/api/v1/namespaces/team-a/pods");
        assert_eq!(target.namespace, "team-a");
        assert_eq!(target.resource_type, "pods");
        assert_eq!(target.resource_name, "");
    }

    #[test]
    fn test_classify_named_resource() {
        let target = classify_path("/api/v1/namespaces/team-a/pods/p1");
        assert_eq!(target.namespace, "team-a");
        assert_eq!(target.resource_type, "pods");
        assert_eq!(target.resource_name, "p1");
    }

    #[test]
    fn test_classify_subresource_keeps_tail() {
        let target = classify_path("/api/v1/namespaces/team-a/pods/p1/log");
        assert_eq!(target.resource_name, "p1/log");
    }

    #[test]
    fn test_classify_federated_type() {
        let target = classify_path(
            "/apis/proxy.federation.k8s.io/v1alpha1/namespaces/team-a/federatedservices/foo",
        );
        assert_eq!(target.namespace, "team-a");
        assert_eq!(target.resource_type, "federatedservices");
        assert_eq!(target.resource_name, "foo");
    }

    #[test]
    fn test_classify_cluster_scoped() {
        assert!(classify_path("/api/v1/pods").is_cluster_scoped());
        assert!(classify_path("/apis/rbac.authorization.k8s.io/v1").is_cluster_scoped());
        // Getting a single namespace object is not namespace-scoped either
        assert!(classify_path("/api/v1/namespaces/team-a").is_cluster_scoped());
        assert!(classify_path("/api/v1/namespaces").is_cluster_scoped());
    }

    #[test]
    fn test_classify_totality() {
        for path in ["", "/", "///", "/namespaces/", "/namespaces/a/b"] {
            let target = classify_path(path);
            // Either empty, or the first two segments are present
            if !target.is_cluster_scoped() {
                assert!(!target.namespace.is_empty());
                assert!(!target.resource_type.is_empty());
            }
        }
    }

    #[test]
    fn test_strip_custom_prefix() {
        assert_eq!(
            rewritten_path("/custom/", "/custom/api/v1/pods").as_deref(),
            Some("/api/v1/pods")
        );
        assert_eq!(
            rewritten_path("/k8s-api/", "/k8s-api/v1/pods").as_deref(),
            Some("/v1/pods")
        );
    }

    #[test]
    fn test_strip_leaves_leading_slash() {
        assert_eq!(rewritten_path("/custom/", "/custom/").as_deref(), Some("/"));
    }

    #[test]
    fn test_strip_mismatch_is_none() {
        assert!(rewritten_path("/custom/", "/api/v1/pods").is_none());
    }

    #[test]
    fn test_api_prefix_not_stripped() {
        assert_eq!(
            rewritten_path("/api/", "/api/v1/pods").as_deref(),
            Some("/api/v1/pods")
        );
    }

    #[test]
    fn test_root_prefix_passthrough() {
        assert_eq!(
            rewritten_path("/", "/api/v1/pods").as_deref(),
            Some("/api/v1/pods")
        );
    }
}

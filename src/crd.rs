//! Federation registry resource definitions
//!
//! The proxy is a read-only consumer of two custom resources kept in the
//! central registry: `NamespacePlacement` maps a tenant namespace to its
//! master cluster and worker clusters, and `FederatedCluster` points at a
//! member cluster's API endpoint and credential secret. Both are created
//! and maintained by the federation operator, never by the proxy.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Namespace in the central registry that holds placements and clusters
pub const FEDERATION_NAMESPACE: &str = "federation-system";

/// Namespace in the central registry that holds member-cluster secrets
pub const CLUSTER_SECRET_NAMESPACE: &str = "kube-multicluster-public";

/// Secret on the local API server pointing at the central registry
pub const CENTRAL_KUBECONFIG_SECRET: &str = "kubeconfig-central";

/// Data key under which kubeconfig secrets store their payload
pub const KUBECONFIG_SECRET_KEY: &str = "kubeconfig";

/// Specification for a NamespacePlacement
///
/// Field names are lower-cased single words on the wire, matching the
/// objects the federation operator writes.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "proxy.federation.k8s.io",
    version = "v1alpha1",
    kind = "NamespacePlacement",
    plural = "namespaceplacements",
    namespaced
)]
pub struct NamespacePlacementSpec {
    /// Cluster that owns the namespace's Federated* resources
    #[serde(default, rename = "mastercluster")]
    pub master_cluster: String,

    /// Clusters hosting the namespace's workloads; order is not significant
    /// and duplicates must not occur
    #[serde(default, rename = "workercluster")]
    pub worker_clusters: Vec<String>,
}

/// Specification for a FederatedCluster
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "core.federation.k8s.io",
    version = "v1alpha1",
    kind = "FederatedCluster",
    plural = "federatedclusters",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct FederatedClusterSpec {
    /// API endpoint of the member cluster, e.g. "https://10.0.0.10:6443".
    /// When empty, the endpoint from the credential kubeconfig is used.
    #[serde(default)]
    pub api_endpoint: String,

    /// Reference to the kubeconfig secret in `kube-multicluster-public`
    pub secret_ref: ClusterSecretRef,
}

/// Name of a secret in the cluster-secret namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct ClusterSecretRef {
    /// Secret name
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placement_spec_wire_format() {
        let json = r#"{"mastercluster":"m","workercluster":["w1","w2"]}"#;
        let spec: NamespacePlacementSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.master_cluster, "m");
        assert_eq!(spec.worker_clusters, vec!["w1", "w2"]);

        let out = serde_json::to_value(&spec).unwrap();
        assert!(out.get("mastercluster").is_some());
        assert!(out.get("workercluster").is_some());
    }

    #[test]
    fn test_placement_spec_fields_optional() {
        let spec: NamespacePlacementSpec = serde_json::from_str("{}").unwrap();
        assert!(spec.master_cluster.is_empty());
        assert!(spec.worker_clusters.is_empty());
    }

    #[test]
    fn test_federated_cluster_wire_format() {
        let json = r#"{"apiEndpoint":"https://10.0.0.10:6443","secretRef":{"name":"w1-kubeconfig"}}"#;
        let spec: FederatedClusterSpec = serde_json::from_str(json).unwrap();
        assert_eq!(spec.api_endpoint, "https://10.0.0.10:6443");
        assert_eq!(spec.secret_ref.name, "w1-kubeconfig");
    }

    #[test]
    fn test_placement_resource_metadata() {
        use kube::Resource;
        assert_eq!(NamespacePlacement::kind(&()), "NamespacePlacement");
        assert_eq!(NamespacePlacement::group(&()), "proxy.federation.k8s.io");
        assert_eq!(NamespacePlacement::version(&()), "v1alpha1");
        assert_eq!(NamespacePlacement::plural(&()), "namespaceplacements");
    }
}

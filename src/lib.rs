//! Fedgate - federated Kubernetes API reverse proxy
//!
//! Fedgate sits between kubectl and a set of Kubernetes API servers
//! organized into a central registry cluster, master clusters, and worker
//! clusters. It terminates TLS, authenticates callers by client
//! certificate, routes each request based on its path and the federation
//! metadata in the central registry, forwards the caller's identity via
//! impersonation headers, and merges multi-cluster list and table
//! responses into one federated body.
//!
//! # Architecture
//!
//! ```text
//! kubectl ──► fedgate (mTLS) ──► dispatcher ──► backend proxy ──► API server
//!                                    │
//!                                    └──► aggregator ──► N backend proxies
//! ```
//!
//! # Modules
//!
//! - [`filter`] - Path/host/method accept and reject filtering
//! - [`routing`] - Path classification and API-prefix rewriting
//! - [`crd`] - NamespacePlacement and FederatedCluster resource types
//! - [`registry`] - Central registry reads and backend configuration
//! - [`cache`] - Route cache for named resources
//! - [`identity`] - Caller identity from client certificates
//! - [`backend`] - Dynamic proxy toward one backend, with upgrades
//! - [`aggregate`] - Fan-out and merge across worker clusters
//! - [`dispatch`] - Per-request strategy selection
//! - [`tls`] - Listener TLS with client-certificate verification
//! - [`server`] - Router, listeners, and the accept loop
//! - [`error`] - Error types for the proxy

#![deny(missing_docs)]

pub mod aggregate;
pub mod backend;
pub mod cache;
pub mod crd;
pub mod dispatch;
pub mod error;
pub mod filter;
pub mod identity;
pub mod registry;
pub mod routing;
pub mod server;
pub mod tls;

pub use error::{Error, Result};

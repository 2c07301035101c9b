//! Request filtering by path, host, and method
//!
//! Recreates the `kubectl proxy` accept/reject semantics: a request is
//! served only when its path matches an accept pattern, its host matches
//! an accept pattern, and neither path nor method matches a reject
//! pattern. Rejected requests get a 403 before any routing happens.

use regex::Regex;

use crate::error::{Error, Result};

/// Default value for which hosts to accept.
pub const DEFAULT_ACCEPT_HOSTS: &str = r"^localhost$,^127\.0\.0\.1$,^\[::1\]$";
/// Default paths to accept.
pub const DEFAULT_ACCEPT_PATHS: &str = "^.*";
/// Default paths to reject.
pub const DEFAULT_REJECT_PATHS: &str = "^/api/.*/pods/.*/attach";
/// Default HTTP methods to reject.
pub const DEFAULT_REJECT_METHODS: &str = "^$";

/// Compiled accept/reject regex sets, immutable after construction
#[derive(Debug)]
pub struct RequestFilter {
    /// Only paths matching one of these are accepted
    accept_paths: Vec<Regex>,
    /// Paths matching one of these are rejected, even if accepted above
    reject_paths: Vec<Regex>,
    /// Hosts are required to match one of these
    accept_hosts: Vec<Regex>,
    /// Methods matching one of these are rejected
    reject_methods: Vec<Regex>,
}

/// Split a comma separated list of regexps and compile each entry
pub fn compile_regex_list(list: &str) -> Result<Vec<Regex>> {
    list.split(',')
        .map(|part| {
            Regex::new(part).map_err(|e| Error::Config(format!("bad filter regex {part:?}: {e}")))
        })
        .collect()
}

fn matches_any(value: &str, patterns: &[Regex]) -> bool {
    patterns.iter().any(|re| re.is_match(value))
}

impl RequestFilter {
    /// Compile a filter from four comma separated regex lists
    pub fn from_patterns(
        accept_paths: &str,
        reject_paths: &str,
        accept_hosts: &str,
        reject_methods: &str,
    ) -> Result<Self> {
        Ok(Self {
            accept_paths: compile_regex_list(accept_paths)?,
            reject_paths: compile_regex_list(reject_paths)?,
            accept_hosts: compile_regex_list(accept_hosts)?,
            reject_methods: compile_regex_list(reject_methods)?,
        })
    }

    /// Filter with the kubectl-proxy default patterns
    pub fn with_defaults() -> Self {
        Self::from_patterns(
            DEFAULT_ACCEPT_PATHS,
            DEFAULT_REJECT_PATHS,
            DEFAULT_ACCEPT_HOSTS,
            DEFAULT_REJECT_METHODS,
        )
        .expect("default filter patterns compile")
    }

    /// Whether a request should be served.
    ///
    /// `host` is the raw `Host` header value; the port is stripped before
    /// matching.
    pub fn accepts(&self, method: &str, path: &str, host: &str) -> bool {
        let host = extract_host(host);
        if matches_any(path, &self.reject_paths) {
            tracing::debug!(%path, "filter rejecting path");
            return false;
        }
        if matches_any(method, &self.reject_methods) {
            tracing::debug!(%method, "filter rejecting method");
            return false;
        }
        matches_any(path, &self.accept_paths) && matches_any(host, &self.accept_hosts)
    }
}

/// Get the host from a header value like "localhost" or "localhost:8080".
///
/// Mirrors Go's `net.SplitHostPort` fallback behavior: a bracketed IPv6
/// host loses its brackets only when a port is present, and a value that
/// does not parse as host:port is returned unchanged.
pub fn extract_host(header: &str) -> &str {
    if let Some(rest) = header.strip_prefix('[') {
        if let Some((host, after)) = rest.split_once(']') {
            if after.starts_with(':') {
                return host;
            }
        }
        header
    } else if let Some((host, port)) = header.rsplit_once(':') {
        if !host.contains(':') && !port.is_empty() {
            host
        } else {
            header
        }
    } else {
        header
    }
}

//! Fan-out and merge across worker clusters
//!
//! Sends the same request to every worker cluster concurrently, then
//! fuses the responses into one federated body. Two shapes are
//! recognized: server-side `Table` responses (kubectl's printing format)
//! gain a synthetic trailing `Cluster` column, and `*List` responses get
//! their `items` concatenated. Items keep their per-backend order, and
//! backends are merged in the order their clusters were given.
//!
//! A fan-out is also the moment the proxy learns where named objects
//! live: every object name observed in exactly one cluster is recorded in
//! the route cache so the next request for that name can skip the
//! fan-out.
//!
//! Partial failure is not tolerated: if any backend fails, the whole
//! request fails with a Status body naming each failed cluster.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::Response;
use futures::future::join_all;
use serde_json::{json, Value};
use tracing::debug;

use crate::backend::Backend;
use crate::cache::{RouteCache, RouteKey};
use crate::error::{ClusterFailure, Error, Result};
use crate::identity::IdentityContext;
use crate::routing::PathTarget;

/// One cluster participating in a fan-out
pub struct FanOutTarget {
    /// Cluster name, used for the synthetic column and the route cache
    pub cluster: String,
    /// Backend proxy for that cluster
    pub backend: Arc<Backend>,
}

/// Fan a request out to every target and merge the responses.
///
/// The inbound body is buffered by the caller so each backend gets its
/// own copy.
#[allow(clippy::too_many_arguments)]
pub async fn fan_out(
    targets: &[FanOutTarget],
    api_prefix: &str,
    identity: &IdentityContext,
    method: Method,
    path: &str,
    query: Option<&str>,
    headers: &HeaderMap,
    body: Bytes,
    scope: &PathTarget,
    cache: &RouteCache,
) -> Result<Response> {
    let requests = targets.iter().map(|target| {
        let method = method.clone();
        let body = body.clone();
        async move {
            target
                .backend
                .fetch_buffered(api_prefix, identity, method, path, query, headers, body)
                .await
        }
    });

    // join_all keeps results in target order, which fixes the merge order
    let results = join_all(requests).await;

    let mut failures = Vec::new();
    let mut responses = Vec::new();
    for (target, result) in targets.iter().zip(results) {
        match result {
            Ok((status, bytes)) if status.is_success() => {
                responses.push((target.cluster.clone(), bytes));
            }
            Ok((status, bytes)) => failures.push(ClusterFailure {
                cluster: target.cluster.clone(),
                message: failure_message(status, &bytes),
            }),
            Err(e) => failures.push(ClusterFailure {
                cluster: target.cluster.clone(),
                message: e.to_string(),
            }),
        }
    }

    if !failures.is_empty() {
        return Err(Error::Aggregate(failures));
    }

    let merged = merge_bodies(&responses, scope, cache)?;
    let bytes =
        serde_json::to_vec(&merged).map_err(|e| Error::Internal(format!("encoding merge: {e}")))?;

    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Body::from(bytes))
        .map_err(|e| Error::Internal(format!("building merged response: {e}")))
}

/// Merge per-cluster JSON bodies into one federated object.
///
/// The merged object's kind is the first backend's kind; items appear in
/// backend order with each backend's internal order preserved.
pub fn merge_bodies(
    responses: &[(String, Bytes)],
    scope: &PathTarget,
    cache: &RouteCache,
) -> Result<Value> {
    let (_, first) = responses
        .first()
        .ok_or_else(|| Error::AggregationParse("no responses to merge".into()))?;
    let base: Value = serde_json::from_slice(first)
        .map_err(|e| Error::AggregationParse(format!("unparseable body: {e}")))?;

    let kind = base.get("kind").and_then(|k| k.as_str()).unwrap_or("");
    if kind == "Table" {
        merge_tables(base, responses, scope, cache)
    } else if !kind.is_empty() && kind.ends_with("List") {
        merge_lists(base, responses, scope, cache)
    } else {
        Err(Error::AggregationParse(format!(
            "kind {kind:?} is neither a Table nor a List"
        )))
    }
}

fn merge_tables(
    mut base: Value,
    responses: &[(String, Bytes)],
    scope: &PathTarget,
    cache: &RouteCache,
) -> Result<Value> {
    add_cluster_column(&mut base);

    let mut merged_rows = Vec::new();
    let mut owners: HashMap<String, Vec<String>> = HashMap::new();

    for (i, (cluster, bytes)) in responses.iter().enumerate() {
        let rows = if i == 0 {
            base.get_mut("rows").map(Value::take)
        } else {
            let mut body: Value = serde_json::from_slice(bytes).map_err(|e| {
                Error::AggregationParse(format!("unparseable body from {cluster}: {e}"))
            })?;
            body.get_mut("rows").map(Value::take)
        };

        if let Some(Value::Array(rows)) = rows {
            for mut row in rows {
                match row.get_mut("cells").and_then(|c| c.as_array_mut()) {
                    Some(cells) => cells.push(json!(cluster)),
                    None => {
                        if let Some(obj) = row.as_object_mut() {
                            obj.insert("cells".to_string(), json!([cluster]));
                        }
                    }
                }
                if let Some(name) = table_row_name(&row) {
                    owners.entry(name).or_default().push(cluster.clone());
                }
                merged_rows.push(row);
            }
        }
    }

    base["rows"] = Value::Array(merged_rows);
    save_routes(owners, scope, cache);
    Ok(base)
}

fn merge_lists(
    mut base: Value,
    responses: &[(String, Bytes)],
    scope: &PathTarget,
    cache: &RouteCache,
) -> Result<Value> {
    let mut merged_items = Vec::new();
    let mut owners: HashMap<String, Vec<String>> = HashMap::new();

    for (i, (cluster, bytes)) in responses.iter().enumerate() {
        let items = if i == 0 {
            base.get_mut("items").map(Value::take)
        } else {
            let mut body: Value = serde_json::from_slice(bytes).map_err(|e| {
                Error::AggregationParse(format!("unparseable body from {cluster}: {e}"))
            })?;
            body.get_mut("items").map(Value::take)
        };

        if let Some(Value::Array(items)) = items {
            for item in items {
                if let Some(name) = item
                    .get("metadata")
                    .and_then(|m| m.get("name"))
                    .and_then(|n| n.as_str())
                {
                    owners.entry(name.to_string()).or_default().push(cluster.clone());
                }
                merged_items.push(item);
            }
        }
    }

    base["items"] = Value::Array(merged_items);
    save_routes(owners, scope, cache);
    Ok(base)
}

/// Record routes for names that exactly one cluster reported
fn save_routes(owners: HashMap<String, Vec<String>>, scope: &PathTarget, cache: &RouteCache) {
    for (name, mut clusters) in owners {
        clusters.dedup();
        if clusters.len() != 1 {
            debug!(name = %name, clusters = ?clusters, "name seen in several clusters, not caching");
            continue;
        }
        if let Some(key) = RouteKey::new(&scope.namespace, &scope.resource_type, &name) {
            cache.insert(key, clusters.remove(0));
        }
    }
}

/// Name of the object behind a table row: the embedded object's metadata
/// when the server included it, otherwise the first cell (kubectl tables
/// print NAME first)
fn table_row_name(row: &Value) -> Option<String> {
    if let Some(name) = row
        .get("object")
        .and_then(|o| o.get("metadata"))
        .and_then(|m| m.get("name"))
        .and_then(|n| n.as_str())
    {
        return Some(name.to_string());
    }
    row.get("cells")
        .and_then(|c| c.as_array())
        .and_then(|cells| cells.first())
        .and_then(|c| c.as_str())
        .map(|s| s.to_string())
}

fn add_cluster_column(table: &mut Value) {
    let column = json!({
        "name": "Cluster",
        "type": "string",
        "format": "",
        "description": "Cluster name which this resource belongs to",
        "priority": 0,
    });
    match table
        .get_mut("columnDefinitions")
        .and_then(|c| c.as_array_mut())
    {
        Some(columns) => columns.push(column),
        None => {
            table["columnDefinitions"] = json!([column]);
        }
    }
}

/// Human-readable reason for a failed fan-out leg
fn failure_message(status: StatusCode, body: &Bytes) -> String {
    let detail = serde_json::from_slice::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from));
    match detail {
        Some(message) => format!("{status}: {message}"),
        None => status.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scope() -> PathTarget {
        PathTarget {
            namespace: "team-a".into(),
            resource_type: "pods".into(),
            resource_name: String::new(),
        }
    }

    fn pod_list(names: &[&str]) -> Bytes {
        let items: Vec<Value> = names
            .iter()
            .map(|n| json!({"metadata": {"name": n, "namespace": "team-a"}}))
            .collect();
        Bytes::from(
            serde_json::to_vec(&json!({
                "kind": "PodList",
                "apiVersion": "v1",
                "items": items,
            }))
            .unwrap(),
        )
    }

    fn pod_table(names: &[&str]) -> Bytes {
        let rows: Vec<Value> = names
            .iter()
            .map(|n| {
                json!({
                    "cells": [n, "1/1", "Running"],
                    "object": {"metadata": {"name": n}},
                })
            })
            .collect();
        Bytes::from(
            serde_json::to_vec(&json!({
                "kind": "Table",
                "apiVersion": "meta.k8s.io/v1beta1",
                "columnDefinitions": [
                    {"name": "Name", "type": "string"},
                    {"name": "Ready", "type": "string"},
                    {"name": "Status", "type": "string"},
                ],
                "rows": rows,
            }))
            .unwrap(),
        )
    }

    #[test]
    fn test_list_merge_preserves_order_and_length() {
        let cache = RouteCache::default();
        let responses = vec![
            ("w1".to_string(), pod_list(&["a", "b"])),
            ("w2".to_string(), pod_list(&["c"])),
            ("w3".to_string(), pod_list(&["d", "e", "f"])),
        ];
        let merged = merge_bodies(&responses, &scope(), &cache).unwrap();

        assert_eq!(merged["kind"], "PodList");
        let items = merged["items"].as_array().unwrap();
        assert_eq!(items.len(), 6);
        let names: Vec<&str> = items
            .iter()
            .map(|i| i["metadata"]["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a", "b", "c", "d", "e", "f"]);
    }

    #[test]
    fn test_list_merge_populates_route_cache() {
        let cache = RouteCache::default();
        let responses = vec![
            ("w1".to_string(), pod_list(&["a"])),
            ("w2".to_string(), pod_list(&["b"])),
        ];
        merge_bodies(&responses, &scope(), &cache).unwrap();

        let key = RouteKey::new("team-a", "pods", "a").unwrap();
        assert_eq!(cache.get(&key).as_deref(), Some("w1"));
        let key = RouteKey::new("team-a", "pods", "b").unwrap();
        assert_eq!(cache.get(&key).as_deref(), Some("w2"));
    }

    #[test]
    fn test_ambiguous_names_are_not_cached() {
        let cache = RouteCache::default();
        let responses = vec![
            ("w1".to_string(), pod_list(&["dup"])),
            ("w2".to_string(), pod_list(&["dup"])),
        ];
        merge_bodies(&responses, &scope(), &cache).unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_table_merge_adds_cluster_column_and_cells() {
        let cache = RouteCache::default();
        let responses = vec![
            ("w1".to_string(), pod_table(&["a", "b"])),
            ("w2".to_string(), pod_table(&["c"])),
        ];
        let merged = merge_bodies(&responses, &scope(), &cache).unwrap();

        assert_eq!(merged["kind"], "Table");
        let columns = merged["columnDefinitions"].as_array().unwrap();
        assert_eq!(columns.len(), 4);
        let last = columns.last().unwrap();
        assert_eq!(last["name"], "Cluster");
        assert_eq!(last["type"], "string");

        let rows = merged["rows"].as_array().unwrap();
        assert_eq!(rows.len(), 3);
        for row in rows {
            let cells = row["cells"].as_array().unwrap();
            assert_eq!(cells.len(), 4);
        }
        assert_eq!(rows[0]["cells"][3], "w1");
        assert_eq!(rows[2]["cells"][3], "w2");
    }

    #[test]
    fn test_table_merge_caches_row_routes() {
        let cache = RouteCache::default();
        let responses = vec![
            ("w1".to_string(), pod_table(&["p1"])),
            ("w2".to_string(), pod_table(&["p2"])),
        ];
        merge_bodies(&responses, &scope(), &cache).unwrap();

        let key = RouteKey::new("team-a", "pods", "p1").unwrap();
        assert_eq!(cache.get(&key).as_deref(), Some("w1"));
    }

    #[test]
    fn test_table_row_name_falls_back_to_first_cell() {
        let row = json!({"cells": ["from-cell", "1/1"]});
        assert_eq!(table_row_name(&row).as_deref(), Some("from-cell"));

        let row = json!({"cells": ["cell"], "object": {"metadata": {"name": "from-meta"}}});
        assert_eq!(table_row_name(&row).as_deref(), Some("from-meta"));
    }

    #[test]
    fn test_merged_kind_is_first_backends_kind() {
        let cache = RouteCache::default();
        let responses = vec![
            ("w1".to_string(), pod_list(&["a"])),
            ("w2".to_string(), pod_list(&["b"])),
        ];
        let merged = merge_bodies(&responses, &scope(), &cache).unwrap();
        assert_eq!(merged["kind"], "PodList");
        assert_eq!(merged["apiVersion"], "v1");
    }

    #[test]
    fn test_unrecognized_kind_fails() {
        let cache = RouteCache::default();
        let body = Bytes::from(r#"{"kind":"Pod","metadata":{"name":"p"}}"#);
        let err = merge_bodies(&[("w1".to_string(), body)], &scope(), &cache).unwrap_err();
        assert!(matches!(err, Error::AggregationParse(_)));
    }

    #[test]
    fn test_unparseable_body_fails() {
        let cache = RouteCache::default();
        let body = Bytes::from("not json");
        let err = merge_bodies(&[("w1".to_string(), body)], &scope(), &cache).unwrap_err();
        assert!(matches!(err, Error::AggregationParse(_)));
    }

    #[test]
    fn test_failure_message_prefers_status_body() {
        let body = Bytes::from(r#"{"kind":"Status","message":"pods is forbidden"}"#);
        let msg = failure_message(StatusCode::FORBIDDEN, &body);
        assert!(msg.contains("pods is forbidden"));

        let msg = failure_message(StatusCode::BAD_GATEWAY, &Bytes::from_static(b"<html>"));
        assert!(msg.contains("502"));
    }
}

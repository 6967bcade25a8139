//! Capability surface of the target cluster, as consumed by the engine.

use std::collections::BTreeMap;

pub use kube::core::GroupVersionKind;
use serde_json::Value as Json;

use crate::inventory::ObjectRef;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("immutable field change: {0}")]
    Immutable(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("timed out: {0}")]
    Timeout(String),
    #[error("{0}")]
    Other(String),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound(_))
    }
}

/// Object-level operations against one cluster with one credential.
#[async_trait::async_trait]
pub trait Cluster: Send + Sync {
    /// Live object, `None` when absent.
    async fn get(&self, id: &ObjectRef) -> Result<Option<Json>, ClusterError>;

    /// Upsert with server-side apply semantics; returns the live object after apply.
    async fn apply(&self, object: &Json) -> Result<Json, ClusterError>;

    /// Delete; `NotFound` when the object is already gone.
    async fn delete(&self, id: &ObjectRef) -> Result<(), ClusterError>;

    /// Objects of one kind, across namespaces, carrying all of `labels`.
    async fn list_by_label(
        &self,
        gvk: &GroupVersionKind,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Json>, ClusterError>;
}

/// Read `metadata.<field>` as a string map (labels, annotations).
pub fn metadata_map<'a>(obj: &'a Json, field: &str) -> Option<&'a serde_json::Map<String, Json>> {
    obj.get("metadata")?.get(field)?.as_object()
}

pub fn has_labels(obj: &Json, labels: &BTreeMap<String, String>) -> bool {
    let Some(have) = metadata_map(obj, "labels") else { return labels.is_empty() };
    labels
        .iter()
        .all(|(k, v)| have.get(k).and_then(|x| x.as_str()) == Some(v.as_str()))
}

pub fn annotation<'a>(obj: &'a Json, key: &str) -> Option<&'a str> {
    metadata_map(obj, "annotations")?.get(key)?.as_str()
}

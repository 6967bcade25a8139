//! Multi-document manifest parsing with size and complexity budgets.

use std::collections::HashSet;

use converge_core::ObjectRef;
use serde::Deserialize;
use serde_json::Value as Json;

const DEFAULT_MAX_BYTES: usize = 8 * 1024 * 1024;
const DEFAULT_MAX_NODES: usize = 1_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestLimits {
    pub max_bytes: usize,
    pub max_nodes: usize,
}

impl Default for ManifestLimits {
    fn default() -> Self {
        Self { max_bytes: DEFAULT_MAX_BYTES, max_nodes: DEFAULT_MAX_NODES }
    }
}

impl ManifestLimits {
    /// Defaults overridden by `CONVERGE_MAX_YAML_BYTES` / `CONVERGE_MAX_YAML_NODES`.
    pub fn from_env() -> Self {
        let read = |name: &str, default: usize| {
            std::env::var(name).ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(default)
        };
        Self {
            max_bytes: read("CONVERGE_MAX_YAML_BYTES", DEFAULT_MAX_BYTES),
            max_nodes: read("CONVERGE_MAX_YAML_NODES", DEFAULT_MAX_NODES),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ManifestError {
    #[error("manifests too large (>{0} bytes)")]
    TooLarge(usize),
    #[error("manifests too complex (>{0} nodes)")]
    TooComplex(usize),
    #[error("parsing YAML: {0}")]
    Yaml(String),
    #[error("document {index} missing {field}")]
    MissingField { index: usize, field: &'static str },
    #[error("duplicate object {0}")]
    Duplicate(String),
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max {
            return;
        }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for vv in map.values() {
                    if *cur >= max {
                        break;
                    }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max {
                        break;
                    }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Parse a multi-document YAML stream into objects, flattening `*List` kinds.
/// Every object must carry apiVersion, kind and metadata.name, and appear once.
pub fn parse_manifests(bytes: &[u8], limits: &ManifestLimits) -> Result<Vec<Json>, ManifestError> {
    if bytes.len() > limits.max_bytes {
        return Err(ManifestError::TooLarge(limits.max_bytes));
    }
    let mut objects = Vec::new();
    let mut nodes = 0usize;
    for de in serde_yaml::Deserializer::from_slice(bytes) {
        let doc = Json::deserialize(de).map_err(|e| ManifestError::Yaml(e.to_string()))?;
        if doc.is_null() {
            continue;
        }
        if json_node_budget_exceeded(&doc, limits.max_nodes.saturating_sub(nodes)) {
            return Err(ManifestError::TooComplex(limits.max_nodes));
        }
        nodes += count_nodes(&doc);
        flatten(doc, &mut objects);
    }

    let mut seen = HashSet::new();
    for (index, obj) in objects.iter().enumerate() {
        for (field, present) in [
            ("apiVersion", obj.get("apiVersion").and_then(|v| v.as_str()).is_some()),
            ("kind", obj.get("kind").and_then(|v| v.as_str()).is_some()),
            ("metadata.name", obj.get("metadata").and_then(|m| m.get("name")).and_then(|v| v.as_str()).is_some()),
        ] {
            if !present {
                return Err(ManifestError::MissingField { index, field });
            }
        }
        if let Some(id) = ObjectRef::from_object(obj) {
            if !seen.insert(id.object_key()) {
                return Err(ManifestError::Duplicate(id.to_string()));
            }
        }
    }
    Ok(objects)
}

fn count_nodes(v: &Json) -> usize {
    1 + match v {
        Json::Object(map) => map.values().map(count_nodes).sum(),
        Json::Array(arr) => arr.iter().map(count_nodes).sum(),
        _ => 0,
    }
}

fn flatten(doc: Json, out: &mut Vec<Json>) {
    let is_list = doc.get("kind").and_then(|k| k.as_str()).map(|k| k.ends_with("List")).unwrap_or(false)
        && doc.get("items").map(|i| i.is_array()).unwrap_or(false);
    if !is_list {
        out.push(doc);
        return;
    }
    if let Json::Object(mut map) = doc {
        if let Some(Json::Array(items)) = map.remove("items") {
            for item in items {
                flatten(item, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_streams_and_flattens_lists() {
        let y = "---\napiVersion: v1\nkind: Namespace\nmetadata:\n  name: apps\n---\n# comment only\n---\napiVersion: v1\nkind: List\nitems:\n- apiVersion: v1\n  kind: ConfigMap\n  metadata:\n    name: a\n- apiVersion: v1\n  kind: ConfigMap\n  metadata:\n    name: b\n";
        let objs = parse_manifests(y.as_bytes(), &ManifestLimits::default()).unwrap();
        let names: Vec<_> = objs.iter().map(|o| o["metadata"]["name"].as_str().unwrap().to_string()).collect();
        assert_eq!(names, vec!["apps", "a", "b"]);
    }

    #[test]
    fn missing_identity_fields_are_reported() {
        let y1 = "kind: Foo\nmetadata:\n  name: x\n";
        let e1 = parse_manifests(y1.as_bytes(), &ManifestLimits::default()).unwrap_err();
        assert_eq!(e1, ManifestError::MissingField { index: 0, field: "apiVersion" });

        let y3 = "apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n";
        let e3 = parse_manifests(y3.as_bytes(), &ManifestLimits::default()).unwrap_err();
        assert!(e3.to_string().contains("missing metadata.name"), "e3={}", e3);
    }

    #[test]
    fn duplicates_are_rejected() {
        let y = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n";
        let e = parse_manifests(y.as_bytes(), &ManifestLimits::default()).unwrap_err();
        assert!(matches!(e, ManifestError::Duplicate(_)));
    }

    #[test]
    fn budgets_are_enforced() {
        let y = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\ndata:\n  k: v\n";
        let tight = ManifestLimits { max_bytes: 10, max_nodes: 100 };
        assert_eq!(parse_manifests(y.as_bytes(), &tight), Err(ManifestError::TooLarge(10)));
        let tight = ManifestLimits { max_bytes: 1024, max_nodes: 4 };
        assert_eq!(parse_manifests(y.as_bytes(), &tight), Err(ManifestError::TooComplex(4)));
    }
}

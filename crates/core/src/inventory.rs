//! Object identities and the per-unit inventory of applied objects.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value as Json;

/// Identity of a cluster object. Field order gives the deterministic
/// group/kind/namespace/name sort used in diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub group: String,
    pub kind: String,
    /// Empty for cluster-scoped objects.
    pub namespace: String,
    pub name: String,
    pub version: String,
}

impl ObjectRef {
    pub fn new(api_version: &str, kind: &str, namespace: &str, name: &str) -> Self {
        let (group, version) = split_api_version(api_version);
        Self {
            group,
            version,
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        }
    }

    /// Read the identity of a raw object. `None` when apiVersion, kind or metadata.name is missing.
    pub fn from_object(obj: &Json) -> Option<Self> {
        let api_version = obj.get("apiVersion")?.as_str()?;
        let kind = obj.get("kind")?.as_str()?;
        let meta = obj.get("metadata")?;
        let name = meta.get("name")?.as_str()?;
        let namespace = meta.get("namespace").and_then(|v| v.as_str()).unwrap_or("");
        Some(Self::new(api_version, kind, namespace, name))
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn is_cluster_scoped(&self) -> bool {
        self.namespace.is_empty()
    }

    /// Same object regardless of the served version.
    pub fn same_object(&self, other: &ObjectRef) -> bool {
        self.group == other.group
            && self.kind == other.kind
            && self.namespace == other.namespace
            && self.name == other.name
    }

    pub fn object_key(&self) -> ObjectKey {
        ObjectKey {
            group: self.group.clone(),
            kind: self.kind.clone(),
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }

    /// `<namespace>_<name>_<group>_<kind>`
    pub fn inventory_id(&self) -> String {
        format!("{}_{}_{}_{}", self.namespace, self.name, self.group, self.kind)
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}/{}", self.kind, self.name)
        } else {
            write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
        }
    }
}

/// Version-less identity, used for set arithmetic between renders and inventories.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

pub fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InventoryError {
    #[error("malformed inventory entry {id:?}: {reason}")]
    Malformed { id: String, reason: &'static str },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryEntry {
    pub id: String,
    pub v: String,
}

/// Objects applied by the last (partially) successful reconciliation, in apply order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    #[serde(default)]
    pub entries: Vec<InventoryEntry>,
}

impl Inventory {
    pub fn from_refs<'a>(refs: impl IntoIterator<Item = &'a ObjectRef>) -> Self {
        let entries = refs
            .into_iter()
            .map(|r| InventoryEntry { id: r.inventory_id(), v: r.version.clone() })
            .collect();
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Decode every entry; the first malformed id fails the whole inventory.
    pub fn refs(&self) -> Result<Vec<ObjectRef>, InventoryError> {
        self.entries.iter().map(|e| parse_entry(&e.id, &e.v)).collect()
    }
}

/// Kind and group are read from the right and the namespace from the left; none
/// of them can hold `_`, so whatever is left is the name.
fn parse_entry(id: &str, version: &str) -> Result<ObjectRef, InventoryError> {
    let malformed = |reason| InventoryError::Malformed { id: id.to_string(), reason };
    let shape = "expected <namespace>_<name>_<group>_<kind>";
    let mut tail = id.rsplitn(3, '_');
    let (Some(kind), Some(group), Some(rest)) = (tail.next(), tail.next(), tail.next()) else {
        return Err(malformed(shape));
    };
    let Some((namespace, name)) = rest.split_once('_') else {
        return Err(malformed(shape));
    };
    if name.is_empty() {
        return Err(malformed("empty name"));
    }
    if kind.is_empty() {
        return Err(malformed("empty kind"));
    }
    if version.is_empty() {
        return Err(malformed("empty version"));
    }
    Ok(ObjectRef {
        group: group.to_string(),
        kind: kind.to_string(),
        namespace: namespace.to_string(),
        name: name.to_string(),
        version: version.to_string(),
    })
}

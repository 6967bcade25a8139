//! converge schema: an injectable registry of known kinds (scope, plural, preferred version).
//!
//! Built once at process start, seeded with the builtin kinds, extended by discovery and by
//! CustomResourceDefinitions applied during a reconciliation, then shared by reference.

#![forbid(unsafe_code)]

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use kube::core::GroupVersionKind;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use converge_core::Json;
use tracing::debug;

pub const CRD_GROUP: &str = "apiextensions.k8s.io";
pub const CRD_KIND: &str = "CustomResourceDefinition";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeInfo {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl TypeInfo {
    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind { group: self.group.clone(), version: self.version.clone(), kind: self.kind.clone() }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("object is not a CustomResourceDefinition")]
    NotACrd,
    #[error("CustomResourceDefinition missing {0}")]
    MissingField(&'static str),
}

// (group, version, kind, plural, namespaced)
const BUILTINS: &[(&str, &str, &str, &str, bool)] = &[
    ("", "v1", "Namespace", "namespaces", false),
    ("", "v1", "ConfigMap", "configmaps", true),
    ("", "v1", "Secret", "secrets", true),
    ("", "v1", "Service", "services", true),
    ("", "v1", "ServiceAccount", "serviceaccounts", true),
    ("", "v1", "Pod", "pods", true),
    ("", "v1", "PersistentVolumeClaim", "persistentvolumeclaims", true),
    ("", "v1", "PersistentVolume", "persistentvolumes", false),
    ("", "v1", "Endpoints", "endpoints", true),
    ("", "v1", "LimitRange", "limitranges", true),
    ("", "v1", "ResourceQuota", "resourcequotas", true),
    ("apps", "v1", "Deployment", "deployments", true),
    ("apps", "v1", "StatefulSet", "statefulsets", true),
    ("apps", "v1", "DaemonSet", "daemonsets", true),
    ("apps", "v1", "ReplicaSet", "replicasets", true),
    ("batch", "v1", "Job", "jobs", true),
    ("batch", "v1", "CronJob", "cronjobs", true),
    ("networking.k8s.io", "v1", "Ingress", "ingresses", true),
    ("networking.k8s.io", "v1", "IngressClass", "ingressclasses", false),
    ("networking.k8s.io", "v1", "NetworkPolicy", "networkpolicies", true),
    ("rbac.authorization.k8s.io", "v1", "Role", "roles", true),
    ("rbac.authorization.k8s.io", "v1", "RoleBinding", "rolebindings", true),
    ("rbac.authorization.k8s.io", "v1", "ClusterRole", "clusterroles", false),
    ("rbac.authorization.k8s.io", "v1", "ClusterRoleBinding", "clusterrolebindings", false),
    ("apiextensions.k8s.io", "v1", "CustomResourceDefinition", "customresourcedefinitions", false),
    ("storage.k8s.io", "v1", "StorageClass", "storageclasses", false),
    ("scheduling.k8s.io", "v1", "PriorityClass", "priorityclasses", false),
    ("autoscaling", "v2", "HorizontalPodAutoscaler", "horizontalpodautoscalers", true),
    ("policy", "v1", "PodDisruptionBudget", "poddisruptionbudgets", true),
    ("admissionregistration.k8s.io", "v1", "MutatingWebhookConfiguration", "mutatingwebhookconfigurations", false),
    ("admissionregistration.k8s.io", "v1", "ValidatingWebhookConfiguration", "validatingwebhookconfigurations", false),
    ("apiregistration.k8s.io", "v1", "APIService", "apiservices", false),
    ("kustomize.converge.dev", "v1beta2", "Kustomization", "kustomizations", true),
];

/// Kind lookup table keyed by (group, kind). The version is the preferred one.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: RwLock<FxHashMap<(String, String), TypeInfo>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let reg = Self::new();
        for (group, version, kind, plural, namespaced) in BUILTINS {
            reg.register(TypeInfo {
                group: group.to_string(),
                version: version.to_string(),
                kind: kind.to_string(),
                plural: plural.to_string(),
                namespaced: *namespaced,
            });
        }
        reg
    }

    fn read(&self) -> RwLockReadGuard<'_, FxHashMap<(String, String), TypeInfo>> {
        self.types.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, FxHashMap<(String, String), TypeInfo>> {
        self.types.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, info: TypeInfo) {
        self.write().insert((info.group.clone(), info.kind.clone()), info);
    }

    /// Register the kind served by a CustomResourceDefinition object.
    pub fn register_crd(&self, crd: &Json) -> Result<TypeInfo, SchemaError> {
        let info = crd_type_info(crd)?;
        debug!(group = %info.group, kind = %info.kind, version = %info.version, namespaced = info.namespaced, "registered CRD kind");
        self.register(info.clone());
        Ok(info)
    }

    pub fn lookup(&self, group: &str, kind: &str) -> Option<TypeInfo> {
        self.read().get(&(group.to_string(), kind.to_string())).cloned()
    }

    /// `None` for kinds the registry has never seen.
    pub fn is_namespaced(&self, group: &str, kind: &str) -> Option<bool> {
        self.lookup(group, kind).map(|t| t.namespaced)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All known kinds, sorted by group then kind.
    pub fn all(&self) -> Vec<TypeInfo> {
        let mut out: Vec<TypeInfo> = self.read().values().cloned().collect();
        out.sort_by(|a, b| (&a.group, &a.kind).cmp(&(&b.group, &b.kind)));
        out
    }
}

pub fn is_crd(obj: &Json) -> bool {
    let api_version = obj.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("");
    let kind = obj.get("kind").and_then(|v| v.as_str()).unwrap_or("");
    kind == CRD_KIND && api_version.split('/').next() == Some(CRD_GROUP)
}

fn crd_type_info(crd: &Json) -> Result<TypeInfo, SchemaError> {
    if !is_crd(crd) {
        return Err(SchemaError::NotACrd);
    }
    let spec = crd.get("spec").ok_or(SchemaError::MissingField("spec"))?;
    let str_at = |v: Option<&Json>, field: &'static str| {
        v.and_then(|s| s.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .ok_or(SchemaError::MissingField(field))
    };
    let group = str_at(spec.get("group"), "spec.group")?;
    let names = spec.get("names");
    let kind = str_at(names.and_then(|n| n.get("kind")), "spec.names.kind")?;
    let plural = str_at(names.and_then(|n| n.get("plural")), "spec.names.plural")?;
    let namespaced = spec.get("scope").and_then(|s| s.as_str()).unwrap_or("Namespaced") != "Cluster";

    // Prefer the storage version, then the first served one, then the first listed.
    let versions = spec.get("versions").and_then(|v| v.as_array()).cloned().unwrap_or_default();
    let flag = |ver: &Json, f: &str| ver.get(f).and_then(|b| b.as_bool()).unwrap_or(false);
    let chosen = versions
        .iter()
        .find(|v| flag(v, "storage"))
        .or_else(|| versions.iter().find(|v| flag(v, "served")))
        .or_else(|| versions.first());
    let version = match chosen.and_then(|v| v.get("name")).and_then(|s| s.as_str()) {
        Some(v) => v.to_string(),
        None => str_at(spec.get("version"), "spec.versions")?,
    };
    Ok(TypeInfo { group, version, kind, plural, namespaced })
}

/// Resolve a dotted path with optional `[index]` segments, e.g. `status.conditions[0].type`.
pub fn value_at<'a>(root: &'a Json, path: &str) -> Option<&'a Json> {
    let mut cur = root;
    for seg in path.split('.') {
        if seg.is_empty() {
            return None;
        }
        let (key, idx) = match seg.find('[') {
            Some(brk) => {
                let end = seg.get(brk + 1..)?.find(']')? + brk + 1;
                (&seg[..brk], Some(seg[brk + 1..end].parse::<usize>().ok()?))
            }
            None => (seg, None),
        };
        cur = cur.as_object()?.get(key)?;
        if let Some(i) = idx {
            cur = cur.as_array()?.get(i)?;
        }
    }
    Some(cur)
}

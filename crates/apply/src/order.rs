//! Stable apply order by kind.

use serde_json::Value as Json;

// Applied first to last; unlisted kinds go between these and `LAST`.
const FIRST: &[&str] = &[
    "Namespace",
    "CustomResourceDefinition",
    "ResourceQuota",
    "LimitRange",
    "StorageClass",
    "PriorityClass",
    "PodDisruptionBudget",
    "ServiceAccount",
    "Secret",
    "ConfigMap",
    "PersistentVolume",
    "PersistentVolumeClaim",
    "ClusterRole",
    "ClusterRoleBinding",
    "Role",
    "RoleBinding",
    "Service",
    "Endpoints",
    "IngressClass",
];

const LAST: &[&str] = &["MutatingWebhookConfiguration", "ValidatingWebhookConfiguration", "APIService"];

pub fn kind_rank(kind: &str) -> usize {
    if let Some(i) = FIRST.iter().position(|k| *k == kind) {
        return i;
    }
    match LAST.iter().position(|k| *k == kind) {
        Some(i) => FIRST.len() + 1 + i,
        None => FIRST.len(),
    }
}

/// Sort objects into apply order; render order is kept within a rank.
pub fn sort_for_apply(objects: &mut [Json]) {
    objects.sort_by_key(|o| kind_rank(o.get("kind").and_then(|k| k.as_str()).unwrap_or("")));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn namespaces_and_crds_first_webhooks_last() {
        let mut objs = vec![
            json!({ "kind": "ValidatingWebhookConfiguration", "n": 1 }),
            json!({ "kind": "Deployment", "n": 2 }),
            json!({ "kind": "Widget", "n": 3 }),
            json!({ "kind": "CustomResourceDefinition", "n": 4 }),
            json!({ "kind": "Namespace", "n": 5 }),
            json!({ "kind": "ConfigMap", "n": 6 }),
        ];
        sort_for_apply(&mut objs);
        let order: Vec<i64> = objs.iter().map(|o| o["n"].as_i64().unwrap()).collect();
        assert_eq!(order, vec![5, 4, 6, 2, 3, 1]);
    }
}

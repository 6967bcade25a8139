//! Declared-versus-live comparison used to skip no-op applies.

use converge_core::types::CHECKSUM_ANNOTATION;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    pub adds: usize,
    pub updates: usize,
    pub removes: usize,
}

impl DiffSummary {
    /// Every declared field already holds the declared value. Fields only present
    /// on the live side (server defaults) do not count.
    pub fn declared_fields_match(&self) -> bool {
        self.adds == 0 && self.updates == 0
    }
}

/// Drop server-populated fields before comparing.
pub fn strip_noisy(mut v: Json) -> Json {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        for field in ["managedFields", "resourceVersion", "generation", "creationTimestamp", "uid", "selfLink"] {
            meta.remove(field);
        }
        if let Some(annotations) = meta.get_mut("annotations").and_then(|a| a.as_object_mut()) {
            annotations.remove("kubectl.kubernetes.io/last-applied-configuration");
        }
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// SHA-256 over the declared object, excluding its own checksum annotation.
/// Map keys serialize sorted, so equal objects give equal digests.
pub fn applied_checksum(obj: &Json) -> String {
    let mut declared = strip_noisy(obj.clone());
    if let Some(annotations) = declared
        .get_mut("metadata")
        .and_then(|m| m.get_mut("annotations"))
        .and_then(|a| a.as_object_mut())
    {
        annotations.remove(CHECKSUM_ANNOTATION);
        if annotations.is_empty() {
            if let Some(meta) = declared.get_mut("metadata").and_then(|m| m.as_object_mut()) {
                meta.remove("annotations");
            }
        }
    }
    let bytes = serde_json::to_vec(&declared).unwrap_or_default();
    format!("{:x}", Sha256::digest(&bytes))
}

/// Count fields `target` adds, changes or lacks relative to `base`. Arrays are
/// compared element-wise; a length mismatch counts as updates.
pub fn diff_summary(target: &Json, base: &Json) -> DiffSummary {
    fn walk(a: &Json, b: &Json, s: &mut DiffSummary) {
        match (a, b) {
            (Json::Object(ao), Json::Object(bo)) => {
                for (k, av) in ao.iter() {
                    match bo.get(k) {
                        Some(bv) if av == bv => {}
                        Some(bv) => walk(av, bv, s),
                        None => s.adds += 1,
                    }
                }
                s.removes += bo.keys().filter(|k| !ao.contains_key(*k)).count();
            }
            (Json::Array(aa), Json::Array(bb)) => {
                for (av, bv) in aa.iter().zip(bb.iter()) {
                    if av != bv {
                        walk(av, bv, s);
                    }
                }
                s.updates += aa.len().abs_diff(bb.len());
            }
            (av, bv) => {
                if av != bv {
                    s.updates += 1;
                }
            }
        }
    }
    let mut s = DiffSummary::default();
    walk(target, base, &mut s);
    s
}

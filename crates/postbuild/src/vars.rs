//! Key material and substitution variables read from the unit's namespace.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use converge_core::{Cluster, Kustomization, ObjectRef};
use serde_json::Value as Json;
use tracing::debug;

use crate::sops::{DataKey, DATA_KEY_SUFFIX};
use crate::subst::Vars;
use crate::PostBuildError;
use converge_core::types::{PostBuild, SubstituteKind};

/// Flatten a ConfigMap or Secret into string pairs. Secret `data` is base64-decoded,
/// `stringData` wins over `data` for the same key.
pub fn object_pairs(obj: &Json, kind: SubstituteKind) -> Result<Vars, String> {
    let mut out = Vars::new();
    let field = |name: &str| obj.get(name).and_then(|d| d.as_object());
    match kind {
        SubstituteKind::ConfigMap => {
            for (k, v) in field("data").into_iter().flatten() {
                out.insert(k.clone(), v.as_str().unwrap_or_default().to_string());
            }
        }
        SubstituteKind::Secret => {
            for (k, v) in field("data").into_iter().flatten() {
                let raw = STANDARD
                    .decode(v.as_str().unwrap_or_default())
                    .map_err(|e| format!("key {}: {}", k, e))?;
                let text = String::from_utf8(raw).map_err(|_| format!("key {}: value is not UTF-8", k))?;
                out.insert(k.clone(), text);
            }
            for (k, v) in field("stringData").into_iter().flatten() {
                out.insert(k.clone(), v.as_str().unwrap_or_default().to_string());
            }
        }
    }
    Ok(out)
}

fn kind_name(kind: SubstituteKind) -> &'static str {
    match kind {
        SubstituteKind::Secret => "Secret",
        SubstituteKind::ConfigMap => "ConfigMap",
    }
}

/// Merge `substituteFrom` sources in order, then the inline `substitute` map on top.
pub async fn collect_vars(cluster: &dyn Cluster, unit: &Kustomization, post_build: &PostBuild) -> Result<Vars, PostBuildError> {
    let ns = unit.namespace_or_default();
    let mut vars = Vars::new();
    for src in &post_build.substitute_from {
        let kind = kind_name(src.kind);
        let id = ObjectRef::new("v1", kind, &ns, &src.name);
        let fail = |msg: String| PostBuildError::Substitution(format!("substitute from '{}/{}': {}", kind, src.name, msg));
        match cluster.get(&id).await {
            Ok(Some(obj)) => vars.extend(object_pairs(&obj, src.kind).map_err(fail)?),
            Ok(None) if src.optional => {
                debug!(unit = %unit.key(), source = %id, "optional substitution source not found");
            }
            Ok(None) => return Err(fail("not found".into())),
            Err(e) if e.is_not_found() && src.optional => {}
            Err(e) => return Err(fail(e.to_string())),
        }
    }
    vars.extend(post_build.substitute.iter().map(|(k, v)| (k.clone(), v.clone())));
    Ok(vars)
}

/// Data keys from the decryption secret: every entry whose key ends in `.datakey`.
pub async fn load_data_keys(cluster: &dyn Cluster, unit: &Kustomization) -> Result<Vec<DataKey>, PostBuildError> {
    let Some(dec) = unit.spec.decryption.as_ref() else { return Ok(Vec::new()) };
    if dec.provider != "sops" {
        return Err(PostBuildError::Decryption(format!("unsupported decryption provider '{}'", dec.provider)));
    }
    let Some(secret_ref) = dec.secret_ref.as_ref() else { return Ok(Vec::new()) };
    let id = ObjectRef::new("v1", "Secret", &unit.namespace_or_default(), &secret_ref.name);
    let secret = cluster
        .get(&id)
        .await
        .map_err(|e| PostBuildError::Decryption(format!("reading decryption secret {}: {}", id, e)))?
        .ok_or_else(|| PostBuildError::Decryption(format!("decryption secret {} not found", id)))?;
    let pairs = object_pairs(&secret, SubstituteKind::Secret)
        .map_err(|e| PostBuildError::Decryption(format!("decryption secret {}: {}", id, e)))?;
    pairs
        .iter()
        .filter(|(k, _)| k.ends_with(DATA_KEY_SUFFIX))
        .map(|(_, v)| DataKey::from_bytes(v.as_bytes()))
        .collect()
}

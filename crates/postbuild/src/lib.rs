//! converge post-build pipeline.
//!
//! Rendered manifest bytes go through two fixed steps: sops decryption, then
//! `${VAR}` substitution. The output is manifest bytes again; nothing here talks to
//! the cluster except to read key material and substitution sources.

#![forbid(unsafe_code)]

pub mod sops;
pub mod subst;
pub mod vars;

use converge_core::types::{DISABLED_VALUE, SUBSTITUTE_ANNOTATION};
use converge_core::{Cluster, Kustomization, Reason};
use serde_yaml::Value;
use tracing::debug;

pub use sops::DataKey;
pub use subst::Vars;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PostBuildError {
    #[error("decryption failed: {0}")]
    Decryption(String),
    #[error("variable substitution failed: {0}")]
    Substitution(String),
    #[error("invalid manifest: {0}")]
    Parse(String),
}

impl PostBuildError {
    /// Condition reason reported for this failure.
    pub fn reason(&self) -> Reason {
        match self {
            PostBuildError::Decryption(_) => Reason::DecryptionFailed,
            PostBuildError::Substitution(_) => Reason::SubstitutionFailed,
            PostBuildError::Parse(_) => Reason::BuildFailed,
        }
    }
}

/// One YAML document: its original text and the parsed value.
struct Document {
    text: String,
    value: Value,
}

fn split_documents(manifests: &[u8]) -> Result<Vec<Document>, PostBuildError> {
    let text = std::str::from_utf8(manifests).map_err(|e| PostBuildError::Parse(e.to_string()))?;
    let mut chunks: Vec<String> = vec![String::new()];
    for line in text.lines() {
        if line.trim_end() == "---" || line.starts_with("--- ") {
            chunks.push(String::new());
            continue;
        }
        if let Some(cur) = chunks.last_mut() {
            cur.push_str(line);
            cur.push('\n');
        }
    }
    let mut docs = Vec::new();
    for chunk in chunks {
        let value: Value = serde_yaml::from_str(&chunk).map_err(|e| PostBuildError::Parse(e.to_string()))?;
        if !value.is_null() {
            docs.push(Document { text: chunk, value });
        }
    }
    Ok(docs)
}

fn join_documents(docs: &[Document]) -> Vec<u8> {
    docs.iter().map(|d| d.text.as_str()).collect::<Vec<_>>().join("---\n").into_bytes()
}

fn substitution_disabled(doc: &Value) -> bool {
    doc.get("metadata")
        .and_then(|m| m.get("annotations"))
        .and_then(|a| a.get(SUBSTITUTE_ANNOTATION))
        .and_then(|v| v.as_str())
        == Some(DISABLED_VALUE)
}

/// Inputs for [`process`] once collaborator data has been resolved.
#[derive(Debug, Default)]
pub struct Options<'a> {
    /// `None` skips decryption.
    pub keys: Option<&'a [DataKey]>,
    /// `None` skips substitution.
    pub vars: Option<&'a Vars>,
    pub strict: bool,
}

/// Decrypt, then substitute. Pure: no cluster access.
pub fn process(manifests: &[u8], opts: &Options<'_>) -> Result<Vec<u8>, PostBuildError> {
    let mut docs = split_documents(manifests)?;
    if let Some(keys) = opts.keys {
        for doc in docs.iter_mut() {
            if sops::decrypt_document(&mut doc.value, keys)? {
                doc.text = serde_yaml::to_string(&doc.value).map_err(|e| PostBuildError::Parse(e.to_string()))?;
            }
        }
    }
    if let Some(vars) = opts.vars {
        subst::validate_names(vars)?;
        for doc in docs.iter_mut() {
            if substitution_disabled(&doc.value) {
                continue;
            }
            let text = subst::substitute(&doc.text, vars, opts.strict)?;
            if text != doc.text {
                doc.value = serde_yaml::from_str(&text)
                    .map_err(|e| PostBuildError::Substitution(format!("result is not valid YAML: {}", e)))?;
                doc.text = text;
            }
        }
    }
    Ok(join_documents(&docs))
}

/// Run the pipeline for `unit`, resolving data keys and variables through `cluster`.
pub async fn run(cluster: &dyn Cluster, unit: &Kustomization, manifests: &[u8], strict: bool) -> Result<Vec<u8>, PostBuildError> {
    let keys = match unit.spec.decryption {
        Some(_) => Some(vars::load_data_keys(cluster, unit).await?),
        None => None,
    };
    let collected = match unit.spec.post_build.as_ref() {
        Some(pb) => Some(vars::collect_vars(cluster, unit, pb).await?),
        None => None,
    };
    debug!(
        unit = %unit.key(),
        data_keys = keys.as_ref().map(|k| k.len()).unwrap_or(0),
        vars = collected.as_ref().map(|v| v.len()).unwrap_or(0),
        "post-build"
    );
    process(manifests, &Options { keys: keys.as_deref(), vars: collected.as_ref(), strict })
}

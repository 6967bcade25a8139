//! `kustomize build` behind [`OverlayRenderer`]: a generated wrapper overlay
//! carries the unit's namespace, patches and images on top of the build path.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::collaborators::{OverlayRenderer, RenderRequest};

const KUSTOMIZATION_FILES: [&str; 3] = ["kustomization.yaml", "kustomization.yml", "Kustomization"];

pub struct KustomizeCommand {
    bin: PathBuf,
}

impl KustomizeCommand {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }
}

fn has_kustomization(dir: &Path) -> bool {
    KUSTOMIZATION_FILES.iter().any(|f| dir.join(f).is_file())
}

/// Plain manifest directories are wrapped file by file.
fn resources_of(dir: &Path) -> Result<Vec<String>> {
    if has_kustomization(dir) {
        return Ok(vec![dir.to_string_lossy().into_owned()]);
    }
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("reading {}", dir.display()))? {
        let path = entry?.path();
        let is_yaml = matches!(path.extension().and_then(|e| e.to_str()), Some("yaml" | "yml"));
        if path.is_file() && is_yaml {
            files.push(path.to_string_lossy().into_owned());
        }
    }
    files.sort();
    Ok(files)
}

/// The generated `kustomization.yaml` for a request.
pub fn wrapper_overlay(req: &RenderRequest, resources: Vec<String>) -> Result<String> {
    let mut k = Map::new();
    k.insert("apiVersion".into(), json!("kustomize.config.k8s.io/v1beta1"));
    k.insert("kind".into(), json!("Kustomization"));
    k.insert("resources".into(), json!(resources));
    if let Some(ns) = &req.target_namespace {
        k.insert("namespace".into(), json!(ns));
    }
    if !req.patches.is_empty() {
        k.insert("patches".into(), serde_json::to_value(&req.patches)?);
    }
    if !req.images.is_empty() {
        k.insert("images".into(), serde_json::to_value(&req.images)?);
    }
    Ok(serde_yaml::to_string(&Value::Object(k))?)
}

#[async_trait]
impl OverlayRenderer for KustomizeCommand {
    async fn render(&self, req: &RenderRequest) -> Result<Vec<u8>> {
        if !req.dir.is_dir() {
            bail!("build path {} not found", req.dir.display());
        }
        let work = tempfile::tempdir().context("creating overlay dir")?;
        let overlay = wrapper_overlay(req, resources_of(&req.dir)?)?;
        tokio::fs::write(work.path().join("kustomization.yaml"), overlay)
            .await
            .context("writing overlay")?;
        debug!(dir = %req.dir.display(), "running kustomize build");
        let out = tokio::process::Command::new(&self.bin)
            .arg("build")
            .arg("--load-restrictor")
            .arg("LoadRestrictionsNone")
            .arg(work.path())
            .output()
            .await
            .with_context(|| format!("running {}", self.bin.display()))?;
        if !out.status.success() {
            bail!("kustomize build failed: {}", String::from_utf8_lossy(&out.stderr).trim());
        }
        Ok(out.stdout)
    }
}

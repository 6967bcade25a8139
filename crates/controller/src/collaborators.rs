//! Capabilities the reconciler consumes but does not implement.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use converge_core::types::{Image, Patch, SourceReference};
use converge_core::{Cluster, Kustomization, KustomizationStatus, UnitKey};

/// A fetched source: a local directory and the revision it holds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub path: PathBuf,
    pub revision: String,
}

#[async_trait]
pub trait SourceProvider: Send + Sync {
    /// `namespace` is the default for a reference without one.
    async fn fetch(&self, source: &SourceReference, namespace: &str) -> Result<Artifact>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderRequest {
    pub dir: PathBuf,
    pub patches: Vec<Patch>,
    pub images: Vec<Image>,
    pub target_namespace: Option<String>,
}

impl RenderRequest {
    pub fn for_unit(unit: &Kustomization, artifact: &Artifact) -> Result<Self> {
        Ok(Self {
            dir: join_within(&artifact.path, unit.spec.path.as_deref().unwrap_or(""))?,
            patches: unit.spec.patches.clone(),
            images: unit.spec.images.clone(),
            target_namespace: unit.spec.target_namespace.clone(),
        })
    }
}

/// Join `rel` onto `root` without letting it climb out. Leading `/` and `./` are ignored.
pub fn join_within(root: &Path, rel: &str) -> Result<PathBuf> {
    let mut out = root.to_path_buf();
    for c in Path::new(rel).components() {
        match c {
            Component::Normal(part) => out.push(part),
            Component::ParentDir => bail!("path {:?} escapes the artifact root", rel),
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    Ok(out)
}

#[async_trait]
pub trait OverlayRenderer: Send + Sync {
    async fn render(&self, req: &RenderRequest) -> Result<Vec<u8>>;
}

/// Turns a unit's service account or kubeconfig reference into a bound cluster handle.
#[async_trait]
pub trait CredentialResolver: Send + Sync {
    async fn resolve(&self, unit: &Kustomization) -> Result<Arc<dyn Cluster>>;
}

/// The only surfaces of a unit the engine writes.
#[async_trait]
pub trait StatusWriter: Send + Sync {
    async fn patch_status(&self, key: &UnitKey, status: &KustomizationStatus) -> Result<()>;
    async fn set_finalizer(&self, key: &UnitKey, present: bool) -> Result<()>;
}

//! Artifacts published by a source controller in `status.artifact` and
//! unpacked under a shared storage root.

use std::path::PathBuf;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use converge_controller::collaborators::join_within;
use converge_controller::{Artifact, SourceProvider};
use converge_core::types::SourceReference;
use converge_core::{Cluster, Json, ObjectRef};
use converge_schema::value_at;

use crate::cluster::KubeCluster;

pub const DEFAULT_SOURCE_API_VERSION: &str = "source.toolkit.fluxcd.io/v1";

pub struct ArtifactSource {
    cluster: KubeCluster,
    storage_root: PathBuf,
}

impl ArtifactSource {
    pub fn new(cluster: KubeCluster, storage_root: impl Into<PathBuf>) -> Self {
        Self { cluster, storage_root: storage_root.into() }
    }
}

pub fn source_object_ref(source: &SourceReference, namespace: &str) -> ObjectRef {
    ObjectRef::new(
        source.api_version.as_deref().unwrap_or(DEFAULT_SOURCE_API_VERSION),
        &source.kind,
        source.namespace.as_deref().unwrap_or(namespace),
        &source.name,
    )
}

/// `(revision, path)` of the artifact a source object advertises.
pub fn advertised_artifact(obj: &Json) -> Option<(String, String)> {
    let revision = value_at(obj, "status.artifact.revision")?.as_str()?;
    let path = value_at(obj, "status.artifact.path")?.as_str()?;
    Some((revision.to_string(), path.to_string()))
}

#[async_trait]
impl SourceProvider for ArtifactSource {
    async fn fetch(&self, source: &SourceReference, namespace: &str) -> Result<Artifact> {
        let id = source_object_ref(source, namespace);
        let obj = self.cluster.get(&id).await?.ok_or_else(|| anyhow!("source {} not found", id))?;
        let (revision, path) = advertised_artifact(&obj).ok_or_else(|| anyhow!("source {} has no artifact yet", id))?;
        let dir = join_within(&self.storage_root, &path)?;
        if !dir.is_dir() {
            return Err(anyhow!("artifact for {} is not available at {}", id, dir.display()));
        }
        Ok(Artifact { path: dir, revision })
    }
}

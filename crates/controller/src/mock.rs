//! In-memory collaborators for tests and offline runs.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use converge_core::types::SourceReference;
use converge_core::{Cluster, Kustomization, KustomizationStatus, UnitKey};

use crate::collaborators::{Artifact, CredentialResolver, OverlayRenderer, RenderRequest, SourceProvider, StatusWriter};

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(g) => g,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Serves artifacts keyed by source name.
#[derive(Default)]
pub struct MockSource {
    artifacts: Mutex<BTreeMap<String, Artifact>>,
}

impl MockSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, source: &str, path: &str, revision: &str) {
        locked(&self.artifacts)
            .insert(source.to_string(), Artifact { path: path.into(), revision: revision.to_string() });
    }
}

#[async_trait]
impl SourceProvider for MockSource {
    async fn fetch(&self, source: &SourceReference, _namespace: &str) -> Result<Artifact> {
        locked(&self.artifacts)
            .get(&source.name)
            .cloned()
            .ok_or_else(|| anyhow!("{} '{}' has no artifact", source.kind, source.name))
    }
}

/// Returns fixed manifests per build directory and counts renders.
#[derive(Default)]
pub struct MockRenderer {
    outputs: Mutex<BTreeMap<String, Vec<u8>>>,
    requests: Mutex<Vec<RenderRequest>>,
}

impl MockRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, dir: &str, manifests: &str) {
        locked(&self.outputs).insert(dir.to_string(), manifests.as_bytes().to_vec());
    }

    pub fn requests(&self) -> Vec<RenderRequest> {
        locked(&self.requests).clone()
    }
}

#[async_trait]
impl OverlayRenderer for MockRenderer {
    async fn render(&self, req: &RenderRequest) -> Result<Vec<u8>> {
        locked(&self.requests).push(req.clone());
        let dir = req.dir.to_string_lossy().into_owned();
        locked(&self.outputs).get(&dir).cloned().ok_or_else(|| anyhow!("no kustomization found in {}", dir))
    }
}

/// Every unit gets the same cluster handle.
pub struct StaticCredentials(pub Arc<dyn Cluster>);

#[async_trait]
impl CredentialResolver for StaticCredentials {
    async fn resolve(&self, _unit: &Kustomization) -> Result<Arc<dyn Cluster>> {
        Ok(Arc::clone(&self.0))
    }
}

/// Records status patches and finalizer changes.
#[derive(Default)]
pub struct MockStatusWriter {
    patches: Mutex<Vec<(UnitKey, KustomizationStatus)>>,
    finalizers: Mutex<BTreeMap<UnitKey, bool>>,
}

impl MockStatusWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn patches(&self) -> Vec<(UnitKey, KustomizationStatus)> {
        locked(&self.patches).clone()
    }

    pub fn patches_for(&self, key: &UnitKey) -> Vec<KustomizationStatus> {
        locked(&self.patches).iter().filter(|(k, _)| k == key).map(|(_, s)| s.clone()).collect()
    }

    pub fn last_status(&self, key: &UnitKey) -> Option<KustomizationStatus> {
        self.patches_for(key).pop()
    }

    pub fn finalizer(&self, key: &UnitKey) -> Option<bool> {
        locked(&self.finalizers).get(key).copied()
    }
}

#[async_trait]
impl StatusWriter for MockStatusWriter {
    async fn patch_status(&self, key: &UnitKey, status: &KustomizationStatus) -> Result<()> {
        locked(&self.patches).push((key.clone(), status.clone()));
        Ok(())
    }

    async fn set_finalizer(&self, key: &UnitKey, present: bool) -> Result<()> {
        locked(&self.finalizers).insert(key.clone(), present);
        Ok(())
    }
}

//! Status subresource and finalizer writes for units.

use anyhow::{Context, Result};
use async_trait::async_trait;
use converge_controller::StatusWriter;
use converge_core::types::FINALIZER;
use converge_core::{Kustomization, KustomizationStatus, UnitKey};
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::json;

pub struct KubeStatusWriter {
    client: Client,
}

impl KubeStatusWriter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, key: &UnitKey) -> Api<Kustomization> {
        Api::namespaced(self.client.clone(), &key.namespace)
    }
}

/// Finalizer list with ours added or removed, `None` when nothing changes.
pub fn toggle_finalizer(current: &[String], present: bool) -> Option<Vec<String>> {
    let has = current.iter().any(|f| f == FINALIZER);
    match (has, present) {
        (false, true) => {
            let mut next = current.to_vec();
            next.push(FINALIZER.to_string());
            Some(next)
        }
        (true, false) => Some(current.iter().filter(|f| *f != FINALIZER).cloned().collect()),
        _ => None,
    }
}

#[async_trait]
impl StatusWriter for KubeStatusWriter {
    async fn patch_status(&self, key: &UnitKey, status: &KustomizationStatus) -> Result<()> {
        let patch = json!({ "status": status });
        self.api(key)
            .patch_status(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("patching status of {}", key))?;
        Ok(())
    }

    async fn set_finalizer(&self, key: &UnitKey, present: bool) -> Result<()> {
        let api = self.api(key);
        let Some(current) = api.get_opt(&key.name).await.with_context(|| format!("reading {}", key))? else {
            return Ok(());
        };
        let existing = current.metadata.finalizers.unwrap_or_default();
        let Some(next) = toggle_finalizer(&existing, present) else { return Ok(()) };
        let patch = json!({
            "metadata": {
                "finalizers": next,
                "resourceVersion": current.metadata.resource_version,
            }
        });
        api.patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .with_context(|| format!("updating finalizers of {}", key))?;
        Ok(())
    }
}

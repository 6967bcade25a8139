//! Fill the type registry from the API server's discovery documents.

use anyhow::{Context, Result};
use converge_schema::{TypeInfo, TypeRegistry};
use kube::discovery::{Discovery, Scope};
use kube::Client;
use tracing::info;

/// Register every served resource kind at its recommended version. Returns the
/// number of kinds registered.
pub async fn discover_into(client: Client, registry: &TypeRegistry) -> Result<usize> {
    let discovery = Discovery::new(client).run().await.context("running API discovery")?;
    let mut count = 0;
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            registry.register(TypeInfo {
                group: ar.group.clone(),
                version: ar.version.clone(),
                kind: ar.kind.clone(),
                plural: ar.plural.clone(),
                namespaced: matches!(caps.scope, Scope::Namespaced),
            });
            count += 1;
        }
    }
    info!(kinds = count, "discovery complete");
    Ok(count)
}

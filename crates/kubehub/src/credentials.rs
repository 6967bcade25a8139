//! Per-unit cluster handles: a kubeconfig secret wins over service-account
//! impersonation, which wins over the controller's own identity.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use converge_controller::CredentialResolver;
use converge_core::{Cluster, Kustomization};
use converge_schema::TypeRegistry;
use k8s_openapi::api::core::v1::Secret;
use kube::api::Api;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tracing::debug;

use crate::cluster::KubeCluster;

/// Secret keys tried, in order, for a kubeconfig.
pub const KUBECONFIG_KEYS: [&str; 2] = ["value", "value.yaml"];

pub fn service_account_user(namespace: &str, name: &str) -> String {
    format!("system:serviceaccount:{}:{}", namespace, name)
}

pub struct KubeCredentials {
    client: Client,
    base: Config,
    registry: Arc<TypeRegistry>,
    field_manager: String,
}

impl KubeCredentials {
    pub fn new(client: Client, base: Config, registry: Arc<TypeRegistry>, field_manager: impl Into<String>) -> Self {
        Self { client, base, registry, field_manager: field_manager.into() }
    }

    fn bind(&self, client: Client) -> Arc<dyn Cluster> {
        Arc::new(KubeCluster::new(client, Arc::clone(&self.registry), self.field_manager.clone()))
    }

    async fn client_from_secret(&self, namespace: &str, secret: &str) -> Result<Client> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let s = api.get(secret).await.with_context(|| format!("reading kubeconfig secret {}/{}", namespace, secret))?;
        let data = s.data.unwrap_or_default();
        let raw = KUBECONFIG_KEYS
            .iter()
            .find_map(|k| data.get(*k))
            .ok_or_else(|| anyhow!("secret {}/{} has no 'value' or 'value.yaml' key", namespace, secret))?;
        let text = std::str::from_utf8(&raw.0).context("kubeconfig is not UTF-8")?;
        let kubeconfig = Kubeconfig::from_yaml(text).context("parsing kubeconfig")?;
        let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .context("loading kubeconfig")?;
        Client::try_from(config).context("building remote client")
    }
}

#[async_trait]
impl CredentialResolver for KubeCredentials {
    async fn resolve(&self, unit: &Kustomization) -> Result<Arc<dyn Cluster>> {
        let ns = unit.namespace_or_default();
        if let Some(kc) = &unit.spec.kube_config {
            debug!(unit = %unit.key(), secret = %kc.secret_ref.name, "using kubeconfig secret");
            let client = self.client_from_secret(&ns, &kc.secret_ref.name).await?;
            return Ok(self.bind(client));
        }
        if let Some(sa) = &unit.spec.service_account_name {
            let mut config = self.base.clone();
            config.auth_info.impersonate = Some(service_account_user(&ns, sa));
            let client = Client::try_from(config).context("building impersonating client")?;
            return Ok(self.bind(client));
        }
        Ok(self.bind(self.client.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn impersonated_user_names_the_service_account() {
        assert_eq!(service_account_user("apps", "deployer"), "system:serviceaccount:apps:deployer");
    }
}

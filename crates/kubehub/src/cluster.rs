//! [`Cluster`] over the Kubernetes API: server-side apply with a fixed field
//! manager, dynamic objects resolved through the type registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use converge_core::cluster::GroupVersionKind;
use converge_core::{Cluster, ClusterError, Json, ObjectRef};
use converge_schema::{TypeInfo, TypeRegistry};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::core::{ApiResource, DynamicObject};
use kube::Client;
use metrics::counter;

pub fn api_resource(info: &TypeInfo) -> ApiResource {
    ApiResource {
        group: info.group.clone(),
        version: info.version.clone(),
        api_version: info.api_version(),
        kind: info.kind.clone(),
        plural: info.plural.clone(),
    }
}

/// Map API failures onto the capability's error vocabulary.
pub fn map_error(err: kube::Error) -> ClusterError {
    let mapped = match err {
        kube::Error::Api(resp) => match resp.code {
            404 => ClusterError::NotFound(resp.message),
            409 => ClusterError::Conflict(resp.message),
            403 => ClusterError::Forbidden(resp.message),
            422 if resp.message.contains("immutable") => ClusterError::Immutable(resp.message),
            408 | 504 => ClusterError::Timeout(resp.message),
            _ => ClusterError::Other(format!("{} ({}): {}", resp.reason, resp.code, resp.message)),
        },
        other => ClusterError::Other(other.to_string()),
    };
    let kind = match &mapped {
        ClusterError::NotFound(_) => "not_found",
        ClusterError::Immutable(_) => "immutable",
        ClusterError::Conflict(_) => "conflict",
        ClusterError::Forbidden(_) => "forbidden",
        ClusterError::Timeout(_) => "timeout",
        ClusterError::Other(_) => "other",
    };
    counter!("cluster_errors_total", 1u64, "kind" => kind);
    mapped
}

fn to_json(obj: DynamicObject) -> Result<Json, ClusterError> {
    serde_json::to_value(obj).map_err(|e| ClusterError::Other(format!("serializing object: {}", e)))
}

pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels.iter().map(|(k, v)| format!("{}={}", k, v)).collect::<Vec<_>>().join(",")
}

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    registry: Arc<TypeRegistry>,
    field_manager: String,
}

impl KubeCluster {
    pub fn new(client: Client, registry: Arc<TypeRegistry>, field_manager: impl Into<String>) -> Self {
        Self { client, registry, field_manager: field_manager.into() }
    }

    fn resource(&self, group: &str, kind: &str) -> Result<(ApiResource, bool), ClusterError> {
        self.registry
            .lookup(group, kind)
            .map(|info| (api_resource(&info), info.namespaced))
            .ok_or_else(|| ClusterError::Other(format!("no API resource known for kind {} in group '{}'", kind, group)))
    }

    fn api_for(&self, id: &ObjectRef) -> Result<Api<DynamicObject>, ClusterError> {
        let (ar, namespaced) = self.resource(&id.group, &id.kind)?;
        Ok(if namespaced && !id.namespace.is_empty() {
            Api::namespaced_with(self.client.clone(), &id.namespace, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        })
    }
}

#[async_trait]
impl Cluster for KubeCluster {
    async fn get(&self, id: &ObjectRef) -> Result<Option<Json>, ClusterError> {
        let api = self.api_for(id)?;
        match api.get_opt(&id.name).await.map_err(map_error)? {
            Some(obj) => Ok(Some(to_json(obj)?)),
            None => Ok(None),
        }
    }

    async fn apply(&self, object: &Json) -> Result<Json, ClusterError> {
        let id = ObjectRef::from_object(object)
            .ok_or_else(|| ClusterError::Other("object missing apiVersion, kind or metadata.name".into()))?;
        let api = self.api_for(&id)?;
        let params = PatchParams::apply(&self.field_manager).force();
        let applied = api.patch(&id.name, &params, &Patch::Apply(object)).await.map_err(map_error)?;
        to_json(applied)
    }

    async fn delete(&self, id: &ObjectRef) -> Result<(), ClusterError> {
        let api = self.api_for(id)?;
        api.delete(&id.name, &DeleteParams::background()).await.map_err(map_error)?;
        Ok(())
    }

    async fn list_by_label(
        &self,
        gvk: &GroupVersionKind,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<Json>, ClusterError> {
        let (ar, _) = self.resource(&gvk.group, &gvk.kind)?;
        let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);
        let list = api
            .list(&ListParams::default().labels(&label_selector(labels)))
            .await
            .map_err(map_error)?;
        let mut out = Vec::with_capacity(list.items.len());
        for mut obj in list.items {
            // List items carry no type meta.
            obj.types = Some(kube::core::TypeMeta { api_version: ar.api_version.clone(), kind: ar.kind.clone() });
            out.push(to_json(obj)?);
        }
        Ok(out)
    }
}

//! The `Kustomization` unit: spec (user-owned) and status (engine-owned).

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use kube::CustomResource;
use serde::{Deserialize, Serialize};

use crate::conditions::{ConditionType, Conditions};
use crate::inventory::Inventory;

pub const KUSTOMIZATION_KIND: &str = "Kustomization";
pub const GROUP: &str = "kustomize.converge.dev";
pub const FINALIZER: &str = "finalizers.converge.dev";
pub const MAX_CONDITION_MESSAGE_LENGTH: usize = 20_000;
pub const DISABLED_VALUE: &str = "disabled";

/// Ownership labels stamped on every applied object.
pub const NAME_LABEL: &str = "kustomize.converge.dev/name";
pub const NAMESPACE_LABEL: &str = "kustomize.converge.dev/namespace";
/// Per-object opt-outs (value [`DISABLED_VALUE`]).
pub const PRUNE_ANNOTATION: &str = "kustomize.converge.dev/prune";
pub const SUBSTITUTE_ANNOTATION: &str = "kustomize.converge.dev/substitute";
/// Digest of the object as last applied by its unit.
pub const CHECKSUM_ANNOTATION: &str = "kustomize.converge.dev/checksum";
/// Changing this annotation requests an immediate reconciliation.
pub const RECONCILE_REQUEST_ANNOTATION: &str = "reconcile.converge.dev/requestedAt";

const MIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, Default, PartialEq)]
#[kube(
    group = "kustomize.converge.dev",
    version = "v1beta2",
    kind = "Kustomization",
    namespaced,
    status = "KustomizationStatus",
    shortname = "ks",
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct KustomizationSpec {
    /// Units that must be Ready before this one is built.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<DependencyReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub decryption: Option<Decryption>,

    #[serde(with = "crate::duration")]
    pub interval: Duration,

    /// Cadence after a failed attempt; falls back to `interval`.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "crate::duration::option")]
    pub retry_interval: Option<Duration>,

    /// Remote cluster credentials; take precedence over `service_account_name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_config: Option<KubeConfigReference>,

    /// Build path inside the source artifact. Defaults to the artifact root.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub post_build: Option<PostBuild>,

    pub prune: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub health_checks: Vec<NamespacedObjectKindReference>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub patches: Vec<Patch>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<Image>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,

    pub source_ref: SourceReference,

    #[serde(default)]
    pub suspend: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_namespace: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none", with = "crate::duration::option")]
    pub timeout: Option<Duration>,

    /// Recreate objects whose update fails on an immutable field.
    #[serde(default)]
    pub force: bool,

    /// Assess health of every applied object; overrides `health_checks`.
    #[serde(default)]
    pub wait: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DependencyReference {
    /// Defaults to the namespace of the dependent unit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SourceReference {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LocalObjectReference {
    pub name: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Decryption {
    /// Only `sops` is understood.
    pub provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<LocalObjectReference>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct KubeConfigReference {
    /// Secret holding a kubeconfig under the `value` or `value.yaml` key.
    pub secret_ref: LocalObjectReference,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PostBuild {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub substitute: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub substitute_from: Vec<SubstituteReference>,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubstituteKind {
    Secret,
    ConfigMap,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SubstituteReference {
    pub kind: SubstituteKind,
    pub name: String,
    /// Tolerate a missing referent.
    #[serde(default)]
    pub optional: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NamespacedObjectKindReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Patch {
    /// Strategic merge or JSON6902 patch, inline YAML.
    pub patch: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<PatchSelector>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PatchSelector {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotation_selector: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Image {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KustomizationStatus {
    /// `-1` until the first attempt completes.
    #[serde(default = "default_observed_generation")]
    pub observed_generation: i64,
    #[serde(default, skip_serializing_if = "Conditions::is_empty")]
    pub conditions: Conditions,
    /// Updated only on full success.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_applied_revision: String,
    /// Updated on every attempt.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub last_attempted_revision: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory: Option<Inventory>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_handled_reconcile_at: Option<String>,
}

fn default_observed_generation() -> i64 {
    -1
}

impl Default for KustomizationStatus {
    fn default() -> Self {
        Self {
            observed_generation: default_observed_generation(),
            conditions: Conditions::default(),
            last_applied_revision: String::new(),
            last_attempted_revision: String::new(),
            inventory: None,
            last_handled_reconcile_at: None,
        }
    }
}

/// `namespace/name` of a unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitKey {
    pub namespace: String,
    pub name: String,
}

impl UnitKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl Kustomization {
    pub fn key(&self) -> UnitKey {
        UnitKey::new(self.namespace_or_default(), self.metadata.name.clone().unwrap_or_default())
    }

    pub fn namespace_or_default(&self) -> String {
        self.metadata.namespace.clone().unwrap_or_else(|| "default".to_string())
    }

    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    /// Per-attempt budget: explicit timeout or `interval - 30s`, never below 30s.
    pub fn get_timeout(&self) -> Duration {
        let d = self
            .spec
            .timeout
            .unwrap_or_else(|| self.spec.interval.saturating_sub(MIN_TIMEOUT));
        d.max(MIN_TIMEOUT)
    }

    pub fn get_retry_interval(&self) -> Duration {
        self.spec.retry_interval.unwrap_or(self.spec.interval)
    }

    /// Whether the Healthy condition is tracked for this unit.
    pub fn requires_health(&self) -> bool {
        self.spec.wait || !self.spec.health_checks.is_empty()
    }

    /// Declared dependencies in declaration order, namespaces defaulted.
    pub fn depends_on(&self) -> Vec<UnitKey> {
        let ns = self.namespace_or_default();
        self.spec
            .depends_on
            .iter()
            .map(|d| UnitKey::new(d.namespace.clone().unwrap_or_else(|| ns.clone()), d.name.clone()))
            .collect()
    }

    pub fn status_or_default(&self) -> KustomizationStatus {
        self.status.clone().unwrap_or_default()
    }

    pub fn condition(&self, t: ConditionType) -> Option<&crate::conditions::Condition> {
        self.status.as_ref().and_then(|s| s.conditions.get(t))
    }

    pub fn is_ready(&self) -> bool {
        self.condition(ConditionType::Ready).map(|c| c.is_true()).unwrap_or(false)
    }

    pub fn is_being_deleted(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn has_finalizer(&self) -> bool {
        self.metadata
            .finalizers
            .as_ref()
            .map(|f| f.iter().any(|x| x == FINALIZER))
            .unwrap_or(false)
    }

    /// Value of the reconcile-request annotation, when set.
    pub fn reconcile_request(&self) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(RECONCILE_REQUEST_ANNOTATION))
            .map(|s| s.as_str())
    }

    /// A reconcile request that has not been recorded in status yet.
    pub fn pending_reconcile_request(&self) -> Option<&str> {
        let req = self.reconcile_request()?;
        let handled = self.status.as_ref().and_then(|s| s.last_handled_reconcile_at.as_deref());
        (handled != Some(req)).then_some(req)
    }

    /// Ownership labels stamped on applied objects.
    pub fn owner_labels(&self) -> BTreeMap<String, String> {
        let key = self.key();
        BTreeMap::from([
            (NAME_LABEL.to_string(), key.name),
            (NAMESPACE_LABEL.to_string(), key.namespace),
        ])
    }
}

//! Apply the rendered object set, then garbage-collect what the previous inventory
//! holds and the render no longer does.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::future::Future;

use converge_core::cluster::{annotation, has_labels, GroupVersionKind};
use converge_core::types::{CHECKSUM_ANNOTATION, DISABLED_VALUE, PRUNE_ANNOTATION};
use converge_core::{Cluster, ClusterError, Inventory, InventoryError, Json, ObjectKey, ObjectRef, Reason};
use converge_schema::{is_crd, TypeRegistry};
use metrics::counter;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::diff::{applied_checksum, diff_summary, strip_noisy};
use crate::manifest::{parse_manifests, ManifestError, ManifestLimits};
use crate::order::sort_for_apply;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Created,
    Configured,
    Unchanged,
    Recreated,
}

impl Change {
    pub fn as_str(&self) -> &'static str {
        match self {
            Change::Created => "created",
            Change::Configured => "configured",
            Change::Unchanged => "unchanged",
            Change::Recreated => "recreated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ApplyError {
    #[error(transparent)]
    Manifest(#[from] ManifestError),
    #[error("previous inventory is unusable: {0}")]
    Inventory(#[from] InventoryError),
    #[error("timed out after {applied} of {total} objects were applied")]
    Timeout { applied: usize, total: usize },
}

impl ApplyError {
    pub fn reason(&self) -> Reason {
        match self {
            ApplyError::Manifest(_) => Reason::BuildFailed,
            ApplyError::Inventory(_) | ApplyError::Timeout { .. } => Reason::ApplyFailed,
        }
    }
}

/// Per-attempt inputs.
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub prune: bool,
    pub force: bool,
    /// Namespace given to namespaced objects that declare none.
    pub default_namespace: String,
    /// Stamped on every applied object; prune only touches objects carrying them.
    pub owner_labels: BTreeMap<String, String>,
    pub deadline: Instant,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ApplyReport {
    /// Successfully applied objects, in apply order.
    pub inventory: Inventory,
    pub changes: Vec<(ObjectRef, Change)>,
    pub apply_errors: Vec<(ObjectRef, String)>,
    pub pruned: Vec<ObjectRef>,
    pub prune_errors: Vec<(ObjectRef, String)>,
}

impl ApplyReport {
    /// The applied objects, for health assessment.
    pub fn applied(&self) -> Vec<ObjectRef> {
        self.changes.iter().map(|(id, _)| id.clone()).collect()
    }

    /// `Err` carries the failure reason and a message listing the failed objects.
    pub fn outcome(&self) -> Result<(), (Reason, String)> {
        let list = |errs: &[(ObjectRef, String)]| {
            errs.iter().map(|(id, e)| format!("{}: {}", id, e)).collect::<Vec<_>>().join("; ")
        };
        if !self.apply_errors.is_empty() {
            return Err((Reason::ApplyFailed, format!("apply failed for {} object(s): {}", self.apply_errors.len(), list(&self.apply_errors))));
        }
        if !self.prune_errors.is_empty() {
            return Err((Reason::PruneFailed, format!("prune failed for {} object(s): {}", self.prune_errors.len(), list(&self.prune_errors))));
        }
        Ok(())
    }

    /// Whether anything was written or deleted.
    pub fn mutated(&self) -> bool {
        !self.pruned.is_empty() || self.changes.iter().any(|(_, c)| *c != Change::Unchanged)
    }
}

pub struct ApplyEngine<'a> {
    cluster: &'a dyn Cluster,
    registry: &'a TypeRegistry,
    limits: ManifestLimits,
}

async fn within<T>(deadline: Instant, fut: impl Future<Output = Result<T, ClusterError>>) -> Result<T, ClusterError> {
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(res) => res,
        Err(_) => Err(ClusterError::Timeout("deadline exceeded".into())),
    }
}

enum Prune {
    Deleted,
    Skipped(&'static str),
}

impl<'a> ApplyEngine<'a> {
    pub fn new(cluster: &'a dyn Cluster, registry: &'a TypeRegistry) -> Self {
        Self { cluster, registry, limits: ManifestLimits::default() }
    }

    pub fn with_limits(mut self, limits: ManifestLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Apply `manifests` best-effort across objects, then prune what `previous`
    /// holds and the render does not. `previous = None` with `prune` falls back to
    /// listing objects by ownership label.
    pub async fn run(
        &self,
        manifests: &[u8],
        previous: Option<&Inventory>,
        opts: &ApplyOptions,
    ) -> Result<ApplyReport, ApplyError> {
        let mut objects = parse_manifests(manifests, &self.limits)?;
        let previous = previous.map(|inv| inv.refs()).transpose()?;
        sort_for_apply(&mut objects);

        let mut report = ApplyReport::default();
        let mut applied: Vec<ObjectRef> = Vec::with_capacity(objects.len());
        let mut rendered: HashSet<ObjectKey> = HashSet::with_capacity(objects.len());
        let total = objects.len();

        for mut obj in objects {
            self.prepare(&mut obj, opts);
            let Some(id) = ObjectRef::from_object(&obj) else { continue };
            rendered.insert(id.object_key());
            if Instant::now() >= opts.deadline {
                return Err(ApplyError::Timeout { applied: applied.len(), total });
            }
            match self.apply_one(&obj, &id, opts).await {
                Ok(change) => {
                    counter!("apply_objects_total", 1u64, "change" => change.as_str());
                    debug!(object = %id, change = change.as_str(), "applied");
                    if is_crd(&obj) {
                        if let Err(e) = self.registry.register_crd(&obj) {
                            warn!(object = %id, error = %e, "applied CRD could not be registered");
                        }
                    }
                    report.changes.push((id.clone(), change));
                    applied.push(id);
                }
                Err(ClusterError::Timeout(_)) => {
                    return Err(ApplyError::Timeout { applied: applied.len(), total });
                }
                Err(e) => {
                    counter!("apply_errors_total", 1u64);
                    warn!(object = %id, error = %e, "apply failed");
                    report.apply_errors.push((id, e.to_string()));
                }
            }
        }
        report.inventory = Inventory::from_refs(&applied);

        if opts.prune {
            let stale = match previous {
                Some(prev) => prev.into_iter().filter(|r| !rendered.contains(&r.object_key())).collect(),
                None => self.stale_by_label(&applied, &rendered, opts).await,
            };
            self.prune(stale, opts, &mut report).await;
            if !report.prune_errors.is_empty() {
                // Objects that could not be deleted stay owned so the next pass retries them.
                let kept = applied.iter().chain(report.prune_errors.iter().map(|(id, _)| id));
                report.inventory = Inventory::from_refs(kept);
            }
        }
        Ok(report)
    }

    /// Prune-only pass over a whole inventory, used when a unit is deleted.
    pub async fn teardown(&self, inventory: &Inventory, opts: &ApplyOptions) -> Result<ApplyReport, ApplyError> {
        let mut report = ApplyReport::default();
        self.prune(inventory.refs()?, opts, &mut report).await;
        Ok(report)
    }

    fn prepare(&self, obj: &mut Json, opts: &ApplyOptions) {
        let (group, kind) = match ObjectRef::from_object(obj) {
            Some(id) => (id.group, id.kind),
            None => return,
        };
        let namespaced = self.registry.is_namespaced(&group, &kind);
        let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) else { return };
        let has_ns = meta.get("namespace").and_then(|n| n.as_str()).map(|n| !n.is_empty()).unwrap_or(false);
        match namespaced {
            Some(false) => {
                meta.remove("namespace");
            }
            Some(true) if !has_ns => {
                meta.insert("namespace".into(), Json::String(opts.default_namespace.clone()));
            }
            _ => {}
        }
        let labels = meta.entry("labels").or_insert_with(|| Json::Object(Default::default()));
        if let Some(labels) = labels.as_object_mut() {
            for (k, v) in &opts.owner_labels {
                labels.insert(k.clone(), Json::String(v.clone()));
            }
        }
        let checksum = applied_checksum(obj);
        if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            let annotations = meta.entry("annotations").or_insert_with(|| Json::Object(Default::default()));
            if let Some(annotations) = annotations.as_object_mut() {
                annotations.insert(CHECKSUM_ANNOTATION.into(), Json::String(checksum));
            }
        }
    }

    async fn apply_one(&self, obj: &Json, id: &ObjectRef, opts: &ApplyOptions) -> Result<Change, ClusterError> {
        let live = within(opts.deadline, self.cluster.get(id)).await?;
        if let Some(live) = &live {
            // A matching checksum means the last apply declared exactly these
            // fields, so nothing needs removing; the diff then catches drift.
            let same_intent = annotation(live, CHECKSUM_ANNOTATION).is_some()
                && annotation(live, CHECKSUM_ANNOTATION) == annotation(obj, CHECKSUM_ANNOTATION);
            let summary = diff_summary(&strip_noisy(obj.clone()), &strip_noisy(live.clone()));
            if same_intent && summary.declared_fields_match() {
                return Ok(Change::Unchanged);
            }
        }
        match within(opts.deadline, self.cluster.apply(obj)).await {
            Ok(_) if live.is_some() => Ok(Change::Configured),
            Ok(_) => Ok(Change::Created),
            Err(ClusterError::Immutable(msg)) if opts.force => {
                info!(object = %id, reason = %msg, "recreating object with immutable field change");
                match within(opts.deadline, self.cluster.delete(id)).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
                within(opts.deadline, self.cluster.apply(obj)).await?;
                Ok(Change::Recreated)
            }
            Err(e) => Err(e),
        }
    }

    /// Owned objects of the rendered kinds that the render no longer contains.
    async fn stale_by_label(&self, applied: &[ObjectRef], rendered: &HashSet<ObjectKey>, opts: &ApplyOptions) -> Vec<ObjectRef> {
        let kinds: BTreeSet<(String, String, String)> =
            applied.iter().map(|r| (r.group.clone(), r.version.clone(), r.kind.clone())).collect();
        let mut stale = Vec::new();
        for (group, version, kind) in kinds {
            let gvk = GroupVersionKind { group, version, kind };
            match within(opts.deadline, self.cluster.list_by_label(&gvk, &opts.owner_labels)).await {
                Ok(items) => stale.extend(
                    items
                        .iter()
                        .filter_map(ObjectRef::from_object)
                        .filter(|r| !rendered.contains(&r.object_key())),
                ),
                Err(e) => warn!(kind = %gvk.kind, error = %e, "listing owned objects failed"),
            }
        }
        stale.sort();
        stale
    }

    /// Delete `stale` in reverse order. Missing objects count as deleted.
    async fn prune(&self, stale: Vec<ObjectRef>, opts: &ApplyOptions, report: &mut ApplyReport) {
        for id in stale.into_iter().rev() {
            match self.prune_one(&id, opts).await {
                Ok(Prune::Deleted) => {
                    counter!("prune_deleted_total", 1u64);
                    info!(object = %id, "pruned");
                    report.pruned.push(id);
                }
                Ok(Prune::Skipped(why)) => debug!(object = %id, why, "prune skipped"),
                Err(e) => {
                    warn!(object = %id, error = %e, "prune failed");
                    report.prune_errors.push((id, e.to_string()));
                }
            }
        }
    }

    async fn prune_one(&self, id: &ObjectRef, opts: &ApplyOptions) -> Result<Prune, ClusterError> {
        let Some(live) = within(opts.deadline, self.cluster.get(id)).await? else {
            return Ok(Prune::Deleted);
        };
        if annotation(&live, PRUNE_ANNOTATION) == Some(DISABLED_VALUE) {
            return Ok(Prune::Skipped("prune disabled by annotation"));
        }
        if !has_labels(&live, &opts.owner_labels) {
            return Ok(Prune::Skipped("owned by another unit"));
        }
        match within(opts.deadline, self.cluster.delete(id)).await {
            Ok(()) => Ok(Prune::Deleted),
            Err(e) if e.is_not_found() => Ok(Prune::Deleted),
            Err(e) => Err(e),
        }
    }
}

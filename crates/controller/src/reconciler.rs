//! One reconciliation attempt for one unit: gate, render, post-build, apply,
//! prune, assess health and publish status.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use converge_apply::{ApplyEngine, ApplyError, ApplyOptions};
use converge_core::conditions::ConditionStatus;
use converge_core::{Cluster, Kustomization, Reason, UnitKey};
use converge_health::{health_targets, HealthAssessor, ReadinessTable};
use converge_postbuild::PostBuildError;
use converge_schema::TypeRegistry;
use converge_store::UnitSnapshot;
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::collaborators::{Artifact, CredentialResolver, OverlayRenderer, RenderRequest, SourceProvider, StatusWriter};
use crate::config::ControllerConfig;
use crate::gate::{check_dependencies, GraphCache};

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("source unavailable: {0}")]
    Source(String),
    #[error("build failed: {0}")]
    Render(String),
    #[error(transparent)]
    PostBuild(#[from] PostBuildError),
    #[error("cannot resolve cluster credentials: {0}")]
    Credentials(String),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error("{phase} timed out")]
    Timeout { phase: &'static str, reason: Reason },
}

impl ReconcileError {
    pub fn reason(&self) -> Reason {
        match self {
            ReconcileError::Source(_) | ReconcileError::Render(_) => Reason::BuildFailed,
            ReconcileError::PostBuild(e) => e.reason(),
            ReconcileError::Credentials(_) => Reason::ApplyFailed,
            ReconcileError::Apply(e) => e.reason(),
            ReconcileError::Timeout { reason, .. } => *reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Ready,
    /// Applied, but the workloads did not become ready in time.
    Unhealthy,
    Failed(Reason),
    DependencyNotReady(UnitKey),
    Suspended,
    /// Another attempt for the same unit is in flight.
    Deferred,
    /// Deletion handled and the finalizer released.
    Finalized,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Ready => "ready",
            Outcome::Unhealthy => "unhealthy",
            Outcome::Failed(_) => "failed",
            Outcome::DependencyNotReady(_) => "dependency_not_ready",
            Outcome::Suspended => "suspended",
            Outcome::Deferred => "deferred",
            Outcome::Finalized => "finalized",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileResult {
    pub outcome: Outcome,
    /// `None` parks the unit until the next external wake.
    pub requeue_after: Option<Duration>,
    /// The unit as it now stands, status included.
    pub updated: Option<Kustomization>,
}

impl ReconcileResult {
    fn new(outcome: Outcome, requeue_after: Option<Duration>, updated: Option<Kustomization>) -> Self {
        Self { outcome, requeue_after, updated }
    }
}

async fn within<T, E>(
    deadline: Instant,
    phase: &'static str,
    reason: Reason,
    fut: impl Future<Output = Result<T, E>>,
    wrap: impl FnOnce(E) -> ReconcileError,
) -> Result<T, ReconcileError> {
    match tokio::time::timeout_at(deadline, fut).await {
        Ok(Ok(v)) => Ok(v),
        Ok(Err(e)) => Err(wrap(e)),
        Err(_) => Err(ReconcileError::Timeout { phase, reason }),
    }
}

pub struct Reconciler {
    config: ControllerConfig,
    /// The control-plane cluster: substitution sources and decryption keys live here.
    local: Arc<dyn Cluster>,
    source: Arc<dyn SourceProvider>,
    renderer: Arc<dyn OverlayRenderer>,
    credentials: Arc<dyn CredentialResolver>,
    status: Arc<dyn StatusWriter>,
    registry: Arc<TypeRegistry>,
    readiness: Arc<ReadinessTable>,
    graph: GraphCache,
    in_flight: Mutex<FxHashMap<UnitKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl Reconciler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ControllerConfig,
        local: Arc<dyn Cluster>,
        source: Arc<dyn SourceProvider>,
        renderer: Arc<dyn OverlayRenderer>,
        credentials: Arc<dyn CredentialResolver>,
        status: Arc<dyn StatusWriter>,
        registry: Arc<TypeRegistry>,
        readiness: Arc<ReadinessTable>,
    ) -> Self {
        Self {
            config,
            local,
            source,
            renderer,
            credentials,
            status,
            registry,
            readiness,
            graph: GraphCache::default(),
            in_flight: Mutex::new(FxHashMap::default()),
        }
    }

    fn unit_lock(&self, key: &UnitKey) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = match self.in_flight.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(map.entry(key.clone()).or_default())
    }

    fn forget(&self, key: &UnitKey) {
        if let Ok(mut map) = self.in_flight.lock() {
            map.remove(key);
        }
    }

    /// Run one attempt. A unit already being reconciled is deferred, never run twice.
    pub async fn reconcile(&self, unit: &Kustomization, snapshot: &UnitSnapshot) -> ReconcileResult {
        let key = unit.key();
        let lock = self.unit_lock(&key);
        let Ok(_guard) = lock.try_lock_owned() else {
            debug!(unit = %key, "reconciliation already in flight");
            return ReconcileResult::new(Outcome::Deferred, Some(Duration::from_secs(1)), None);
        };
        let started = std::time::Instant::now();
        let result = if unit.is_being_deleted() {
            self.finalize(unit).await
        } else if unit.spec.suspend {
            info!(unit = %key, "reconciliation suspended");
            ReconcileResult::new(Outcome::Suspended, None, None)
        } else {
            self.reconcile_active(unit, snapshot).await
        };
        if result.outcome == Outcome::Finalized {
            self.forget(&key);
        }
        counter!("reconcile_total", 1u64, "result" => result.outcome.as_str());
        histogram!("reconcile_duration_ms", started.elapsed().as_secs_f64() * 1000.0);
        result
    }

    async fn write_status(&self, unit: &Kustomization) {
        let Some(status) = unit.status.as_ref() else { return };
        if let Err(e) = self.status.patch_status(&unit.key(), status).await {
            counter!("status_patch_errors_total", 1u64);
            warn!(unit = %unit.key(), error = %e, "status patch failed");
        }
    }

    /// Record a failed attempt and schedule the retry.
    async fn fail(&self, mut next: Kustomization, revision: &str, err: ReconcileError) -> ReconcileResult {
        let reason = err.reason();
        warn!(unit = %next.key(), revision, reason = %reason, error = %err, "reconciliation failed");
        next.set_not_ready(revision, reason, &err.to_string());
        self.finish(next, Outcome::Failed(reason)).await
    }

    async fn finish(&self, mut next: Kustomization, outcome: Outcome) -> ReconcileResult {
        next.mark_reconcile_request_handled();
        self.write_status(&next).await;
        let requeue = match outcome {
            Outcome::Ready => next.spec.interval,
            Outcome::DependencyNotReady(_) => self.config.dependency_requeue,
            _ => next.get_retry_interval(),
        };
        ReconcileResult::new(outcome, Some(requeue), Some(next))
    }

    async fn reconcile_active(&self, unit: &Kustomization, snapshot: &UnitSnapshot) -> ReconcileResult {
        let key = unit.key();
        let mut next = unit.clone();

        if !unit.has_finalizer() {
            if let Err(e) = self.status.set_finalizer(&key, true).await {
                warn!(unit = %key, error = %e, "adding finalizer failed");
                return ReconcileResult::new(Outcome::Failed(Reason::ApplyFailed), Some(unit.get_retry_interval()), None);
            }
            next.metadata.finalizers.get_or_insert_with(Vec::new).push(converge_core::types::FINALIZER.to_string());
        }

        let graph = self.graph.get(snapshot);
        if let Some(cycle) = graph.cycle_of(&key) {
            let path: Vec<String> = cycle.iter().chain(cycle.first()).map(|k| k.to_string()).collect();
            let msg = format!("dependency cycle detected: {}", path.join(" -> "));
            warn!(unit = %key, "{}", msg);
            next.set_not_ready("", Reason::CycleDetected, &msg);
            return self.finish(next, Outcome::Failed(Reason::CycleDetected)).await;
        }

        let deadline = Instant::now() + unit.get_timeout();
        let ns = unit.namespace_or_default();
        let artifact = match within(deadline, "source fetch", Reason::BuildFailed, self.source.fetch(&unit.spec.source_ref, &ns), |e| {
            ReconcileError::Source(format!("{:#}", e))
        })
        .await
        {
            Ok(a) => a,
            Err(e) => return self.fail(next, "", e).await,
        };
        let revision = artifact.revision.clone();

        if let Err(e) = check_dependencies(unit, &revision, snapshot) {
            info!(unit = %key, dependency = %e.dependency(), "dependencies not ready");
            next.set_not_ready("", Reason::DependencyNotReady, &e.to_string());
            let dep = e.dependency().clone();
            return self.finish(next, Outcome::DependencyNotReady(dep)).await;
        }

        next.set_progressing(&format!("Reconciliation in progress for revision {}", revision));
        self.write_status(&next).await;

        match self.run_pipeline(unit, &mut next, &artifact, deadline).await {
            Ok(outcome) => self.finish(next, outcome).await,
            Err(e) => self.fail(next, &revision, e).await,
        }
    }

    /// Render through health. Apply outcomes with an inventory are written to
    /// `next` here; errors returned leave the inventory untouched.
    async fn run_pipeline(
        &self,
        unit: &Kustomization,
        next: &mut Kustomization,
        artifact: &Artifact,
        deadline: Instant,
    ) -> Result<Outcome, ReconcileError> {
        let key = unit.key();
        let revision = artifact.revision.as_str();

        let req = RenderRequest::for_unit(unit, artifact).map_err(|e| ReconcileError::Render(format!("{:#}", e)))?;
        let rendered = within(deadline, "build", Reason::BuildFailed, self.renderer.render(&req), |e| {
            ReconcileError::Render(format!("{:#}", e))
        })
        .await?;

        let manifests = within(
            deadline,
            "post-build",
            Reason::BuildFailed,
            converge_postbuild::run(self.local.as_ref(), unit, &rendered, self.config.strict_substitution),
            ReconcileError::PostBuild,
        )
        .await?;

        let cluster = within(deadline, "credential resolution", Reason::ApplyFailed, self.credentials.resolve(unit), |e| {
            ReconcileError::Credentials(format!("{:#}", e))
        })
        .await?;

        let previous = unit.status.as_ref().and_then(|s| s.inventory.clone());
        let opts = ApplyOptions {
            prune: unit.spec.prune,
            force: unit.spec.force,
            default_namespace: unit.spec.target_namespace.clone().unwrap_or_else(|| unit.namespace_or_default()),
            owner_labels: unit.owner_labels(),
            deadline,
        };
        let engine = ApplyEngine::new(cluster.as_ref(), &self.registry).with_limits(self.config.manifest_limits);
        let report = engine.run(&manifests, previous.as_ref(), &opts).await?;

        if let Err((reason, msg)) = report.outcome() {
            warn!(unit = %key, revision, reason = %reason, "apply finished with errors");
            next.set_not_ready_with_inventory(report.inventory, revision, reason, &msg);
            return Ok(Outcome::Failed(reason));
        }
        info!(
            unit = %key,
            revision,
            objects = report.inventory.len(),
            pruned = report.pruned.len(),
            mutated = report.mutated(),
            "applied"
        );

        let applied = report.applied();
        next.set_ready_with_inventory(report.inventory, revision, &format!("Applied revision: {}", revision));
        if !unit.requires_health() {
            return Ok(Outcome::Ready);
        }

        let targets = health_targets(unit, &applied);
        let health = HealthAssessor::new(cluster.as_ref(), &self.readiness)
            .poll_interval(self.config.health_poll_interval)
            .max_reported(self.config.max_reported_not_ready)
            .assess(&targets, deadline)
            .await;
        if health.healthy() {
            next.set_healthiness(ConditionStatus::True, Reason::ReconciliationSucceeded, &health.message());
            Ok(Outcome::Ready)
        } else {
            warn!(unit = %key, revision, not_ready = health.total_not_ready, "health assessment failed");
            next.set_healthiness(ConditionStatus::False, Reason::Unhealthy, &health.message());
            Ok(Outcome::Unhealthy)
        }
    }

    /// Deletion: one prune-only pass over the inventory, then release the finalizer.
    async fn finalize(&self, unit: &Kustomization) -> ReconcileResult {
        let key = unit.key();
        if !unit.has_finalizer() {
            return ReconcileResult::new(Outcome::Finalized, None, None);
        }
        let inventory = unit.status.as_ref().and_then(|s| s.inventory.as_ref());
        match inventory {
            Some(inv) if unit.spec.prune && !unit.spec.suspend => self.teardown(unit, inv).await,
            _ => debug!(unit = %key, "nothing to garbage collect"),
        }
        if let Err(e) = self.status.set_finalizer(&key, false).await {
            warn!(unit = %key, error = %e, "removing finalizer failed");
            return ReconcileResult::new(Outcome::Failed(Reason::PruneFailed), Some(unit.get_retry_interval()), None);
        }
        info!(unit = %key, "finalizer removed");
        ReconcileResult::new(Outcome::Finalized, None, None)
    }

    async fn teardown(&self, unit: &Kustomization, inventory: &converge_core::Inventory) {
        let key = unit.key();
        let cluster = match self.credentials.resolve(unit).await {
            Ok(c) => c,
            Err(e) => {
                warn!(unit = %key, error = %e, "skipping garbage collection: no credentials");
                return;
            }
        };
        let opts = ApplyOptions {
            prune: true,
            force: false,
            default_namespace: unit.namespace_or_default(),
            owner_labels: unit.owner_labels(),
            deadline: Instant::now() + unit.get_timeout(),
        };
        match ApplyEngine::new(cluster.as_ref(), &self.registry).teardown(inventory, &opts).await {
            Ok(report) => match report.outcome() {
                Ok(()) => info!(unit = %key, pruned = report.pruned.len(), "garbage collected"),
                Err((_, msg)) => warn!(unit = %key, error = %msg, "garbage collection incomplete"),
            },
            Err(e) => warn!(unit = %key, error = %e, "garbage collection failed"),
        }
    }
}

//! Readiness of a live object, one check per kind plus a condition-based fallback.

use std::sync::Arc;

use converge_schema::value_at;
use rustc_hash::FxHashMap;
use serde_json::Value as Json;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    InProgress(String),
    /// Terminal: waiting longer will not help.
    Failed(String),
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready)
    }
}

pub trait ReadinessCheck: Send + Sync {
    fn check(&self, obj: &Json) -> Readiness;
}

impl<F> ReadinessCheck for F
where
    F: Fn(&Json) -> Readiness + Send + Sync,
{
    fn check(&self, obj: &Json) -> Readiness {
        self(obj)
    }
}

fn int_at(obj: &Json, path: &str) -> Option<i64> {
    value_at(obj, path).and_then(|v| v.as_i64())
}

fn str_at<'a>(obj: &'a Json, path: &str) -> Option<&'a str> {
    value_at(obj, path).and_then(|v| v.as_str())
}

/// `(status, reason, message)` of the condition with the given type.
fn condition<'a>(obj: &'a Json, type_: &str) -> Option<(&'a str, &'a str, &'a str)> {
    value_at(obj, "status.conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(|t| t.as_str()) == Some(type_))
        .map(|c| {
            let field = |f: &str| c.get(f).and_then(|v| v.as_str()).unwrap_or("");
            (field("status"), field("reason"), field("message"))
        })
}

/// The controller has not caught up with the latest spec.
fn generation_pending(obj: &Json) -> Option<Readiness> {
    let generation = int_at(obj, "metadata.generation")?;
    let observed = int_at(obj, "status.observedGeneration").unwrap_or(-1);
    (observed < generation).then(|| Readiness::InProgress(format!("observed generation {} < {}", observed, generation)))
}

fn replicas(obj: &Json) -> i64 {
    int_at(obj, "spec.replicas").unwrap_or(1)
}

pub fn deployment(obj: &Json) -> Readiness {
    if let Some(r) = generation_pending(obj) {
        return r;
    }
    if let Some((_, "ProgressDeadlineExceeded", msg)) = condition(obj, "Progressing") {
        return Readiness::Failed(format!("progress deadline exceeded: {}", msg));
    }
    let want = replicas(obj);
    let updated = int_at(obj, "status.updatedReplicas").unwrap_or(0);
    let available = int_at(obj, "status.availableReplicas").unwrap_or(0);
    let total = int_at(obj, "status.replicas").unwrap_or(0);
    if updated < want {
        return Readiness::InProgress(format!("{} of {} replicas updated", updated, want));
    }
    if total > updated {
        return Readiness::InProgress(format!("{} old replicas pending termination", total - updated));
    }
    if available < want {
        return Readiness::InProgress(format!("{} of {} replicas available", available, want));
    }
    Readiness::Ready
}

pub fn stateful_set(obj: &Json) -> Readiness {
    if let Some(r) = generation_pending(obj) {
        return r;
    }
    let want = replicas(obj);
    let ready = int_at(obj, "status.readyReplicas").unwrap_or(0);
    if ready < want {
        return Readiness::InProgress(format!("{} of {} replicas ready", ready, want));
    }
    let rolling = str_at(obj, "spec.updateStrategy.type").unwrap_or("RollingUpdate") == "RollingUpdate";
    if rolling {
        let current = str_at(obj, "status.currentRevision");
        let update = str_at(obj, "status.updateRevision");
        if update.is_some() && current != update {
            return Readiness::InProgress("rolling update in progress".into());
        }
    }
    Readiness::Ready
}

pub fn daemon_set(obj: &Json) -> Readiness {
    if let Some(r) = generation_pending(obj) {
        return r;
    }
    let desired = int_at(obj, "status.desiredNumberScheduled").unwrap_or(0);
    let updated = int_at(obj, "status.updatedNumberScheduled").unwrap_or(0);
    let available = int_at(obj, "status.numberAvailable").unwrap_or(0);
    if updated < desired {
        return Readiness::InProgress(format!("{} of {} pods updated", updated, desired));
    }
    if available < desired {
        return Readiness::InProgress(format!("{} of {} pods available", available, desired));
    }
    Readiness::Ready
}

pub fn job(obj: &Json) -> Readiness {
    if let Some(("True", _, msg)) = condition(obj, "Failed") {
        return Readiness::Failed(format!("job failed: {}", msg));
    }
    match condition(obj, "Complete") {
        Some(("True", _, _)) => Readiness::Ready,
        _ => Readiness::InProgress("job not complete".into()),
    }
}

pub fn pod(obj: &Json) -> Readiness {
    match str_at(obj, "status.phase") {
        Some("Succeeded") => Readiness::Ready,
        Some("Failed") => Readiness::Failed(str_at(obj, "status.message").unwrap_or("pod failed").to_string()),
        Some("Running") => match condition(obj, "Ready") {
            Some(("True", _, _)) => Readiness::Ready,
            _ => Readiness::InProgress("pod not ready".into()),
        },
        phase => Readiness::InProgress(format!("pod phase {}", phase.unwrap_or("unknown"))),
    }
}

pub fn persistent_volume_claim(obj: &Json) -> Readiness {
    match str_at(obj, "status.phase") {
        Some("Bound") => Readiness::Ready,
        Some("Lost") => Readiness::Failed("claim lost its volume".into()),
        phase => Readiness::InProgress(format!("claim phase {}", phase.unwrap_or("unknown"))),
    }
}

pub fn service(obj: &Json) -> Readiness {
    if str_at(obj, "spec.type") != Some("LoadBalancer") {
        return Readiness::Ready;
    }
    let has_ingress = value_at(obj, "status.loadBalancer.ingress")
        .and_then(|v| v.as_array())
        .map(|a| !a.is_empty())
        .unwrap_or(false);
    if has_ingress {
        Readiness::Ready
    } else {
        Readiness::InProgress("load balancer not provisioned".into())
    }
}

pub fn namespace(obj: &Json) -> Readiness {
    match str_at(obj, "status.phase") {
        Some("Terminating") => Readiness::InProgress("namespace terminating".into()),
        _ => Readiness::Ready,
    }
}

/// Kinds without a dedicated check: the `Ready` condition when present,
/// otherwise existing is enough.
pub fn generic(obj: &Json) -> Readiness {
    if let Some(r) = generation_pending(obj).filter(|_| value_at(obj, "status.observedGeneration").is_some()) {
        return r;
    }
    match condition(obj, "Ready") {
        Some(("True", _, _)) | None => Readiness::Ready,
        Some((_, reason, msg)) if reason.ends_with("Failed") => Readiness::Failed(format!("{}: {}", reason, msg)),
        Some((_, _, msg)) => Readiness::InProgress(if msg.is_empty() { "not ready".into() } else { msg.to_string() }),
    }
}

/// Lookup table from (group, kind) to its readiness check.
pub struct ReadinessTable {
    checks: FxHashMap<(String, String), Arc<dyn ReadinessCheck>>,
    fallback: Arc<dyn ReadinessCheck>,
}

impl Default for ReadinessTable {
    fn default() -> Self {
        Self::with_builtins()
    }
}

impl ReadinessTable {
    pub fn empty() -> Self {
        Self { checks: FxHashMap::default(), fallback: Arc::new(generic) }
    }

    pub fn with_builtins() -> Self {
        let mut t = Self::empty();
        t.register("apps", "Deployment", deployment);
        t.register("apps", "StatefulSet", stateful_set);
        t.register("apps", "DaemonSet", daemon_set);
        t.register("batch", "Job", job);
        t.register("", "Pod", pod);
        t.register("", "PersistentVolumeClaim", persistent_volume_claim);
        t.register("", "Service", service);
        t.register("", "Namespace", namespace);
        t
    }

    pub fn register(&mut self, group: &str, kind: &str, check: impl ReadinessCheck + 'static) {
        self.checks.insert((group.to_string(), kind.to_string()), Arc::new(check));
    }

    pub fn readiness_of(&self, obj: &Json) -> Readiness {
        let api_version = obj.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("");
        let group = api_version.split_once('/').map(|(g, _)| g).unwrap_or("");
        let kind = obj.get("kind").and_then(|v| v.as_str()).unwrap_or("");
        match self.checks.get(&(group.to_string(), kind.to_string())) {
            Some(check) => check.check(obj),
            None => self.fallback.check(obj),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn deploy(status: Json) -> Json {
        json!({
            "apiVersion": "apps/v1", "kind": "Deployment",
            "metadata": { "name": "web", "generation": 2 },
            "spec": { "replicas": 2 },
            "status": status
        })
    }

    #[test]
    fn deployment_rollout_states() {
        let t = ReadinessTable::with_builtins();
        let stale = deploy(json!({ "observedGeneration": 1, "updatedReplicas": 2, "availableReplicas": 2, "replicas": 2 }));
        assert!(matches!(t.readiness_of(&stale), Readiness::InProgress(_)));
        let rolling = deploy(json!({ "observedGeneration": 2, "updatedReplicas": 1, "availableReplicas": 2, "replicas": 3 }));
        assert!(matches!(t.readiness_of(&rolling), Readiness::InProgress(_)));
        let done = deploy(json!({ "observedGeneration": 2, "updatedReplicas": 2, "availableReplicas": 2, "replicas": 2 }));
        assert_eq!(t.readiness_of(&done), Readiness::Ready);
        let stuck = deploy(json!({
            "observedGeneration": 2,
            "conditions": [ { "type": "Progressing", "status": "False", "reason": "ProgressDeadlineExceeded", "message": "timed out" } ]
        }));
        assert!(matches!(t.readiness_of(&stuck), Readiness::Failed(_)));
    }

    #[test]
    fn job_and_pod_terminal_states() {
        let t = ReadinessTable::with_builtins();
        let failed = json!({ "apiVersion": "batch/v1", "kind": "Job", "status": { "conditions": [ { "type": "Failed", "status": "True", "message": "backoff" } ] } });
        assert!(matches!(t.readiness_of(&failed), Readiness::Failed(_)));
        let complete = json!({ "apiVersion": "batch/v1", "kind": "Job", "status": { "conditions": [ { "type": "Complete", "status": "True" } ] } });
        assert!(t.readiness_of(&complete).is_ready());
        let pending = json!({ "apiVersion": "v1", "kind": "Pod", "status": { "phase": "Pending" } });
        assert!(!t.readiness_of(&pending).is_ready());
    }

    #[test]
    fn fallback_uses_ready_condition_or_existence() {
        let t = ReadinessTable::with_builtins();
        let cm = json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": { "name": "x" } });
        assert!(t.readiness_of(&cm).is_ready());
        let cr = json!({
            "apiVersion": "example.com/v1", "kind": "Widget",
            "status": { "conditions": [ { "type": "Ready", "status": "False", "reason": "Provisioning", "message": "waiting" } ] }
        });
        assert_eq!(t.readiness_of(&cr), Readiness::InProgress("waiting".into()));
    }

    #[test]
    fn custom_checks_override_fallback() {
        let mut t = ReadinessTable::with_builtins();
        t.register("example.com", "Widget", |_: &Json| Readiness::Failed("never".into()));
        let cr = json!({ "apiVersion": "example.com/v1", "kind": "Widget" });
        assert_eq!(t.readiness_of(&cr), Readiness::Failed("never".into()));
    }
}

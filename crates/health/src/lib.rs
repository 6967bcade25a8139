//! converge health: poll applied objects (or an explicit check list) until every
//! one is ready or the attempt deadline passes.

#![forbid(unsafe_code)]

pub mod readiness;

use std::collections::BTreeMap;
use std::time::Duration;

use converge_core::{Cluster, Kustomization, ObjectRef};
use metrics::counter;
use tokio::time::Instant;
use tracing::{debug, info};

pub use readiness::{Readiness, ReadinessCheck, ReadinessTable};

/// Objects whose readiness decides the Healthy condition. `wait` covers every
/// applied object and takes precedence over an explicit `healthChecks` list.
pub fn health_targets(unit: &Kustomization, applied: &[ObjectRef]) -> Vec<ObjectRef> {
    if unit.spec.wait {
        return applied.to_vec();
    }
    let ns = unit.namespace_or_default();
    unit.spec
        .health_checks
        .iter()
        .map(|c| ObjectRef::new(&c.api_version, &c.kind, c.namespace.as_deref().unwrap_or(&ns), &c.name))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    /// First not-ready objects, sorted by group/kind/namespace/name.
    pub not_ready: Vec<(ObjectRef, String)>,
    pub total_not_ready: usize,
    pub polls: u32,
}

impl HealthReport {
    pub fn healthy(&self) -> bool {
        self.total_not_ready == 0
    }

    pub fn message(&self) -> String {
        if self.healthy() {
            return "all health checks passed".to_string();
        }
        let listed: Vec<String> = self.not_ready.iter().map(|(id, why)| format!("{} ({})", id, why)).collect();
        let more = self.total_not_ready - self.not_ready.len();
        let suffix = if more > 0 { format!(" and {} more", more) } else { String::new() };
        format!("health check failed for {} object(s): {}{}", self.total_not_ready, listed.join(", "), suffix)
    }
}

pub struct HealthAssessor<'a> {
    cluster: &'a dyn Cluster,
    table: &'a ReadinessTable,
    poll_interval: Duration,
    max_reported: usize,
}

impl<'a> HealthAssessor<'a> {
    pub fn new(cluster: &'a dyn Cluster, table: &'a ReadinessTable) -> Self {
        Self { cluster, table, poll_interval: Duration::from_secs(2), max_reported: 10 }
    }

    pub fn poll_interval(mut self, d: Duration) -> Self {
        self.poll_interval = d;
        self
    }

    pub fn max_reported(mut self, n: usize) -> Self {
        self.max_reported = n;
        self
    }

    async fn readiness(&self, id: &ObjectRef, deadline: Instant) -> Readiness {
        match tokio::time::timeout_at(deadline, self.cluster.get(id)).await {
            Ok(Ok(Some(obj))) => self.table.readiness_of(&obj),
            Ok(Ok(None)) => Readiness::InProgress("not found".into()),
            Ok(Err(e)) => Readiness::InProgress(e.to_string()),
            Err(_) => Readiness::InProgress("deadline exceeded".into()),
        }
    }

    /// Poll at least once, then until everything is ready, something failed for
    /// good, or `deadline` passes.
    pub async fn assess(&self, targets: &[ObjectRef], deadline: Instant) -> HealthReport {
        let mut pending: BTreeMap<ObjectRef, String> = targets.iter().map(|t| (t.clone(), String::new())).collect();
        let mut polls = 0u32;
        loop {
            polls += 1;
            let mut failed = false;
            let ids: Vec<ObjectRef> = pending.keys().cloned().collect();
            for id in ids {
                match self.readiness(&id, deadline).await {
                    Readiness::Ready => {
                        pending.remove(&id);
                    }
                    Readiness::InProgress(why) => {
                        pending.insert(id, why);
                    }
                    Readiness::Failed(why) => {
                        failed = true;
                        pending.insert(id, why);
                    }
                }
            }
            if pending.is_empty() || failed {
                break;
            }
            let next = Instant::now() + self.poll_interval;
            if next >= deadline {
                break;
            }
            debug!(pending = pending.len(), "waiting for objects to become ready");
            tokio::time::sleep_until(next).await;
        }

        let total_not_ready = pending.len();
        let result = if total_not_ready == 0 { "healthy" } else { "unhealthy" };
        counter!("health_checks_total", 1u64, "result" => result);
        info!(targets = targets.len(), not_ready = total_not_ready, polls, "health assessment finished");
        HealthReport {
            not_ready: pending.into_iter().take(self.max_reported).collect(),
            total_not_ready,
            polls,
        }
    }
}

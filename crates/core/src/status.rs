//! Status transitions of a unit. Every attempt ends in exactly one of these helpers.

use crate::conditions::{Condition, ConditionStatus, ConditionType, Reason};
use crate::inventory::Inventory;
use crate::types::Kustomization;

impl Kustomization {
    fn status_mut(&mut self) -> &mut crate::types::KustomizationStatus {
        self.status.get_or_insert_with(Default::default)
    }

    fn set_condition(&mut self, t: ConditionType, status: ConditionStatus, reason: Reason, message: &str) {
        let generation = self.generation();
        self.status_mut().conditions.set(Condition::new(t, status, reason, message, generation));
    }

    /// Attempt started: Ready=Unknown/Progressing. Healthy is left as is.
    pub fn set_progressing(&mut self, message: &str) {
        self.set_condition(ConditionType::Ready, ConditionStatus::Unknown, Reason::Progressing, message);
    }

    /// Set or clear the Healthy condition. It only exists when health is required.
    pub fn set_healthiness(&mut self, status: ConditionStatus, reason: Reason, message: &str) {
        if self.requires_health() {
            self.set_condition(ConditionType::Healthy, status, reason, message);
        } else {
            self.status_mut().conditions.remove(ConditionType::Healthy);
        }
    }

    /// Ready condition, observed generation and attempted revision; shared by every outcome.
    fn set_readiness(&mut self, status: ConditionStatus, reason: Reason, message: &str, revision: &str) {
        self.set_condition(ConditionType::Ready, status, reason, message);
        let generation = self.generation();
        let st = self.status_mut();
        st.observed_generation = st.observed_generation.max(generation);
        if !revision.is_empty() {
            st.last_attempted_revision = revision.to_string();
        }
    }

    /// Failure before anything was applied. Inventory and Healthy are untouched.
    pub fn set_not_ready(&mut self, revision: &str, reason: Reason, message: &str) {
        self.set_readiness(ConditionStatus::False, reason, message, revision);
    }

    /// Apply/prune finished with errors: the successful subset becomes the inventory.
    pub fn set_not_ready_with_inventory(&mut self, inventory: Inventory, revision: &str, reason: Reason, message: &str) {
        self.set_readiness(ConditionStatus::False, reason, message, revision);
        self.set_healthiness(ConditionStatus::False, reason, reason.as_str());
        self.status_mut().inventory = Some(inventory);
    }

    /// Apply succeeded. Healthy is set to True (or removed); callers downgrade it on failed assessment.
    pub fn set_ready_with_inventory(&mut self, inventory: Inventory, revision: &str, message: &str) {
        let reason = Reason::ReconciliationSucceeded;
        self.set_readiness(ConditionStatus::True, reason, message, revision);
        self.set_healthiness(ConditionStatus::True, reason, reason.as_str());
        let st = self.status_mut();
        st.inventory = Some(inventory);
        st.last_applied_revision = revision.to_string();
    }

    /// Record that the pending reconcile request has been seen.
    pub fn mark_reconcile_request_handled(&mut self) {
        if let Some(req) = self.reconcile_request().map(str::to_string) {
            self.status_mut().last_handled_reconcile_at = Some(req);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::inventory::ObjectRef;
    use crate::types::{KustomizationSpec, NamespacedObjectKindReference};

    fn unit(wait: bool, checks: bool) -> Kustomization {
        let mut spec = KustomizationSpec { interval: Duration::from_secs(60), wait, ..Default::default() };
        if checks {
            spec.health_checks.push(NamespacedObjectKindReference {
                api_version: "apps/v1".into(),
                kind: "Deployment".into(),
                name: "web".into(),
                namespace: Some("apps".into()),
            });
        }
        let mut k = Kustomization::new("app", spec);
        k.metadata.namespace = Some("apps".into());
        k.metadata.generation = Some(3);
        k
    }

    fn inv() -> Inventory {
        Inventory::from_refs(&[ObjectRef::new("v1", "ConfigMap", "apps", "cm")])
    }

    #[test]
    fn progressing_leaves_healthy_alone() {
        let mut k = unit(true, false);
        k.set_ready_with_inventory(inv(), "main@sha1:a", "applied");
        k.set_progressing("reconciling main@sha1:b");
        let ready = k.condition(ConditionType::Ready).unwrap();
        assert_eq!(ready.status, ConditionStatus::Unknown);
        assert_eq!(ready.reason, "Progressing");
        assert!(k.condition(ConditionType::Healthy).unwrap().is_true());
    }

    #[test]
    fn healthy_condition_absent_without_health_requirement() {
        let mut k = unit(false, false);
        k.set_ready_with_inventory(inv(), "rev", "applied");
        assert!(k.condition(ConditionType::Healthy).is_none());
        k.set_not_ready_with_inventory(inv(), "rev2", Reason::ApplyFailed, "boom");
        assert!(k.condition(ConditionType::Healthy).is_none());

        let mut k = unit(false, true);
        k.set_ready_with_inventory(inv(), "rev", "applied");
        assert!(k.condition(ConditionType::Healthy).is_some());
    }

    #[test]
    fn failures_keep_last_applied_revision() {
        let mut k = unit(false, false);
        k.set_ready_with_inventory(inv(), "rev1", "applied");
        k.set_not_ready_with_inventory(Inventory::default(), "rev2", Reason::ApplyFailed, "boom");
        let st = k.status.as_ref().unwrap();
        assert_eq!(st.last_applied_revision, "rev1");
        assert_eq!(st.last_attempted_revision, "rev2");
        assert_eq!(st.inventory, Some(Inventory::default()));
        assert_eq!(st.observed_generation, 3);
    }

    #[test]
    fn not_ready_leaves_inventory_untouched() {
        let mut k = unit(false, false);
        k.set_ready_with_inventory(inv(), "rev1", "applied");
        k.set_not_ready("rev2", Reason::BuildFailed, "kustomize build failed");
        let st = k.status.as_ref().unwrap();
        assert_eq!(st.inventory, Some(inv()));
        assert_eq!(st.conditions.get(ConditionType::Ready).unwrap().reason, "BuildFailed");
    }

    #[test]
    fn observed_generation_never_regresses() {
        let mut k = unit(false, false);
        k.set_not_ready("rev", Reason::BuildFailed, "x");
        assert_eq!(k.status.as_ref().unwrap().observed_generation, 3);
        k.metadata.generation = Some(2);
        k.set_not_ready("rev", Reason::BuildFailed, "x");
        assert_eq!(k.status.as_ref().unwrap().observed_generation, 3);
    }
}

//! Dependency gate and cycle detection over the `dependsOn` graph.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use converge_core::types::SourceReference;
use converge_core::{Kustomization, UnitKey};
use converge_store::UnitSnapshot;
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GateError {
    #[error("dependency '{0}' not found")]
    NotFound(UnitKey),
    #[error("dependency '{0}' is not ready")]
    NotReady(UnitKey),
    #[error("dependency '{0}' has not reconciled its latest generation")]
    Stale(UnitKey),
    #[error("dependency '{dependency}' is at revision '{have}', waiting for '{want}'")]
    RevisionMismatch { dependency: UnitKey, want: String, have: String },
}

impl GateError {
    pub fn dependency(&self) -> &UnitKey {
        match self {
            GateError::NotFound(k) | GateError::NotReady(k) | GateError::Stale(k) => k,
            GateError::RevisionMismatch { dependency, .. } => dependency,
        }
    }
}

fn same_source(a: &Kustomization, b: &Kustomization) -> bool {
    let resolve = |k: &Kustomization| -> (String, String, String) {
        let SourceReference { kind, name, namespace, .. } = &k.spec.source_ref;
        (kind.clone(), name.clone(), namespace.clone().unwrap_or_else(|| k.namespace_or_default()))
    };
    resolve(a) == resolve(b)
}

/// Check dependencies in declaration order and report the first unmet one.
pub fn check_dependencies(unit: &Kustomization, revision: &str, snapshot: &UnitSnapshot) -> Result<(), GateError> {
    for dep_key in unit.depends_on() {
        let Some(dep) = snapshot.get(&dep_key) else {
            return Err(GateError::NotFound(dep_key));
        };
        let observed = dep.status.as_ref().map(|s| s.observed_generation).unwrap_or(-1);
        if observed != dep.generation() {
            return Err(GateError::Stale(dep_key));
        }
        if !dep.is_ready() {
            return Err(GateError::NotReady(dep_key));
        }
        if same_source(unit, dep) {
            let have = dep.status.as_ref().map(|s| s.last_applied_revision.as_str()).unwrap_or("");
            if have != revision {
                return Err(GateError::RevisionMismatch {
                    dependency: dep_key,
                    want: revision.to_string(),
                    have: have.to_string(),
                });
            }
        }
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Units that sit on a dependency cycle, computed for one snapshot epoch.
#[derive(Debug, Default)]
pub struct DependencyGraph {
    epoch: u64,
    cycles: BTreeMap<UnitKey, Vec<UnitKey>>,
}

impl DependencyGraph {
    pub fn build(snapshot: &UnitSnapshot) -> Self {
        let edges: BTreeMap<UnitKey, Vec<UnitKey>> =
            snapshot.units.iter().map(|(k, u)| (k.clone(), u.depends_on())).collect();
        let mut marks: FxHashMap<UnitKey, Mark> = FxHashMap::default();
        let mut stack = Vec::new();
        let mut cycles = BTreeMap::new();
        for key in edges.keys() {
            if !marks.contains_key(key) {
                visit(key, &edges, &mut marks, &mut stack, &mut cycles);
            }
        }
        Self { epoch: snapshot.epoch, cycles }
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// The cycle `key` belongs to, starting at the first unit visited on it.
    pub fn cycle_of(&self, key: &UnitKey) -> Option<&[UnitKey]> {
        self.cycles.get(key).map(|c| c.as_slice())
    }

    pub fn has_cycles(&self) -> bool {
        !self.cycles.is_empty()
    }
}

fn visit(
    key: &UnitKey,
    edges: &BTreeMap<UnitKey, Vec<UnitKey>>,
    marks: &mut FxHashMap<UnitKey, Mark>,
    stack: &mut Vec<UnitKey>,
    cycles: &mut BTreeMap<UnitKey, Vec<UnitKey>>,
) {
    marks.insert(key.clone(), Mark::Visiting);
    stack.push(key.clone());
    for dep in edges.get(key).map(|d| d.as_slice()).unwrap_or(&[]) {
        match marks.get(dep).copied() {
            None if edges.contains_key(dep) => visit(dep, edges, marks, stack, cycles),
            None | Some(Mark::Done) => {}
            Some(Mark::Visiting) => {
                if let Some(start) = stack.iter().position(|k| k == dep) {
                    let cycle = stack[start..].to_vec();
                    for member in &cycle {
                        cycles.entry(member.clone()).or_insert_with(|| cycle.clone());
                    }
                }
            }
        }
    }
    stack.pop();
    marks.insert(key.clone(), Mark::Done);
}

/// Rebuilds the graph once per snapshot epoch rather than once per unit.
#[derive(Default)]
pub struct GraphCache {
    current: Mutex<Option<Arc<DependencyGraph>>>,
}

impl GraphCache {
    pub fn get(&self, snapshot: &UnitSnapshot) -> Arc<DependencyGraph> {
        let mut slot = match self.current.lock() {
            Ok(g) => g,
            Err(poisoned) => poisoned.into_inner(),
        };
        match slot.as_ref() {
            Some(g) if g.epoch() == snapshot.epoch => Arc::clone(g),
            _ => {
                let g = Arc::new(DependencyGraph::build(snapshot));
                *slot = Some(Arc::clone(&g));
                g
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use converge_core::conditions::{Condition, ConditionStatus, ConditionType, Reason};
    use converge_core::types::DependencyReference;
    use converge_core::{KustomizationSpec, KustomizationStatus};

    fn unit(name: &str, deps: &[&str], source: &str) -> Kustomization {
        let mut k = Kustomization::new(
            name,
            KustomizationSpec {
                interval: Duration::from_secs(60),
                source_ref: SourceReference { kind: "GitRepository".into(), name: source.into(), ..Default::default() },
                depends_on: deps.iter().map(|d| DependencyReference { name: d.to_string(), namespace: None }).collect(),
                ..Default::default()
            },
        );
        k.metadata.namespace = Some("flux".into());
        k.metadata.generation = Some(1);
        k
    }

    fn ready(mut k: Kustomization, revision: &str) -> Kustomization {
        let mut st = KustomizationStatus { observed_generation: 1, last_applied_revision: revision.into(), ..Default::default() };
        st.conditions.set(Condition::new(ConditionType::Ready, ConditionStatus::True, Reason::ReconciliationSucceeded, "", 1));
        k.status = Some(st);
        k
    }

    fn key(name: &str) -> UnitKey {
        UnitKey::new("flux", name)
    }

    #[test]
    fn first_unmet_dependency_in_declaration_order() {
        let b = unit("b", &["x", "a"], "other");
        let snap = UnitSnapshot::from_units(1, [unit("a", &[], "repo"), b.clone()]);
        assert_eq!(check_dependencies(&b, "main@1", &snap), Err(GateError::NotFound(key("x"))));

        let b = unit("b", &["a"], "other");
        let mut a = unit("a", &[], "repo");
        a.status = Some(KustomizationStatus { observed_generation: 1, ..Default::default() });
        let snap = UnitSnapshot::from_units(1, [a, b.clone()]);
        assert_eq!(check_dependencies(&b, "main@1", &snap).unwrap_err().dependency(), &key("a"));
    }

    #[test]
    fn ready_dependency_on_another_source_passes() {
        let b = unit("b", &["a"], "other");
        let snap = UnitSnapshot::from_units(1, [ready(unit("a", &[], "repo"), "main@0"), b.clone()]);
        assert_eq!(check_dependencies(&b, "main@1", &snap), Ok(()));
    }

    #[test]
    fn shared_source_requires_same_revision() {
        let b = unit("b", &["a"], "repo");
        let snap = UnitSnapshot::from_units(1, [ready(unit("a", &[], "repo"), "main@0"), b.clone()]);
        assert!(matches!(check_dependencies(&b, "main@1", &snap), Err(GateError::RevisionMismatch { .. })));
        let snap = UnitSnapshot::from_units(1, [ready(unit("a", &[], "repo"), "main@1"), b.clone()]);
        assert_eq!(check_dependencies(&b, "main@1", &snap), Ok(()));
    }

    #[test]
    fn ready_but_stale_generation_blocks() {
        let b = unit("b", &["a"], "other");
        let mut a = ready(unit("a", &[], "repo"), "main@0");
        a.metadata.generation = Some(2);
        let snap = UnitSnapshot::from_units(1, [a, b.clone()]);
        assert_eq!(check_dependencies(&b, "x", &snap), Err(GateError::Stale(key("a"))));
    }

    #[test]
    fn cycles_are_found_and_bystanders_are_not() {
        let snap = UnitSnapshot::from_units(
            3,
            [
                unit("a", &["b"], "r"),
                unit("b", &["c"], "r"),
                unit("c", &["a"], "r"),
                unit("d", &["a"], "r"),
                unit("e", &["e"], "r"),
                unit("f", &["missing"], "r"),
            ],
        );
        let g = DependencyGraph::build(&snap);
        assert_eq!(g.cycle_of(&key("b")).map(|c| c.len()), Some(3));
        assert!(g.cycle_of(&key("a")).is_some() && g.cycle_of(&key("c")).is_some());
        assert!(g.cycle_of(&key("d")).is_none());
        assert_eq!(g.cycle_of(&key("e")), Some(&[key("e")][..]));
        assert!(g.cycle_of(&key("f")).is_none());
    }

    #[test]
    fn cache_rebuilds_only_on_new_epoch() {
        let cache = GraphCache::default();
        let snap = UnitSnapshot::from_units(1, [unit("a", &["a"], "r")]);
        let first = cache.get(&snap);
        assert!(Arc::ptr_eq(&first, &cache.get(&snap)));
        let next = UnitSnapshot::from_units(2, [unit("a", &[], "r")]);
        let second = cache.get(&next);
        assert!(!second.has_cycles());
    }
}

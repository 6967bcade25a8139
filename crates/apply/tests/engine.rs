use std::collections::BTreeMap;
use std::time::Duration;

use converge_apply::{ApplyEngine, ApplyError, ApplyOptions, Change};
use converge_core::mock::{MockCluster, MockOp};
use converge_core::types::{NAME_LABEL, NAMESPACE_LABEL, PRUNE_ANNOTATION};
use converge_core::{ClusterError, Inventory, InventoryEntry, ObjectRef, Reason};
use converge_schema::TypeRegistry;
use serde_json::json;
use tokio::time::Instant;

fn opts(prune: bool) -> ApplyOptions {
    ApplyOptions {
        prune,
        force: false,
        default_namespace: "apps".into(),
        owner_labels: BTreeMap::from([
            (NAME_LABEL.to_string(), "web".to_string()),
            (NAMESPACE_LABEL.to_string(), "flux".to_string()),
        ]),
        deadline: Instant::now() + Duration::from_secs(30),
    }
}

fn cm(name: &str) -> String {
    format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {}\ndata:\n  k: v\n", name)
}

fn render(names: &[&str]) -> Vec<u8> {
    names.iter().map(|n| cm(n)).collect::<Vec<_>>().join("---\n").into_bytes()
}

fn cm_ref(name: &str) -> ObjectRef {
    ObjectRef::new("v1", "ConfigMap", "apps", name)
}

#[tokio::test]
async fn second_run_against_converged_cluster_is_a_noop() {
    let cluster = MockCluster::new();
    let reg = TypeRegistry::with_builtins();
    let engine = ApplyEngine::new(&cluster, &reg);
    let manifests = render(&["a", "b"]);

    let first = engine.run(&manifests, None, &opts(true)).await.unwrap();
    assert!(first.outcome().is_ok());
    assert_eq!(first.changes.iter().filter(|(_, c)| *c == Change::Created).count(), 2);
    let live = cluster.object(&cm_ref("a")).unwrap();
    assert_eq!(live["metadata"]["namespace"], "apps");
    assert_eq!(live["metadata"]["labels"][NAME_LABEL], "web");

    cluster.clear_ops();
    let second = engine.run(&manifests, Some(&first.inventory), &opts(true)).await.unwrap();
    assert!(cluster.ops().is_empty());
    assert!(!second.mutated());
    assert_eq!(second.inventory, first.inventory);
}

#[tokio::test]
async fn stale_objects_are_pruned_exactly_once_in_reverse_order() {
    let cluster = MockCluster::new();
    let reg = TypeRegistry::with_builtins();
    let engine = ApplyEngine::new(&cluster, &reg);
    let first = engine.run(&render(&["a", "b", "c"]), None, &opts(true)).await.unwrap();

    cluster.clear_ops();
    let second = engine.run(&render(&["a"]), Some(&first.inventory), &opts(true)).await.unwrap();
    assert_eq!(second.pruned, vec![cm_ref("c"), cm_ref("b")]);
    assert_eq!(cluster.deletes_of(&cm_ref("b")), 1);
    assert_eq!(cluster.deletes_of(&cm_ref("c")), 1);
    assert!(!cluster.contains(&cm_ref("b")));
    assert_eq!(second.inventory.len(), 1);

    // Nothing left to prune on the next pass.
    cluster.clear_ops();
    let third = engine.run(&render(&["a"]), Some(&second.inventory), &opts(true)).await.unwrap();
    assert!(third.pruned.is_empty());
    assert!(cluster.ops().is_empty());
}

#[tokio::test]
async fn prune_disabled_keeps_stale_objects() {
    let cluster = MockCluster::new();
    let reg = TypeRegistry::with_builtins();
    let engine = ApplyEngine::new(&cluster, &reg);
    let first = engine.run(&render(&["a", "b"]), None, &opts(false)).await.unwrap();
    let second = engine.run(&render(&["a"]), Some(&first.inventory), &opts(false)).await.unwrap();
    assert!(second.pruned.is_empty());
    assert!(cluster.contains(&cm_ref("b")));
    assert_eq!(second.inventory.len(), 1);
}

#[tokio::test]
async fn partial_apply_failure_keeps_successful_subset() {
    let cluster = MockCluster::new();
    let reg = TypeRegistry::with_builtins();
    let engine = ApplyEngine::new(&cluster, &reg);
    cluster.fail_apply(&cm_ref("c"), ClusterError::Forbidden("configmaps \"c\" is forbidden".into()));

    let report = engine.run(&render(&["a", "b", "c"]), None, &opts(true)).await.unwrap();
    let refs = report.inventory.refs().unwrap();
    assert_eq!(refs, vec![cm_ref("a"), cm_ref("b")]);
    let (reason, msg) = report.outcome().unwrap_err();
    assert_eq!(reason, Reason::ApplyFailed);
    assert!(msg.contains("ConfigMap/apps/c"), "{}", msg);
}

#[tokio::test]
async fn prune_skips_annotated_and_foreign_objects() {
    let cluster = MockCluster::new();
    let reg = TypeRegistry::with_builtins();
    let engine = ApplyEngine::new(&cluster, &reg);
    let first = engine.run(&render(&["a", "keep", "foreign"]), None, &opts(true)).await.unwrap();

    let mut keep = cluster.object(&cm_ref("keep")).unwrap();
    keep["metadata"]["annotations"] = json!({ PRUNE_ANNOTATION: "disabled" });
    cluster.insert(keep);
    let mut foreign = cluster.object(&cm_ref("foreign")).unwrap();
    foreign["metadata"]["labels"][NAME_LABEL] = json!("other");
    cluster.insert(foreign);

    let second = engine.run(&render(&["a"]), Some(&first.inventory), &opts(true)).await.unwrap();
    assert!(second.pruned.is_empty());
    assert!(second.prune_errors.is_empty());
    assert!(cluster.contains(&cm_ref("keep")));
    assert!(cluster.contains(&cm_ref("foreign")));
}

#[tokio::test]
async fn prune_errors_surface_as_prune_failed() {
    let cluster = MockCluster::new();
    let reg = TypeRegistry::with_builtins();
    let engine = ApplyEngine::new(&cluster, &reg);
    let first = engine.run(&render(&["a", "b"]), None, &opts(true)).await.unwrap();
    cluster.fail_delete(&cm_ref("b"), ClusterError::Conflict("finalizer pending".into()));
    let second = engine.run(&render(&["a"]), Some(&first.inventory), &opts(true)).await.unwrap();
    assert_eq!(second.outcome().unwrap_err().0, Reason::PruneFailed);
}

#[tokio::test]
async fn failed_prunes_stay_in_inventory_until_deleted() {
    let cluster = MockCluster::new();
    let reg = TypeRegistry::with_builtins();
    let engine = ApplyEngine::new(&cluster, &reg);
    let first = engine.run(&render(&["a", "b"]), None, &opts(true)).await.unwrap();
    cluster.fail_delete(&cm_ref("b"), ClusterError::Conflict("finalizer pending".into()));
    let second = engine.run(&render(&["a"]), Some(&first.inventory), &opts(true)).await.unwrap();
    assert_eq!(second.inventory.refs().unwrap(), vec![cm_ref("a"), cm_ref("b")]);

    cluster.clear_failures();
    let third = engine.run(&render(&["a"]), Some(&second.inventory), &opts(true)).await.unwrap();
    assert!(third.outcome().is_ok());
    assert_eq!(third.pruned, vec![cm_ref("b")]);
    assert!(!cluster.contains(&cm_ref("b")));
    assert_eq!(third.inventory.refs().unwrap(), vec![cm_ref("a")]);
}

#[tokio::test]
async fn fields_dropped_from_the_render_are_removed_live() {
    let cluster = MockCluster::new();
    let reg = TypeRegistry::with_builtins();
    let engine = ApplyEngine::new(&cluster, &reg);
    let full = b"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\ndata:\n  keep: x\n  drop: y\n";
    let trimmed = b"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\ndata:\n  keep: x\n";

    let first = engine.run(full, None, &opts(true)).await.unwrap();
    let second = engine.run(trimmed, Some(&first.inventory), &opts(true)).await.unwrap();
    assert_eq!(second.changes, vec![(cm_ref("a"), Change::Configured)]);
    let live = cluster.object(&cm_ref("a")).unwrap();
    assert_eq!(live["data"], json!({ "keep": "x" }));

    cluster.clear_ops();
    let third = engine.run(trimmed, Some(&second.inventory), &opts(true)).await.unwrap();
    assert_eq!(third.changes, vec![(cm_ref("a"), Change::Unchanged)]);
    assert!(cluster.ops().is_empty());
}

#[tokio::test]
async fn live_objects_without_our_checksum_are_reapplied() {
    let cluster = MockCluster::new();
    let reg = TypeRegistry::with_builtins();
    let engine = ApplyEngine::new(&cluster, &reg);
    cluster.insert(json!({
        "apiVersion": "v1", "kind": "ConfigMap",
        "metadata": { "name": "a", "namespace": "apps", "labels": { NAME_LABEL: "web", NAMESPACE_LABEL: "flux" } },
        "data": { "k": "v", "extra": "left over" }
    }));
    let report = engine.run(&render(&["a"]), None, &opts(false)).await.unwrap();
    assert_eq!(report.changes, vec![(cm_ref("a"), Change::Configured)]);
    assert!(cluster.object(&cm_ref("a")).unwrap()["data"].get("extra").is_none());
}

#[tokio::test]
async fn immutable_change_recreates_only_with_force() {
    let cluster = MockCluster::new();
    let reg = TypeRegistry::with_builtins();
    let engine = ApplyEngine::new(&cluster, &reg);
    engine.run(&render(&["a"]), None, &opts(false)).await.unwrap();
    cluster.make_immutable(&cm_ref("a"));

    let changed = b"apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\ndata:\n  k: changed\n";
    let report = engine.run(changed, None, &opts(false)).await.unwrap();
    assert_eq!(report.outcome().unwrap_err().0, Reason::ApplyFailed);
    assert!(report.inventory.is_empty());

    // The mock refuses updates of existing objects; delete-then-create goes through.
    let mut forced = opts(false);
    forced.force = true;
    cluster.clear_ops();
    let report = engine.run(changed, None, &forced).await.unwrap();
    assert_eq!(report.changes, vec![(cm_ref("a"), Change::Recreated)]);
    assert_eq!(
        cluster.ops(),
        vec![MockOp::Delete(cm_ref("a")), MockOp::Apply(cm_ref("a"))]
    );
    assert_eq!(cluster.object(&cm_ref("a")).unwrap()["data"]["k"], "changed");
}

#[tokio::test]
async fn label_listing_finds_stale_objects_without_inventory() {
    let cluster = MockCluster::new();
    let reg = TypeRegistry::with_builtins();
    let engine = ApplyEngine::new(&cluster, &reg);
    engine.run(&render(&["a", "orphan"]), None, &opts(false)).await.unwrap();

    let report = engine.run(&render(&["a"]), None, &opts(true)).await.unwrap();
    assert_eq!(report.pruned, vec![cm_ref("orphan")]);
}

#[tokio::test]
async fn cluster_scoped_objects_lose_namespace_and_crds_register() {
    let cluster = MockCluster::new();
    let reg = TypeRegistry::with_builtins();
    let engine = ApplyEngine::new(&cluster, &reg);
    let manifests = br#"
apiVersion: example.com/v1
kind: Widget
metadata:
  name: w
---
apiVersion: v1
kind: Namespace
metadata:
  name: apps
  namespace: bogus
---
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: widgets.example.com
spec:
  group: example.com
  scope: Namespaced
  names: { kind: Widget, plural: widgets }
  versions: [ { name: v1, served: true, storage: true } ]
"#;
    let report = engine.run(manifests, None, &opts(true)).await.unwrap();
    assert!(report.outcome().is_ok(), "{:?}", report.outcome());
    let kinds: Vec<_> = report.changes.iter().map(|(r, _)| r.kind.as_str()).collect();
    assert_eq!(kinds, vec!["Namespace", "CustomResourceDefinition", "Widget"]);
    assert!(cluster.contains(&ObjectRef::new("v1", "Namespace", "", "apps")));
    assert_eq!(reg.is_namespaced("example.com", "Widget"), Some(true));
    // Registered before the Widget was prepared, so it got the default namespace.
    assert!(cluster.contains(&ObjectRef::new("example.com/v1", "Widget", "apps", "w")));
}

#[tokio::test]
async fn malformed_inventory_aborts_before_any_apply() {
    let cluster = MockCluster::new();
    let reg = TypeRegistry::with_builtins();
    let engine = ApplyEngine::new(&cluster, &reg);
    let bad = Inventory { entries: vec![InventoryEntry { id: "nonsense".into(), v: "v1".into() }] };
    let err = engine.run(&render(&["a"]), Some(&bad), &opts(true)).await.unwrap_err();
    assert!(matches!(err, ApplyError::Inventory(_)));
    assert_eq!(err.reason(), Reason::ApplyFailed);
    assert!(cluster.ops().is_empty());
}

#[tokio::test]
async fn expired_deadline_aborts_the_attempt() {
    let cluster = MockCluster::new();
    let reg = TypeRegistry::with_builtins();
    let engine = ApplyEngine::new(&cluster, &reg);
    let mut o = opts(true);
    o.deadline = Instant::now();
    let err = engine.run(&render(&["a"]), None, &o).await.unwrap_err();
    assert_eq!(err, ApplyError::Timeout { applied: 0, total: 1 });
}

#[tokio::test]
async fn teardown_prunes_whole_inventory() {
    let cluster = MockCluster::new();
    let reg = TypeRegistry::with_builtins();
    let engine = ApplyEngine::new(&cluster, &reg);
    let first = engine.run(&render(&["a", "b"]), None, &opts(true)).await.unwrap();
    let report = engine.teardown(&first.inventory, &opts(true)).await.unwrap();
    assert_eq!(report.pruned, vec![cm_ref("b"), cm_ref("a")]);
    assert!(cluster.is_empty());
}

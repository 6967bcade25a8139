use std::sync::Arc;
use std::time::Duration;

use converge_core::mock::MockCluster;
use converge_core::types::NamespacedObjectKindReference;
use converge_core::{Kustomization, KustomizationSpec, ObjectRef};
use converge_health::{health_targets, HealthAssessor, ReadinessTable};
use serde_json::json;
use tokio::time::Instant;

fn deploy(name: &str, ready: bool) -> serde_json::Value {
    let available = if ready { 1 } else { 0 };
    json!({
        "apiVersion": "apps/v1", "kind": "Deployment",
        "metadata": { "name": name, "namespace": "apps", "generation": 1 },
        "spec": { "replicas": 1 },
        "status": { "observedGeneration": 1, "replicas": 1, "updatedReplicas": 1, "availableReplicas": available }
    })
}

fn dref(name: &str) -> ObjectRef {
    ObjectRef::new("apps/v1", "Deployment", "apps", name)
}

#[tokio::test]
async fn all_ready_on_first_poll() {
    let cluster = MockCluster::new();
    cluster.insert(deploy("a", true));
    cluster.insert(deploy("b", true));
    let table = ReadinessTable::with_builtins();
    let report = HealthAssessor::new(&cluster, &table)
        .assess(&[dref("a"), dref("b")], Instant::now() + Duration::from_secs(5))
        .await;
    assert!(report.healthy());
    assert_eq!(report.polls, 1);
}

#[tokio::test]
async fn times_out_naming_sorted_first_n() {
    let cluster = MockCluster::new();
    for name in ["d", "c", "b", "a"] {
        cluster.insert(deploy(name, false));
    }
    let table = ReadinessTable::with_builtins();
    let report = HealthAssessor::new(&cluster, &table)
        .poll_interval(Duration::from_millis(10))
        .max_reported(2)
        .assess(&[dref("d"), dref("c"), dref("b"), dref("a")], Instant::now() + Duration::from_millis(60))
        .await;
    assert!(!report.healthy());
    assert_eq!(report.total_not_ready, 4);
    let named: Vec<_> = report.not_ready.iter().map(|(id, _)| id.name.as_str()).collect();
    assert_eq!(named, vec!["a", "b"]);
    assert!(report.message().contains("and 2 more"), "{}", report.message());
}

#[tokio::test]
async fn becomes_ready_while_polling() {
    let cluster = Arc::new(MockCluster::new());
    cluster.insert(deploy("a", false));
    let table = ReadinessTable::with_builtins();

    let flip = {
        let cluster = cluster.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cluster.insert(deploy("a", true));
        })
    };
    let report = HealthAssessor::new(cluster.as_ref(), &table)
        .poll_interval(Duration::from_millis(10))
        .assess(&[dref("a")], Instant::now() + Duration::from_secs(5))
        .await;
    flip.await.unwrap();
    assert!(report.healthy());
    assert!(report.polls > 1);
}

#[tokio::test]
async fn missing_objects_are_not_ready() {
    let cluster = MockCluster::new();
    let table = ReadinessTable::with_builtins();
    let report = HealthAssessor::new(&cluster, &table)
        .poll_interval(Duration::from_millis(10))
        .assess(&[dref("ghost")], Instant::now() + Duration::from_millis(30))
        .await;
    assert_eq!(report.not_ready, vec![(dref("ghost"), "not found".to_string())]);
}

#[test]
fn wait_takes_precedence_over_health_checks() {
    let mut k = Kustomization::new(
        "apps",
        KustomizationSpec {
            interval: Duration::from_secs(60),
            health_checks: vec![NamespacedObjectKindReference {
                api_version: "apps/v1".into(),
                kind: "Deployment".into(),
                name: "web".into(),
                namespace: None,
            }],
            ..Default::default()
        },
    );
    k.metadata.namespace = Some("apps".into());
    let applied = vec![dref("a"), dref("b")];
    assert_eq!(health_targets(&k, &applied), vec![dref("web")]);
    k.spec.wait = true;
    assert_eq!(health_targets(&k, &applied), applied);
}

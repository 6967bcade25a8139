#![forbid(unsafe_code)]

use std::time::Duration;

use converge_core::{Kustomization, KustomizationSpec, KustomizationStatus, UnitKey};
use converge_store::{spawn_ingest, UnitBuilder, UnitEvent};

fn unit(name: &str, generation: i64) -> Kustomization {
    let mut k = Kustomization::new(name, KustomizationSpec::default());
    k.metadata.namespace = Some("flux".into());
    k.metadata.generation = Some(generation);
    k
}

#[test]
fn builder_replays_applies_and_deletes() {
    let mut b = UnitBuilder::new();
    b.apply(vec![UnitEvent::Applied(unit("a", 1)), UnitEvent::Applied(unit("b", 1))]);
    let first = b.freeze();
    assert_eq!(first.epoch, 1);
    assert_eq!(first.len(), 2);

    b.apply(vec![UnitEvent::Applied(unit("a", 2)), UnitEvent::Deleted(UnitKey::new("flux", "b"))]);
    let second = b.freeze();
    assert_eq!(second.epoch, 2);
    assert_eq!(second.len(), 1);
    assert_eq!(second.get(&UnitKey::new("flux", "a")).map(|k| k.generation()), Some(2));

    // Earlier snapshots are unaffected by later batches.
    assert_eq!(first.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn ingest_publishes_and_notifies() {
    let (tx, store) = spawn_ingest(64);
    let mut epochs = store.subscribe_epoch();
    tx.send(UnitEvent::Applied(unit("a", 1))).await.unwrap();
    tx.send(UnitEvent::Applied(unit("a", 3))).await.unwrap();
    tokio::time::timeout(Duration::from_secs(2), epochs.changed()).await.unwrap().unwrap();

    drop(tx);
    tokio::time::sleep(Duration::from_millis(30)).await;
    let snap = store.current();
    assert!(snap.epoch >= 1);
    assert_eq!(snap.get(&UnitKey::new("flux", "a")).map(|k| k.generation()), Some(3));
}

#[test]
fn relist_drops_units_missing_from_it() {
    let mut b = UnitBuilder::new();
    b.apply(vec![UnitEvent::Applied(unit("a", 1)), UnitEvent::Applied(unit("gone", 1))]);
    b.apply(vec![UnitEvent::Replaced(vec![unit("a", 2), unit("new", 1)])]);
    let snap = b.freeze();
    assert_eq!(snap.len(), 2);
    assert!(snap.get(&UnitKey::new("flux", "gone")).is_none());
    assert_eq!(snap.get(&UnitKey::new("flux", "a")).map(|k| k.generation()), Some(2));
    assert!(snap.get(&UnitKey::new("flux", "new")).is_some());
}

#[test]
fn status_feedback_keeps_newer_spec() {
    let mut b = UnitBuilder::new();
    b.apply(vec![UnitEvent::Applied(unit("a", 3))]);

    // Status computed while reconciling generation 2 lands after the watch saw 3.
    let mut status = KustomizationStatus::default();
    status.observed_generation = 2;
    status.last_applied_revision = "main@sha1:abc".into();
    b.apply(vec![UnitEvent::Status(UnitKey::new("flux", "a"), status)]);

    // Feedback for a unit that is already gone is ignored.
    b.apply(vec![UnitEvent::Status(UnitKey::new("flux", "missing"), KustomizationStatus::default())]);

    let snap = b.freeze();
    assert_eq!(snap.len(), 1);
    let a = snap.get(&UnitKey::new("flux", "a")).unwrap();
    assert_eq!(a.generation(), 3);
    let st = a.status.as_ref().unwrap();
    assert_eq!(st.observed_generation, 2);
    assert_eq!(st.last_applied_revision, "main@sha1:abc");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn burst_larger_than_capacity_all_lands() {
    let (tx, store) = spawn_ingest(4);
    for i in 0..50 {
        tx.send(UnitEvent::Applied(unit(&format!("u{}", i), 1))).await.unwrap();
    }
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while store.current().len() < 50 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let snap = store.current();
    assert_eq!(snap.len(), 50);
    assert!(snap.get(&UnitKey::new("flux", "u0")).is_some());
    assert!(snap.get(&UnitKey::new("flux", "u49")).is_some());
}

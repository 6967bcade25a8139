//! converge store: the in-RAM view of every unit, rebuilt from coalesced watch
//! events and published as immutable epoch-numbered snapshots.

#![forbid(unsafe_code)]

use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use converge_core::{Kustomization, KustomizationStatus, UnitKey};
use metrics::histogram;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub enum UnitEvent {
    Applied(Kustomization),
    Deleted(UnitKey),
    /// Status written by the controller itself. Merged into the stored unit so
    /// spec and metadata stay as the watch last reported them.
    Status(UnitKey, KustomizationStatus),
    /// Full relist: units missing from the list are gone.
    Replaced(Vec<Kustomization>),
}

impl UnitEvent {
    /// The unit this event is about; `None` for a relist.
    pub fn key(&self) -> Option<UnitKey> {
        match self {
            UnitEvent::Applied(k) => Some(k.key()),
            UnitEvent::Deleted(key) | UnitEvent::Status(key, _) => Some(key.clone()),
            UnitEvent::Replaced(_) => None,
        }
    }
}

/// Every known unit at one point in time. Readers hold an `Arc` and never see
/// a half-applied batch.
#[derive(Debug, Clone, Default)]
pub struct UnitSnapshot {
    pub epoch: u64,
    pub units: BTreeMap<UnitKey, Arc<Kustomization>>,
}

impl UnitSnapshot {
    pub fn from_units(epoch: u64, units: impl IntoIterator<Item = Kustomization>) -> Self {
        let units = units.into_iter().map(|k| (k.key(), Arc::new(k))).collect();
        Self { epoch, units }
    }

    pub fn get(&self, key: &UnitKey) -> Option<&Arc<Kustomization>> {
        self.units.get(key)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

/// Coalescing queue keyed by unit with FIFO order. A newer event for a queued
/// unit replaces the older one in place; nothing is ever evicted. Once `cap`
/// distinct units are queued the batch should be flushed.
pub struct Coalescer {
    reset: Option<Vec<Kustomization>>,
    map: FxHashMap<UnitKey, UnitEvent>,
    order: VecDeque<UnitKey>,
    cap: usize,
}

impl Coalescer {
    pub fn with_capacity(cap: usize) -> Self {
        Self { reset: None, map: FxHashMap::default(), order: VecDeque::new(), cap: cap.max(1) }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty() && self.reset.is_none()
    }

    pub fn is_full(&self) -> bool {
        self.map.len() >= self.cap
    }

    pub fn push(&mut self, ev: UnitEvent) {
        let Some(key) = ev.key() else {
            if let UnitEvent::Replaced(list) = ev {
                self.map.clear();
                self.order.clear();
                self.reset = Some(list);
            }
            return;
        };
        let ev = match (self.map.remove(&key), ev) {
            (Some(UnitEvent::Applied(mut k)), UnitEvent::Status(_, status)) => {
                k.status = Some(status);
                UnitEvent::Applied(k)
            }
            (Some(deleted @ UnitEvent::Deleted(_)), UnitEvent::Status(..)) => deleted,
            (prev, ev) => {
                if prev.is_none() {
                    self.order.push_back(key.clone());
                }
                ev
            }
        };
        self.map.insert(key, ev);
    }

    /// A pending relist first, then per-unit events in arrival order.
    pub fn drain_ready(&mut self) -> Vec<UnitEvent> {
        let mut out = Vec::with_capacity(self.order.len() + 1);
        if let Some(list) = self.reset.take() {
            out.push(UnitEvent::Replaced(list));
        }
        while let Some(key) = self.order.pop_front() {
            if let Some(ev) = self.map.remove(&key) {
                out.push(ev);
            }
        }
        out
    }
}

/// Folds event batches into the next snapshot.
#[derive(Default)]
pub struct UnitBuilder {
    epoch: u64,
    units: BTreeMap<UnitKey, Arc<Kustomization>>,
}

impl UnitBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, batch: Vec<UnitEvent>) {
        for ev in batch {
            match ev {
                UnitEvent::Applied(k) => {
                    self.units.insert(k.key(), Arc::new(k));
                }
                UnitEvent::Deleted(key) => {
                    self.units.remove(&key);
                }
                UnitEvent::Status(key, status) => {
                    if let Some(current) = self.units.get_mut(&key) {
                        Arc::make_mut(current).status = Some(status);
                    }
                }
                UnitEvent::Replaced(list) => {
                    self.units = list.into_iter().map(|k| (k.key(), Arc::new(k))).collect();
                }
            }
        }
        self.epoch = self.epoch.saturating_add(1);
    }

    pub fn freeze(&self) -> Arc<UnitSnapshot> {
        Arc::new(UnitSnapshot { epoch: self.epoch, units: self.units.clone() })
    }
}

/// Read side of the store: the current snapshot plus epoch notifications.
#[derive(Clone)]
pub struct StoreHandle {
    snap: Arc<ArcSwap<UnitSnapshot>>,
    epoch_rx: watch::Receiver<u64>,
}

impl StoreHandle {
    pub fn current(&self) -> Arc<UnitSnapshot> {
        self.snap.load_full()
    }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch_rx.clone()
    }
}

const FLUSH_EVERY: Duration = Duration::from_millis(8);

/// Spawn the ingest loop. Events sent on the returned channel show up in the
/// handle's snapshot within one flush tick; closing the channel flushes and stops.
pub fn spawn_ingest(cap: usize) -> (mpsc::Sender<UnitEvent>, StoreHandle) {
    let (tx, mut rx) = mpsc::channel::<UnitEvent>(cap);
    let snap = Arc::new(ArcSwap::from_pointee(UnitSnapshot::default()));
    let (epoch_tx, epoch_rx) = watch::channel(0u64);
    let publish_to = Arc::clone(&snap);

    tokio::spawn(async move {
        let mut coalescer = Coalescer::with_capacity(cap);
        let mut builder = UnitBuilder::new();
        let mut ticker = tokio::time::interval(FLUSH_EVERY);
        let mut flush = |coalescer: &mut Coalescer| {
            let batch = coalescer.drain_ready();
            if batch.is_empty() {
                return;
            }
            debug!(events = batch.len(), "applying unit batch");
            histogram!("store_batch_events", batch.len() as f64);
            builder.apply(batch);
            let next = builder.freeze();
            let epoch = next.epoch;
            publish_to.store(next);
            let _ = epoch_tx.send(epoch);
        };
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(ev) => {
                        coalescer.push(ev);
                        if coalescer.is_full() {
                            flush(&mut coalescer);
                        }
                    }
                    None => {
                        flush(&mut coalescer);
                        break;
                    }
                },
                _ = ticker.tick() => flush(&mut coalescer),
            }
        }
        info!("unit ingest loop stopped");
    });

    (tx, StoreHandle { snap, epoch_rx })
}

#[cfg(test)]
mod tests {
    use super::*;
    use converge_core::KustomizationSpec;

    fn unit(name: &str, generation: i64) -> Kustomization {
        let mut k = Kustomization::new(name, KustomizationSpec::default());
        k.metadata.namespace = Some("flux".into());
        k.metadata.generation = Some(generation);
        k
    }

    #[test]
    fn coalescer_keeps_latest_event_per_unit() {
        let mut c = Coalescer::with_capacity(8);
        c.push(UnitEvent::Applied(unit("a", 1)));
        c.push(UnitEvent::Applied(unit("b", 1)));
        c.push(UnitEvent::Applied(unit("a", 2)));
        let out = c.drain_ready();
        assert_eq!(out.len(), 2);
        match &out[0] {
            UnitEvent::Applied(k) => assert_eq!((k.key().name.as_str(), k.generation()), ("a", 2)),
            other => panic!("unexpected {:?}", other),
        }
        assert!(c.is_empty());
    }

    fn names(events: &[UnitEvent]) -> Vec<String> {
        events.iter().filter_map(|e| e.key()).map(|k| k.name).collect()
    }

    #[test]
    fn coalescer_never_evicts_past_capacity() {
        let mut c = Coalescer::with_capacity(2);
        c.push(UnitEvent::Applied(unit("a", 1)));
        c.push(UnitEvent::Applied(unit("b", 1)));
        assert!(c.is_full());
        c.push(UnitEvent::Applied(unit("c", 1)));
        assert_eq!(names(&c.drain_ready()), vec!["a", "b", "c"]);
    }

    #[test]
    fn status_merges_into_queued_spec_without_reverting_it() {
        let mut c = Coalescer::with_capacity(8);
        c.push(UnitEvent::Applied(unit("a", 3)));
        let mut status = KustomizationStatus::default();
        status.observed_generation = 2;
        c.push(UnitEvent::Status(UnitKey::new("flux", "a"), status));
        c.push(UnitEvent::Deleted(UnitKey::new("flux", "b")));
        c.push(UnitEvent::Status(UnitKey::new("flux", "b"), KustomizationStatus::default()));
        let out = c.drain_ready();
        match &out[0] {
            UnitEvent::Applied(k) => {
                assert_eq!(k.generation(), 3);
                assert_eq!(k.status.as_ref().map(|s| s.observed_generation), Some(2));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(out[1], UnitEvent::Deleted(_)));
    }

    #[test]
    fn relist_supersedes_queued_events() {
        let mut c = Coalescer::with_capacity(8);
        c.push(UnitEvent::Applied(unit("old", 1)));
        c.push(UnitEvent::Replaced(vec![unit("a", 1)]));
        c.push(UnitEvent::Applied(unit("b", 1)));
        let out = c.drain_ready();
        assert_eq!(out.len(), 2);
        assert!(matches!(&out[0], UnitEvent::Replaced(list) if list.len() == 1));
        assert_eq!(names(&out[1..]), vec!["b"]);
    }
}

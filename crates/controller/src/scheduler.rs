//! Per-unit reconcile loops driven by store snapshots.
//!
//! Each unit gets one task. It reconciles, then sleeps until its requeue time or
//! until woken by a spec change, a new reconcile request or deletion. Suspended
//! units park until such a wake.

use std::sync::Arc;

use converge_core::{Kustomization, UnitKey};
use converge_store::{StoreHandle, UnitEvent, UnitSnapshot};
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::reconciler::{Outcome, Reconciler};

/// What must change for a parked or sleeping unit to be woken early.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Trigger {
    generation: i64,
    request: Option<String>,
    deleting: bool,
}

impl Trigger {
    fn of(unit: &Kustomization) -> Self {
        Self {
            generation: unit.generation(),
            request: unit.reconcile_request().map(str::to_string),
            deleting: unit.is_being_deleted(),
        }
    }
}

struct Slot {
    trigger: Trigger,
    wake: Arc<Notify>,
    task: JoinHandle<()>,
}

pub struct Scheduler {
    reconciler: Arc<Reconciler>,
    store: StoreHandle,
    /// Written status is fed back so the next attempt and dependents see our own writes.
    feedback: Option<mpsc::Sender<UnitEvent>>,
    slots: FxHashMap<UnitKey, Slot>,
}

impl Scheduler {
    pub fn new(reconciler: Arc<Reconciler>, store: StoreHandle) -> Self {
        Self { reconciler, store, feedback: None, slots: FxHashMap::default() }
    }

    pub fn with_feedback(mut self, tx: mpsc::Sender<UnitEvent>) -> Self {
        self.feedback = Some(tx);
        self
    }

    /// Number of units with a running loop.
    pub fn active(&self) -> usize {
        self.slots.len()
    }

    /// Start, wake or stop unit loops to match `snap`.
    pub fn sync(&mut self, snap: &UnitSnapshot, shutdown: &watch::Receiver<bool>) {
        self.slots.retain(|key, slot| {
            let keep = snap.get(key).is_some();
            if !keep {
                debug!(unit = %key, "stopping unit loop");
                slot.task.abort();
            }
            keep
        });
        for (key, unit) in &snap.units {
            let trigger = Trigger::of(unit);
            match self.slots.get_mut(key) {
                Some(slot) => {
                    if slot.trigger != trigger {
                        debug!(unit = %key, "waking unit loop");
                        slot.trigger = trigger;
                        slot.wake.notify_one();
                    }
                }
                None => {
                    let wake = Arc::new(Notify::new());
                    let task = tokio::spawn(unit_loop(
                        key.clone(),
                        Arc::clone(&self.reconciler),
                        self.store.clone(),
                        Arc::clone(&wake),
                        self.feedback.clone(),
                        shutdown.clone(),
                    ));
                    self.slots.insert(key.clone(), Slot { trigger, wake, task });
                }
            }
        }
    }

    /// Follow store epochs until `shutdown` flips to true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut epochs = self.store.subscribe_epoch();
        info!("scheduler started");
        loop {
            let snap = self.store.current();
            self.sync(&snap, &shutdown);
            tokio::select! {
                changed = epochs.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        for (_, slot) in self.slots.drain() {
            slot.task.abort();
        }
        info!("scheduler stopped");
    }
}

async fn unit_loop(
    key: UnitKey,
    reconciler: Arc<Reconciler>,
    store: StoreHandle,
    wake: Arc<Notify>,
    feedback: Option<mpsc::Sender<UnitEvent>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let snap = store.current();
        let Some(unit) = snap.get(&key).cloned() else { break };
        let result = reconciler.reconcile(&unit, &snap).await;
        debug!(unit = %key, outcome = result.outcome.as_str(), requeue = ?result.requeue_after, "attempt finished");
        // Only status flows back; spec and metadata come from the watch alone.
        if let (Some(tx), Some(updated)) = (&feedback, result.updated) {
            let updated_key = updated.key();
            if let Some(status) = updated.status {
                let _ = tx.send(UnitEvent::Status(updated_key, status)).await;
            }
        }
        if result.outcome == Outcome::Finalized {
            break;
        }
        let requeue = result.requeue_after;
        let sleep = async move {
            match requeue {
                Some(d) => tokio::time::sleep(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = sleep => {}
            _ = wake.notified() => {}
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!(unit = %key, "unit loop exited");
}

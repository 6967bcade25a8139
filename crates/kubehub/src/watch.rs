//! List+watch of units feeding the store's ingest channel.

use anyhow::Result;
use converge_core::Kustomization;
use converge_store::UnitEvent;
use futures::TryStreamExt;
use kube::api::Api;
use kube::runtime::watcher::{self, Event};
use kube::Client;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

fn trimmed(mut k: Kustomization) -> Kustomization {
    k.metadata.managed_fields = None;
    k
}

/// Runs until the watch stream ends or the receiver is dropped.
pub async fn watch_units(client: Client, namespace: Option<&str>, tx: mpsc::Sender<UnitEvent>) -> Result<()> {
    let api: Api<Kustomization> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let stream = watcher::watcher(api, watcher::Config::default());
    futures::pin_mut!(stream);
    info!(ns = ?namespace, "unit watcher started");
    while let Some(ev) = stream.try_next().await? {
        let events: Vec<UnitEvent> = match ev {
            Event::Applied(k) => vec![UnitEvent::Applied(trimmed(k))],
            Event::Deleted(k) => vec![UnitEvent::Deleted(k.key())],
            Event::Restarted(list) => {
                debug!(count = list.len(), "watch restart");
                vec![UnitEvent::Replaced(list.into_iter().map(trimmed).collect())]
            }
        };
        for e in events {
            if tx.send(e).await.is_err() {
                info!("store closed; stopping unit watcher");
                return Ok(());
            }
        }
    }
    warn!("unit watch stream ended");
    Ok(())
}

//! Typed list+watch per resource kind, published into a [`WatchHub`].
//!
//! kube's watcher reports `Applied` for both creations and modifications and
//! a full relist on restart. The [`Tracker`] keeps the last object per UID so
//! the hub still sees `Added`, `Updated{old,new}` and `Deleted`, including
//! deletions that happened while the watch was down.

use std::collections::BTreeSet;
use std::fmt::Debug;

use anyhow::{Context, Result};
use futures::TryStreamExt;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::NamespaceResourceScope;
use kdelegate_core::{parse_uid, ResourceKind, Uid, WatchEvent};
use kdelegate_trigger::WatchHub;
use kube::api::{Api, ListParams};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource};
use metrics::counter;
use rustc_hash::FxHashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Default)]
pub struct Tracker {
    known: FxHashMap<Uid, serde_json::Value>,
}

impl Tracker {
    pub fn len(&self) -> usize { self.known.len() }
    pub fn is_empty(&self) -> bool { self.known.is_empty() }

    pub fn applied(&mut self, uid: Uid, obj: serde_json::Value) -> WatchEvent {
        match self.known.insert(uid, obj.clone()) {
            Some(old) => WatchEvent::Updated { old, new: obj },
            None => WatchEvent::Added(obj),
        }
    }

    pub fn deleted(&mut self, uid: Uid, obj: serde_json::Value) -> WatchEvent {
        self.known.remove(&uid);
        WatchEvent::Deleted(obj)
    }

    /// Relist: apply every listed object, then delete what the list no longer has.
    pub fn restarted(&mut self, list: Vec<(Uid, serde_json::Value)>) -> Vec<WatchEvent> {
        let listed: rustc_hash::FxHashSet<Uid> = list.iter().map(|(u, _)| *u).collect();
        let gone: Vec<Uid> = self.known.keys().filter(|u| !listed.contains(*u)).copied().collect();
        let mut out: Vec<WatchEvent> = list.into_iter().map(|(u, o)| self.applied(u, o)).collect();
        for uid in gone {
            if let Some(old) = self.known.remove(&uid) {
                out.push(WatchEvent::Deleted(old));
            }
        }
        out
    }
}

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
}

fn entry<K: Resource + Serialize>(kind: ResourceKind, obj: &K) -> Option<(Uid, serde_json::Value)> {
    let uid = match obj.meta().uid.as_deref().map(parse_uid) {
        Some(Ok(u)) => u,
        Some(Err(e)) => {
            warn!(kind = kind.as_str(), error = %e, "skipping object with malformed uid");
            return None;
        }
        None => {
            warn!(kind = kind.as_str(), name = ?obj.meta().name, "skipping object without uid");
            return None;
        }
    };
    match serde_json::to_value(obj) {
        Ok(mut raw) => {
            strip_managed_fields(&mut raw);
            Some((uid, raw))
        }
        Err(e) => {
            warn!(kind = kind.as_str(), error = %e, "skipping unserializable object");
            None
        }
    }
}

async fn watch_typed<K>(api: Api<K>, kind: ResourceKind, hub: WatchHub) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Serialize + Debug + Send + Sync + 'static,
{
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    let mut tracker = Tracker::default();
    info!(kind = kind.as_str(), "watcher started");
    loop {
        let ev = match stream.try_next().await {
            Ok(Some(ev)) => ev,
            Ok(None) => break,
            Err(e) => {
                counter!("watch_error_total", 1u64);
                warn!(kind = kind.as_str(), error = %e, "watch error; retrying");
                continue;
            }
        };
        let events = match ev {
            Event::Applied(o) => entry(kind, &o).map(|(u, v)| tracker.applied(u, v)).into_iter().collect(),
            Event::Deleted(o) => entry(kind, &o).map(|(u, v)| tracker.deleted(u, v)).into_iter().collect(),
            Event::Restarted(list) => {
                debug!(kind = kind.as_str(), count = list.len(), "watch restart");
                tracker.restarted(list.iter().filter_map(|o| entry(kind, o)).collect())
            }
        };
        for ev in events {
            counter!("watch_events_total", 1u64);
            hub.publish(kind, ev);
        }
    }
    warn!(kind = kind.as_str(), "watcher stream ended");
    Ok(())
}

fn api_for<K>(client: Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = NamespaceResourceScope>,
    <K as Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    }
}

/// Watch one kind until the stream ends, publishing into `hub`.
pub async fn start_watcher(client: Client, kind: ResourceKind, namespace: Option<&str>, hub: WatchHub) -> Result<()> {
    match kind {
        ResourceKind::Pod => watch_typed(api_for::<Pod>(client, namespace), kind, hub).await,
        ResourceKind::Deployment => watch_typed(api_for::<Deployment>(client, namespace), kind, hub).await,
        ResourceKind::ReplicaSet => watch_typed(api_for::<ReplicaSet>(client, namespace), kind, hub).await,
        ResourceKind::StatefulSet => watch_typed(api_for::<StatefulSet>(client, namespace), kind, hub).await,
        ResourceKind::DaemonSet => watch_typed(api_for::<DaemonSet>(client, namespace), kind, hub).await,
        ResourceKind::Service => watch_typed(api_for::<Service>(client, namespace), kind, hub).await,
        ResourceKind::Job => watch_typed(api_for::<Job>(client, namespace), kind, hub).await,
    }
}

/// One task per kind.
pub fn start_watchers(
    client: Client,
    kinds: &BTreeSet<ResourceKind>,
    namespace: Option<String>,
    hub: WatchHub,
) -> Vec<JoinHandle<()>> {
    kinds
        .iter()
        .map(|&kind| {
            let (client, namespace, hub) = (client.clone(), namespace.clone(), hub.clone());
            tokio::spawn(async move {
                if let Err(e) = start_watcher(client, kind, namespace.as_deref(), hub).await {
                    warn!(kind = kind.as_str(), error = %e, "watcher failed");
                }
            })
        })
        .collect()
}

async fn can_list<K>(client: Client, namespace: Option<&str>) -> Result<()>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    api_for::<K>(client, namespace).list(&ListParams::default().limit(1)).await?;
    Ok(())
}

/// Check that every kind can be listed before any trigger waits on it.
pub async fn preflight(client: Client, kinds: &BTreeSet<ResourceKind>, namespace: Option<&str>) -> Result<()> {
    for &kind in kinds {
        let res = match kind {
            ResourceKind::Pod => can_list::<Pod>(client.clone(), namespace).await,
            ResourceKind::Deployment => can_list::<Deployment>(client.clone(), namespace).await,
            ResourceKind::ReplicaSet => can_list::<ReplicaSet>(client.clone(), namespace).await,
            ResourceKind::StatefulSet => can_list::<StatefulSet>(client.clone(), namespace).await,
            ResourceKind::DaemonSet => can_list::<DaemonSet>(client.clone(), namespace).await,
            ResourceKind::Service => can_list::<Service>(client.clone(), namespace).await,
            ResourceKind::Job => can_list::<Job>(client.clone(), namespace).await,
        };
        res.with_context(|| format!("cannot list {} (check RBAC for the watch)", kind.gvk_key()))?;
        debug!(kind = kind.as_str(), "list access verified");
    }
    Ok(())
}

//! Per-kind fan-out of watch notifications. The watch layer publishes,
//! each activated trigger holds its own receiver.
//!
//! The hub also keeps the current objects of every kind by UID. A new
//! subscriber first receives them as `Added`, then live notifications, so
//! objects that existed before a trigger activated are still counted.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use kdelegate_core::{parse_uid, ResourceKind, Uid, WatchEvent};
use rustc_hash::FxHashMap;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};

struct Channel {
    tx: broadcast::Sender<Arc<WatchEvent>>,
    current: FxHashMap<Uid, serde_json::Value>,
}

impl Channel {
    fn track(&mut self, event: &WatchEvent) {
        let Some(uid) = object_uid(event.object()) else { return };
        match event {
            WatchEvent::Added(o) | WatchEvent::Updated { new: o, .. } => {
                self.current.insert(uid, o.clone());
            }
            WatchEvent::Deleted(_) => {
                self.current.remove(&uid);
            }
        }
    }
}

fn object_uid(obj: &serde_json::Value) -> Option<Uid> {
    obj.get("metadata")?.get("uid")?.as_str().and_then(|s| parse_uid(s).ok())
}

/// Replay of the objects present at subscription, followed by live events.
pub struct WatchReceiver {
    replay: VecDeque<Arc<WatchEvent>>,
    rx: broadcast::Receiver<Arc<WatchEvent>>,
}

impl WatchReceiver {
    pub async fn recv(&mut self) -> Result<Arc<WatchEvent>, RecvError> {
        if let Some(ev) = self.replay.pop_front() {
            return Ok(ev);
        }
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Arc<WatchEvent>, TryRecvError> {
        if let Some(ev) = self.replay.pop_front() {
            return Ok(ev);
        }
        self.rx.try_recv()
    }
}

#[derive(Clone)]
pub struct WatchHub {
    map: Arc<Mutex<FxHashMap<ResourceKind, Channel>>>,
    capacity: usize,
}

impl Default for WatchHub {
    fn default() -> Self { Self::new(2048) }
}

impl WatchHub {
    pub fn new(capacity: usize) -> Self {
        Self { map: Arc::new(Mutex::new(FxHashMap::default())), capacity: capacity.max(1) }
    }

    fn with_channel<R>(&self, kind: ResourceKind, f: impl FnOnce(&mut Channel) -> R) -> R {
        let mut map = self.map.lock().unwrap_or_else(|p| p.into_inner());
        let ch = map
            .entry(kind)
            .or_insert_with(|| Channel { tx: broadcast::channel(self.capacity).0, current: FxHashMap::default() });
        f(ch)
    }

    /// Snapshot and receiver are taken under one lock, so no event is seen
    /// twice or missed between them.
    pub fn subscribe(&self, kind: ResourceKind) -> WatchReceiver {
        self.with_channel(kind, |ch| WatchReceiver {
            replay: ch.current.values().map(|o| Arc::new(WatchEvent::Added(o.clone()))).collect(),
            rx: ch.tx.subscribe(),
        })
    }

    /// Record `event` and deliver it to current subscribers of `kind`;
    /// returns how many received it.
    pub fn publish(&self, kind: ResourceKind, event: WatchEvent) -> usize {
        self.with_channel(kind, |ch| {
            ch.track(&event);
            ch.tx.send(Arc::new(event)).unwrap_or(0)
        })
    }

    pub fn subscriber_count(&self, kind: ResourceKind) -> usize {
        let map = self.map.lock().unwrap_or_else(|p| p.into_inner());
        map.get(&kind).map(|ch| ch.tx.receiver_count()).unwrap_or(0)
    }

    /// Objects of `kind` currently known.
    pub fn object_count(&self, kind: ResourceKind) -> usize {
        let map = self.map.lock().unwrap_or_else(|p| p.into_inner());
        map.get(&kind).map(|ch| ch.current.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obj(name: &str, n: u8) -> serde_json::Value {
        serde_json::json!({ "metadata": { "name": name, "uid": format!("00000000-0000-0000-0000-{:012x}", n) } })
    }

    #[tokio::test]
    async fn publish_reaches_only_subscribers_of_that_kind() {
        let hub = WatchHub::new(16);
        let mut pods = hub.subscribe(ResourceKind::Pod);
        let mut jobs = hub.subscribe(ResourceKind::Job);
        assert_eq!(hub.publish(ResourceKind::Pod, WatchEvent::Added(serde_json::json!({"n": 1}))), 1);
        let ev = pods.recv().await.unwrap();
        assert_eq!(ev.object()["n"], 1);
        assert!(jobs.try_recv().is_err());
        assert_eq!(hub.subscriber_count(ResourceKind::Job), 1);
    }

    #[test]
    fn deletions_without_subscribers_leave_nothing_behind() {
        let hub = WatchHub::default();
        assert_eq!(hub.publish(ResourceKind::Service, WatchEvent::Added(obj("s", 1))), 0);
        assert_eq!(hub.publish(ResourceKind::Service, WatchEvent::Deleted(obj("s", 1))), 0);
        assert_eq!(hub.object_count(ResourceKind::Service), 0);
        let mut rx = hub.subscribe(ResourceKind::Service);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn late_subscribers_see_existing_objects_as_added() {
        let hub = WatchHub::new(16);
        hub.publish(ResourceKind::Pod, WatchEvent::Added(obj("web-1", 1)));
        hub.publish(ResourceKind::Pod, WatchEvent::Updated { old: obj("web-1", 1), new: obj("web-1b", 1) });
        hub.publish(ResourceKind::Pod, WatchEvent::Added(obj("web-2", 2)));
        hub.publish(ResourceKind::Pod, WatchEvent::Deleted(obj("web-2", 2)));
        assert_eq!(hub.object_count(ResourceKind::Pod), 1);

        let mut rx = hub.subscribe(ResourceKind::Pod);
        let first = rx.recv().await.unwrap();
        assert!(matches!(&*first, WatchEvent::Added(o) if o["metadata"]["name"] == "web-1b"));
        assert!(rx.try_recv().is_err());

        hub.publish(ResourceKind::Pod, WatchEvent::Added(obj("web-3", 3)));
        assert_eq!(rx.recv().await.unwrap().object()["metadata"]["name"], "web-3");
    }
}

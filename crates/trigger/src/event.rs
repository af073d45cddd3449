//! Generic event trigger: counts distinct objects of one resource kind whose
//! add, update or delete notifications match a name pattern.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use kdelegate_core::{EventMode, ResourceKind, TriggerKind, TriggerSpec, WatchEvent};
use metrics::counter;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{DedupTracker, ObjectAdapter, Trigger, TriggerCore, TriggerError, WatchHub, WatchReceiver, WildcardPattern};

pub struct EventTrigger {
    inner: Arc<EventInner>,
}

struct EventInner {
    core: TriggerCore,
    resource: ResourceKind,
    mode: EventMode,
    pattern: WildcardPattern,
    adapter: Arc<dyn ObjectAdapter>,
    dedup: Arc<DedupTracker>,
    hub: WatchHub,
    matches: AtomicU32,
}

impl EventTrigger {
    pub fn new(
        spec: TriggerSpec,
        adapter: Arc<dyn ObjectAdapter>,
        dedup: Arc<DedupTracker>,
        hub: WatchHub,
        cancel: CancellationToken,
    ) -> Result<Self, TriggerError> {
        let (resource, mode) = match spec.kind {
            TriggerKind::Event { resource, mode } => (resource, mode),
            TriggerKind::Time => return Err(TriggerError::KindMismatch { uid: spec.uid, kind: spec.kind }),
        };
        if spec.replicas < 1 {
            return Err(TriggerError::Replicas { uid: spec.uid, kind: spec.kind });
        }
        let pattern = WildcardPattern::compile(&spec.value)
            .map_err(|source| TriggerError::Pattern { uid: spec.uid, kind: spec.kind, source })?;
        Ok(Self {
            inner: Arc::new(EventInner {
                core: TriggerCore::new(spec, cancel),
                resource,
                mode,
                pattern,
                adapter,
                dedup,
                hub,
                matches: AtomicU32::new(0),
            }),
        })
    }

    pub fn resource(&self) -> ResourceKind { self.inner.resource }

    pub fn mode(&self) -> EventMode { self.inner.mode }

    /// Distinct matching objects observed so far.
    pub fn match_count(&self) -> u32 { self.inner.matches.load(Ordering::Acquire) }

    /// Apply one notification; returns true when it was counted.
    pub fn handle(&self, event: &WatchEvent) -> bool { self.inner.handle(event) }
}

impl EventInner {
    fn handle(&self, event: &WatchEvent) -> bool {
        let spec = &self.core.spec;
        let (name, uid) = match self.adapter.extract(event.object()) {
            Ok(v) => v,
            Err(e) => {
                counter!("trigger_decode_error_total", 1u64);
                warn!(uid = spec.uid, kind = %spec.kind, error = %e, "dropping undecodable notification");
                return false;
            }
        };
        if event.mode() != self.mode {
            return false;
        }
        if !self.pattern.matches(&name) {
            return false;
        }
        let first = match self.mode {
            EventMode::Add | EventMode::Update => self.dedup.mark_seen(uid),
            EventMode::Del => self.dedup.mark_deleted(uid),
        };
        if !first {
            debug!(uid = spec.uid, kind = %spec.kind, name = %name, "duplicate notification ignored");
            return false;
        }
        if self.core.completed() {
            return false;
        }
        let count = self.matches.fetch_add(1, Ordering::AcqRel) + 1;
        counter!("trigger_match_total", 1u64);
        debug!(uid = spec.uid, kind = %spec.kind, name = %name, count, replicas = spec.replicas, "notification matched");
        if count >= spec.replicas && self.core.complete() {
            counter!("trigger_completed_total", 1u64);
            info!(uid = spec.uid, kind = %spec.kind, value = %spec.value, count, "event trigger completed");
        }
        true
    }

    async fn run(self: Arc<Self>, mut rx: WatchReceiver) {
        let spec = &self.core.spec;
        loop {
            tokio::select! {
                _ = self.core.cancel.cancelled() => {
                    self.core.cancelled();
                    debug!(uid = spec.uid, kind = %spec.kind, "event trigger cancelled");
                    break;
                }
                msg = rx.recv() => match msg {
                    Ok(event) => { self.handle(&event); }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(uid = spec.uid, kind = %spec.kind, skipped, "watch subscriber lagged");
                    }
                    Err(RecvError::Closed) => {
                        warn!(uid = spec.uid, kind = %spec.kind, "watch stream closed");
                        break;
                    }
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Trigger for EventTrigger {
    fn spec(&self) -> &TriggerSpec { &self.inner.core.spec }

    fn activate(&self) {
        if !self.inner.core.begin_activation() {
            return;
        }
        // subscribe before returning: existing objects are replayed, later ones are live
        let rx = self.inner.hub.subscribe(self.inner.resource);
        debug!(uid = self.inner.core.spec.uid, kind = %self.inner.core.spec.kind, "event trigger activated");
        tokio::spawn(Arc::clone(&self.inner).run(rx));
    }

    fn completed(&self) -> bool { self.inner.core.completed() }

    async fn wait_on(&self) -> bool { self.inner.core.wait_on().await }

    fn delete(&self) { self.inner.core.delete() }
}

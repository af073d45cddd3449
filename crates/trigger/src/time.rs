//! Time trigger: no watch, just a one-shot timer armed at activation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kdelegate_core::{Clock, TriggerSpec};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::{parse_time_expression, Trigger, TriggerCore, TriggerError};

pub struct TimeTrigger {
    inner: Arc<TimeInner>,
}

struct TimeInner {
    core: TriggerCore,
    deadline: DateTime<Utc>,
    clock: Arc<dyn Clock>,
}

impl TimeTrigger {
    /// `base` anchors relative expressions (activation instant on resume,
    /// otherwise the corrected current time).
    pub fn new(
        spec: TriggerSpec,
        base: DateTime<Utc>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Result<Self, TriggerError> {
        let deadline = parse_time_expression(&spec.value, base)
            .map_err(|source| TriggerError::TimeExpr { uid: spec.uid, kind: spec.kind, source })?;
        Ok(Self { inner: Arc::new(TimeInner { core: TriggerCore::new(spec, cancel), deadline, clock }) })
    }

    pub fn deadline(&self) -> DateTime<Utc> { self.inner.deadline }
}

impl TimeInner {
    async fn run(self: Arc<Self>) {
        let spec = &self.core.spec;
        let remaining = (self.deadline - self.clock.now()).to_std().unwrap_or_default();
        debug!(uid = spec.uid, deadline = %self.deadline, remaining_ms = remaining.as_millis() as u64, "time trigger armed");
        tokio::select! {
            _ = self.core.cancel.cancelled() => {
                self.core.cancelled();
                debug!(uid = spec.uid, "time trigger cancelled");
            }
            _ = tokio::time::sleep(remaining) => {
                if self.core.complete() {
                    info!(uid = spec.uid, value = %spec.value, "time trigger fired");
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl Trigger for TimeTrigger {
    fn spec(&self) -> &TriggerSpec { &self.inner.core.spec }

    fn activate(&self) {
        if !self.inner.core.begin_activation() {
            return;
        }
        tokio::spawn(Arc::clone(&self.inner).run());
    }

    fn completed(&self) -> bool { self.inner.core.completed() }

    async fn wait_on(&self) -> bool { self.inner.core.wait_on().await }

    fn delete(&self) { self.inner.core.delete() }
}

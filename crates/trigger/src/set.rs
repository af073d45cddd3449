//! Trigger Set: concrete triggers for one phase of one delegation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kdelegate_core::{Clock, TriggerKind, TriggerSpec};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::{
    adapter_for, parse_time_expression, DedupTracker, EventTrigger, TimeTrigger, Trigger, TriggerError, WatchHub,
    WildcardPattern,
};

/// Everything a trigger needs from its delegation.
#[derive(Clone)]
pub struct BuildContext {
    pub hub: WatchHub,
    pub dedup: Arc<DedupTracker>,
    /// Delegation-level token; each trigger gets a child.
    pub cancel: CancellationToken,
    pub clock: Arc<dyn Clock>,
    /// Anchor for relative time expressions.
    pub base_time: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub struct TriggerSet {
    triggers: Vec<Arc<dyn Trigger>>,
}

impl TriggerSet {
    pub fn build(specs: &[TriggerSpec], ctx: &BuildContext) -> Result<Self, TriggerError> {
        let triggers = specs.iter().map(|s| build_one(s, ctx)).collect::<Result<Vec<_>, _>>()?;
        debug!(count = triggers.len(), "trigger set built");
        Ok(Self { triggers })
    }

    /// Reject what [`TriggerSet::build`] would reject, without creating triggers.
    pub fn validate(specs: &[TriggerSpec]) -> Result<(), TriggerError> {
        for spec in specs {
            match spec.kind {
                TriggerKind::Event { .. } => {
                    if spec.replicas < 1 {
                        return Err(TriggerError::Replicas { uid: spec.uid, kind: spec.kind });
                    }
                    WildcardPattern::compile(&spec.value)
                        .map_err(|source| TriggerError::Pattern { uid: spec.uid, kind: spec.kind, source })?;
                }
                TriggerKind::Time => {
                    parse_time_expression(&spec.value, Utc::now())
                        .map_err(|source| TriggerError::TimeExpr { uid: spec.uid, kind: spec.kind, source })?;
                }
            }
        }
        Ok(())
    }

    pub fn from_triggers(triggers: Vec<Arc<dyn Trigger>>) -> Self { Self { triggers } }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Trigger>> { self.triggers.iter() }
    pub fn len(&self) -> usize { self.triggers.len() }
    pub fn is_empty(&self) -> bool { self.triggers.is_empty() }

    pub fn all_completed(&self) -> bool { self.triggers.iter().all(|t| t.completed()) }

    pub fn delete_all(&self) {
        for t in &self.triggers {
            t.delete();
        }
    }
}

fn build_one(spec: &TriggerSpec, ctx: &BuildContext) -> Result<Arc<dyn Trigger>, TriggerError> {
    let cancel = ctx.cancel.child_token();
    Ok(match spec.kind {
        TriggerKind::Event { resource, .. } => Arc::new(EventTrigger::new(
            spec.clone(),
            adapter_for(resource),
            Arc::clone(&ctx.dedup),
            ctx.hub.clone(),
            cancel,
        )?),
        TriggerKind::Time => Arc::new(TimeTrigger::new(spec.clone(), ctx.base_time, Arc::clone(&ctx.clock), cancel)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use kdelegate_core::SystemClock;

    fn ctx() -> BuildContext {
        BuildContext {
            hub: WatchHub::new(16),
            dedup: Arc::new(DedupTracker::new()),
            cancel: CancellationToken::new(),
            clock: Arc::new(SystemClock),
            base_time: Utc::now(),
        }
    }

    fn spec(uid: u32, kind: &str, value: &str) -> TriggerSpec {
        TriggerSpec { uid, ..TriggerSpec::new(kind.parse().unwrap(), value, 1) }
    }

    #[test]
    fn builds_every_kind_in_order() {
        let specs = vec![spec(1, "AddPod", "web-*"), spec(2, "DelJob", "*"), spec(3, "Time", "1h"), spec(4, "UpdateDaemonSet", "agent")];
        let set = TriggerSet::build(&specs, &ctx()).unwrap();
        assert_eq!(set.iter().map(|t| t.uid()).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert!(!set.all_completed());
    }

    #[test]
    fn one_bad_trigger_fails_the_whole_set() {
        let specs = vec![spec(1, "AddPod", "web-*"), spec(2, "AddPod", "web_*")];
        assert!(matches!(TriggerSet::build(&specs, &ctx()), Err(TriggerError::Pattern { uid: 2, .. })));
        let specs = vec![spec(1, "Time", "soon")];
        assert!(matches!(TriggerSet::build(&specs, &ctx()), Err(TriggerError::TimeExpr { uid: 1, .. })));
    }

    #[test]
    fn validate_agrees_with_build() {
        let good = vec![spec(1, "AddPod", "web-*"), spec(2, "Time", "30m")];
        assert!(TriggerSet::validate(&good).is_ok());
        let bad = vec![spec(1, "Time", "1h"), spec(2, "DelPod", "web_*")];
        assert!(matches!(TriggerSet::validate(&bad), Err(TriggerError::Pattern { uid: 2, .. })));
        let zero = vec![TriggerSpec { replicas: 0, ..spec(3, "AddJob", "*") }];
        assert!(matches!(TriggerSet::validate(&zero), Err(TriggerError::Replicas { uid: 3, .. })));
        assert!(matches!(TriggerSet::validate(&[spec(4, "Time", "soon")]), Err(TriggerError::TimeExpr { uid: 4, .. })));
    }

    #[tokio::test]
    async fn delegation_cancel_fans_out() {
        let c = ctx();
        let specs = vec![spec(1, "AddPod", "*"), spec(2, "Time", "forever")];
        let set = TriggerSet::build(&specs, &c).unwrap();
        for t in set.iter() {
            t.activate();
        }
        c.cancel.cancel();
        for t in set.iter() {
            assert!(t.wait_on().await);
        }
    }

    #[test]
    fn empty_set_is_trivially_complete() {
        assert!(TriggerSet::build(&[], &ctx()).unwrap().all_completed());
    }
}

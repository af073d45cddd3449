//! Delegation coordinator: grant phase, bind, revoke phase, unbind.

use std::sync::Arc;

use kdelegate_core::clock::from_unix_secs;
use kdelegate_core::{Clock, DelegationSpec, DelegationStatus, Phase, PhaseStatus, TriggerSpec};
use kdelegate_persist::StatusStore;
use kdelegate_trigger::{BuildContext, DedupTracker, TriggerSet, WatchHub};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{ActivationProtocol, DelegationError, Outcome, RoleBinder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelegationOutcome {
    /// Granted, then revoked once the deletion triggers were satisfied.
    Completed,
    /// Closed before the grant; nothing was bound.
    ClosedBeforeGrant,
    /// Closed while granted; bindings were revoked before returning.
    ClosedAfterGrant,
}

pub struct Delegation {
    spec: DelegationSpec,
    hub: WatchHub,
    dedup: Arc<DedupTracker>,
    cancel: CancellationToken,
    clock: Arc<dyn Clock>,
    store: Arc<dyn StatusStore>,
    binder: Arc<dyn RoleBinder>,
}

impl Delegation {
    pub fn new(
        mut spec: DelegationSpec,
        hub: WatchHub,
        clock: Arc<dyn Clock>,
        store: Arc<dyn StatusStore>,
        binder: Arc<dyn RoleBinder>,
    ) -> Result<Self, DelegationError> {
        spec.normalize()?;
        TriggerSet::validate(&spec.event_triggers).map_err(|source| DelegationError::Trigger { phase: Phase::Grant, source })?;
        TriggerSet::validate(&spec.deletion_triggers)
            .map_err(|source| DelegationError::Trigger { phase: Phase::Revoke, source })?;
        Ok(Self {
            spec,
            hub,
            dedup: Arc::new(DedupTracker::new()),
            cancel: CancellationToken::new(),
            clock,
            store,
            binder,
        })
    }

    pub fn name(&self) -> &str { &self.spec.name }

    pub fn spec(&self) -> &DelegationSpec { &self.spec }

    /// Force-close every trigger of both phases; idempotent.
    pub fn delete(&self) {
        info!(delegation = %self.spec.name, "delegation deleted");
        self.cancel.cancel();
    }

    pub fn is_deleted(&self) -> bool { self.cancel.is_cancelled() }

    fn load_status(&self) -> DelegationStatus {
        match self.store.load(&self.spec.name) {
            Ok(Some(st)) => {
                info!(delegation = %self.spec.name, granted = st.grant.triggered, revoked = st.revoke.triggered, "resuming from stored status");
                st
            }
            Ok(None) => DelegationStatus::default(),
            Err(e) => {
                warn!(delegation = %self.spec.name, error = %e, "failed to load status; starting fresh");
                DelegationStatus::default()
            }
        }
    }

    fn build_set(&self, phase: Phase, status: &PhaseStatus) -> Result<TriggerSet, DelegationError> {
        let specs = match phase {
            Phase::Grant => &self.spec.event_triggers,
            Phase::Revoke => &self.spec.deletion_triggers,
        };
        let ctx = BuildContext {
            hub: self.hub.clone(),
            dedup: Arc::clone(&self.dedup),
            cancel: self.cancel.clone(),
            clock: Arc::clone(&self.clock),
            base_time: from_unix_secs(status.time_activated).unwrap_or_else(|| self.clock.now()),
        };
        TriggerSet::build(&resume_specs(specs, status), &ctx).map_err(|source| DelegationError::Trigger { phase, source })
    }

    async fn run_phase(&self, phase: Phase, status: &mut DelegationStatus) -> Result<Outcome, DelegationError> {
        if status.phase(phase).triggered {
            info!(delegation = %self.spec.name, %phase, "phase already satisfied");
            return Ok(Outcome::Satisfied { waited: std::time::Duration::ZERO });
        }
        let set = self.build_set(phase, status.phase(phase))?;
        let mut protocol = ActivationProtocol::new(
            self.spec.name.clone(),
            phase,
            set.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
        );
        let out = protocol.run(status).await;
        set.delete_all();
        Ok(out)
    }

    async fn unbind(&self) -> Result<(), DelegationError> {
        self.binder.revoke(&self.spec).await.map_err(|source| DelegationError::Bind { phase: Phase::Revoke, source })?;
        counter!("delegation_revoked_total", 1u64);
        Ok(())
    }

    /// Drive the delegation to completion or until [`Delegation::delete`].
    /// Once anything may have been bound, every exit path revokes.
    pub async fn run(&self) -> Result<DelegationOutcome, DelegationError> {
        let name = &self.spec.name;
        let mut status = self.load_status();

        if self.run_phase(Phase::Grant, &mut status).await?.closed() {
            info!(delegation = %name, "closed before grant");
            return Ok(DelegationOutcome::ClosedBeforeGrant);
        }
        if let Err(source) = self.binder.grant(&self.spec).await {
            warn!(delegation = %name, error = %source, "grant failed; removing partial bindings");
            if let Err(e) = self.unbind().await {
                warn!(delegation = %name, error = %e, "cleanup after failed grant failed");
            }
            return Err(DelegationError::Bind { phase: Phase::Grant, source });
        }
        counter!("delegation_granted_total", 1u64);
        info!(delegation = %name, origin = %self.spec.origin, destinations = self.spec.destinations.len(), "permissions granted");

        let closed = match self.run_phase(Phase::Revoke, &mut status).await {
            Ok(out) => out.closed(),
            Err(e) => {
                warn!(delegation = %name, error = %e, "deletion triggers unusable; revoking now");
                self.unbind().await?;
                return Err(e);
            }
        };
        self.unbind().await?;
        info!(delegation = %name, forced = closed, "permissions revoked");
        if closed {
            return Ok(DelegationOutcome::ClosedAfterGrant);
        }
        if let Err(e) = self.store.remove(name) {
            counter!("persist_error_total", 1u64);
            warn!(delegation = %name, error = %e, "failed to remove finished status");
        }
        Ok(DelegationOutcome::Completed)
    }
}

/// Triggers whose completion was persisted start completed.
pub fn resume_specs(specs: &[TriggerSpec], status: &PhaseStatus) -> Vec<TriggerSpec> {
    specs
        .iter()
        .map(|s| TriggerSpec { triggered: s.triggered || status.trigger_completed(s.uid), ..s.clone() })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kdelegate_core::{Subject, SubjectKind, SystemClock};
    use kdelegate_persist::MemoryStatusStore;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        calls: Mutex<Vec<&'static str>>,
        fail_grant: bool,
    }

    #[async_trait::async_trait]
    impl RoleBinder for Recorder {
        async fn grant(&self, _: &DelegationSpec) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("grant");
            if self.fail_grant {
                anyhow::bail!("patch rejected after one binding was applied");
            }
            Ok(())
        }
        async fn revoke(&self, _: &DelegationSpec) -> anyhow::Result<()> {
            self.calls.lock().unwrap().push("revoke");
            Ok(())
        }
    }

    fn spec(event: Vec<TriggerSpec>, deletion: Vec<TriggerSpec>) -> DelegationSpec {
        DelegationSpec {
            name: "d1".into(),
            namespace: Some("apps".into()),
            origin: Subject { kind: SubjectKind::ServiceAccount, name: "deployer".into(), namespace: None },
            destinations: vec![Subject { kind: SubjectKind::User, name: "alice".into(), namespace: None }],
            event_triggers: event,
            deletion_triggers: deletion,
        }
    }

    fn time(value: &str) -> TriggerSpec { TriggerSpec::new("Time".parse().unwrap(), value, 1) }

    fn delegation(spec: DelegationSpec, store: Arc<MemoryStatusStore>, binder: Arc<Recorder>) -> Delegation {
        Delegation::new(spec, WatchHub::default(), Arc::new(SystemClock), store, binder).unwrap()
    }

    #[test]
    fn resume_marks_only_persisted_triggers() {
        let specs = vec![TriggerSpec { uid: 1, ..time("1h") }, TriggerSpec { uid: 2, ..time("1h") }];
        let mut st = PhaseStatus::default();
        st.triggers.insert(2, true);
        st.triggers.insert(1, false);
        let out = resume_specs(&specs, &st);
        assert!(!out[0].triggered);
        assert!(out[1].triggered);
    }

    #[test]
    fn invalid_spec_is_rejected_up_front() {
        let mut s = spec(vec![], vec![]);
        s.destinations.clear();
        let res = Delegation::new(s, WatchHub::default(), Arc::new(SystemClock), Arc::new(MemoryStatusStore::new()), Arc::new(Recorder::default()));
        assert!(matches!(res, Err(DelegationError::Spec(_))));
    }

    #[tokio::test]
    async fn time_triggers_grant_then_revoke() {
        let store = Arc::new(MemoryStatusStore::new());
        let binder = Arc::new(Recorder::default());
        let d = delegation(spec(vec![time("now")], vec![time("10n")]), store.clone(), binder.clone());
        assert_eq!(d.run().await.unwrap(), DelegationOutcome::Completed);
        assert_eq!(*binder.calls.lock().unwrap(), vec!["grant", "revoke"]);
        assert!(store.load("d1").unwrap().is_none(), "finished status is removed");
    }

    #[tokio::test]
    async fn relative_time_resumes_from_the_stored_activation() {
        let store = Arc::new(MemoryStatusStore::new());
        let mut st = DelegationStatus::default();
        st.grant.time_activated = kdelegate_core::clock::unix_secs(chrono::Utc::now() - chrono::Duration::hours(2));
        store.save("d1", &st).unwrap();

        let binder = Arc::new(Recorder::default());
        let d = delegation(spec(vec![time("1h")], vec![time("now")]), store.clone(), binder.clone());
        let out = tokio::time::timeout(std::time::Duration::from_secs(5), d.run()).await.unwrap().unwrap();
        assert_eq!(out, DelegationOutcome::Completed);
        assert_eq!(*binder.calls.lock().unwrap(), vec!["grant", "revoke"]);
    }

    #[tokio::test]
    async fn failed_grant_removes_partial_bindings() {
        let store = Arc::new(MemoryStatusStore::new());
        let binder = Arc::new(Recorder { fail_grant: true, ..Default::default() });
        let d = delegation(spec(vec![time("now")], vec![time("forever")]), store.clone(), binder.clone());
        assert!(matches!(d.run().await, Err(DelegationError::Bind { phase: Phase::Grant, .. })));
        assert_eq!(*binder.calls.lock().unwrap(), vec!["grant", "revoke"]);
        // the grant phase stays satisfied, so a rerun retries the grant directly
        assert!(store.load("d1").unwrap().unwrap().grant.triggered);
    }

    #[tokio::test]
    async fn delete_before_grant_binds_nothing() {
        let binder = Arc::new(Recorder::default());
        let d = delegation(spec(vec![time("forever")], vec![]), Arc::new(MemoryStatusStore::new()), binder.clone());
        d.delete();
        assert_eq!(d.run().await.unwrap(), DelegationOutcome::ClosedBeforeGrant);
        assert!(binder.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn resumed_grant_goes_straight_to_revoke() {
        let store = Arc::new(MemoryStatusStore::new());
        let mut st = DelegationStatus::default();
        st.grant.triggered = true;
        store.save("d1", &st).unwrap();

        let binder = Arc::new(Recorder::default());
        let d = Arc::new(delegation(spec(vec![time("forever")], vec![time("forever")]), store, binder.clone()));
        let run = tokio::spawn({
            let d = Arc::clone(&d);
            async move { d.run().await }
        });
        while binder.calls.lock().unwrap().is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        d.delete();
        assert_eq!(run.await.unwrap().unwrap(), DelegationOutcome::ClosedAfterGrant);
        assert_eq!(*binder.calls.lock().unwrap(), vec!["grant", "revoke"]);
    }

    fn try_new(spec: DelegationSpec) -> Result<Delegation, DelegationError> {
        Delegation::new(spec, WatchHub::default(), Arc::new(SystemClock), Arc::new(MemoryStatusStore::new()), Arc::new(Recorder::default()))
    }

    #[test]
    fn bad_triggers_are_rejected_before_anything_runs() {
        let res = try_new(spec(vec![time("someday")], vec![]));
        assert!(matches!(res, Err(DelegationError::Trigger { phase: Phase::Grant, .. })));
        let del_pod = TriggerSpec::new("DelPod".parse().unwrap(), "web_*", 1);
        let res = try_new(spec(vec![time("now")], vec![del_pod]));
        assert!(matches!(res, Err(DelegationError::Trigger { phase: Phase::Revoke, .. })));
    }
}

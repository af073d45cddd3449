//! Delegation Activation Protocol.
//!
//! `Idle -> Activating -> AwaitingAll -> Verifying -> Satisfied`, with
//! `ForceClosed` reachable from `AwaitingAll`. Triggers are waited on one
//! after another: a trigger stays satisfied once satisfied, so this is the
//! same as waiting for all of them together, but a force-close on trigger
//! `j` is only observed after every trigger before `j` has returned. That
//! latency only affects shutdown.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kdelegate_core::clock::unix_secs;
use kdelegate_core::{Clock, DelegationStatus, Phase};
use kdelegate_persist::StatusStore;
use kdelegate_trigger::TriggerSet;
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtocolState {
    Idle,
    Activating,
    AwaitingAll,
    Verifying,
    Satisfied,
    ForceClosed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every trigger completed; `waited` is zero when all were already complete.
    Satisfied { waited: Duration },
    ForceClosed,
}

impl Outcome {
    pub fn closed(&self) -> bool { matches!(self, Outcome::ForceClosed) }
}

/// Pause before re-waiting after a failed re-verification.
const REVERIFY_BACKOFF: Duration = Duration::from_millis(100);

pub struct ActivationProtocol {
    name: String,
    phase: Phase,
    triggers: TriggerSet,
    store: Arc<dyn StatusStore>,
    clock: Arc<dyn Clock>,
    state: ProtocolState,
}

impl ActivationProtocol {
    pub fn new(
        name: impl Into<String>,
        phase: Phase,
        triggers: TriggerSet,
        store: Arc<dyn StatusStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { name: name.into(), phase, triggers, store, clock, state: ProtocolState::Idle }
    }

    pub fn state(&self) -> ProtocolState { self.state }

    pub fn phase(&self) -> Phase { self.phase }

    pub fn triggers(&self) -> &TriggerSet { &self.triggers }

    fn transition(&mut self, next: ProtocolState) {
        debug!(delegation = %self.name, phase = %self.phase, from = ?self.state, to = ?next, "protocol transition");
        self.state = next;
    }

    /// Persistence failures are logged and otherwise ignored.
    fn persist(&self, status: &DelegationStatus) {
        if let Err(e) = self.store.save(&self.name, status) {
            counter!("persist_error_total", 1u64);
            warn!(delegation = %self.name, phase = %self.phase, error = %e, "failed to persist status");
        }
    }

    /// Run to `Satisfied` or `ForceClosed`, recording progress in `status`.
    pub async fn run(&mut self, status: &mut DelegationStatus) -> Outcome {
        let triggers = self.triggers.clone();
        self.transition(ProtocolState::Activating);
        let mut pending = 0usize;
        for t in triggers.iter() {
            if !t.completed() {
                t.activate();
                pending += 1;
            }
        }
        if pending == 0 {
            info!(delegation = %self.name, phase = %self.phase, total = triggers.len(), "all triggers already satisfied");
            return self.satisfy(status, Duration::ZERO);
        }

        let started = Instant::now();
        {
            // a resumed phase keeps its original activation instant
            let ps = status.phase_mut(self.phase);
            if ps.time_activated == 0 {
                ps.time_activated = unix_secs(self.clock.now());
            }
        }
        self.persist(status);
        info!(delegation = %self.name, phase = %self.phase, pending, total = triggers.len(), "waiting on triggers");

        loop {
            self.transition(ProtocolState::AwaitingAll);
            for t in triggers.iter() {
                if t.wait_on().await {
                    info!(delegation = %self.name, phase = %self.phase, uid = t.uid(), "force closed while waiting");
                    self.transition(ProtocolState::ForceClosed);
                    return Outcome::ForceClosed;
                }
                status.phase_mut(self.phase).triggers.insert(t.uid(), true);
                self.persist(status);
            }

            self.transition(ProtocolState::Verifying);
            let reverted: Vec<u32> = triggers.iter().filter(|t| !t.completed()).map(|t| t.uid()).collect();
            if reverted.is_empty() {
                break;
            }
            {
                let ps = status.phase_mut(self.phase);
                for uid in &reverted {
                    ps.triggers.insert(*uid, false);
                }
            }
            self.persist(status);
            counter!("activation_reverify_total", 1u64);
            warn!(delegation = %self.name, phase = %self.phase, ?reverted, "triggers no longer satisfied, waiting again");
            tokio::time::sleep(REVERIFY_BACKOFF).await;
        }
        self.satisfy(status, started.elapsed())
    }

    fn satisfy(&mut self, status: &mut DelegationStatus, waited: Duration) -> Outcome {
        self.transition(ProtocolState::Satisfied);
        let fired = unix_secs(self.clock.now());
        {
            let ps = status.phase_mut(self.phase);
            ps.time_activated = 0;
            ps.time_fired = fired;
            ps.triggered = true;
            for t in self.triggers.iter() {
                ps.triggers.insert(t.uid(), true);
            }
        }
        self.persist(status);
        histogram!("activation_wait_ms", waited.as_secs_f64() * 1000.0);
        info!(delegation = %self.name, phase = %self.phase, waited_ms = waited.as_millis() as u64, "phase satisfied");
        Outcome::Satisfied { waited }
    }
}

//! kdelegate triggers: conditions that must hold before a delegation is
//! granted or revoked. Event triggers count matching watch notifications
//! for one resource kind; time triggers fire once at a parsed instant.

#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicBool, Ordering};

use kdelegate_core::{TriggerKind, TriggerSpec};
use tokio_util::sync::CancellationToken;

pub mod adapter;
pub mod dedup;
pub mod event;
pub mod hub;
pub mod pattern;
pub mod set;
pub mod signal;
pub mod time;
pub mod timeexpr;

pub use adapter::{adapter_for, DecodeError, ObjectAdapter, TypedAdapter};
pub use dedup::DedupTracker;
pub use event::EventTrigger;
pub use hub::{WatchHub, WatchReceiver};
pub use pattern::{PatternError, WildcardPattern};
pub use set::{BuildContext, TriggerSet};
pub use signal::{Signal, SignalState};
pub use time::TimeTrigger;
pub use timeexpr::{parse_time_expression, TimeExprError};

#[derive(Debug, thiserror::Error)]
pub enum TriggerError {
    #[error("trigger {uid} ({kind}): {source}")]
    Pattern { uid: u32, kind: TriggerKind, source: PatternError },
    #[error("trigger {uid} ({kind}): {source}")]
    TimeExpr { uid: u32, kind: TriggerKind, source: TimeExprError },
    #[error("trigger {uid} ({kind}): not an event trigger kind")]
    KindMismatch { uid: u32, kind: TriggerKind },
    #[error("trigger {uid} ({kind}): replicas must be >= 1")]
    Replicas { uid: u32, kind: TriggerKind },
}

/// Runtime trigger driven by the activation protocol.
#[async_trait::async_trait]
pub trait Trigger: Send + Sync {
    fn spec(&self) -> &TriggerSpec;

    fn uid(&self) -> u32 { self.spec().uid }

    /// Configured threshold.
    fn replicas(&self) -> u32 { self.spec().replicas }

    /// Start observing. No-op once completed or already active.
    fn activate(&self);

    fn completed(&self) -> bool;

    /// Block until completion (`false`) or cancellation (`true`).
    async fn wait_on(&self) -> bool;

    /// Cancel the trigger; idempotent.
    fn delete(&self);
}

/// State every trigger carries: spec, completion flag and signal, and the
/// cancellation token (a child of the delegation's token).
#[derive(Debug)]
pub(crate) struct TriggerCore {
    pub(crate) spec: TriggerSpec,
    completed: AtomicBool,
    activated: AtomicBool,
    signal: Signal,
    pub(crate) cancel: CancellationToken,
}

impl TriggerCore {
    pub(crate) fn new(spec: TriggerSpec, cancel: CancellationToken) -> Self {
        let done = spec.triggered;
        Self {
            spec,
            completed: AtomicBool::new(done),
            activated: AtomicBool::new(false),
            signal: Signal::new(if done { SignalState::Completed } else { SignalState::Pending }),
            cancel,
        }
    }

    pub(crate) fn completed(&self) -> bool { self.completed.load(Ordering::Acquire) }

    /// Claim the single activation; false when completed or already active.
    pub(crate) fn begin_activation(&self) -> bool {
        !self.completed() && !self.cancel.is_cancelled() && !self.activated.swap(true, Ordering::AcqRel)
    }

    /// Mark completed and release waiters; true on the first call only.
    pub(crate) fn complete(&self) -> bool {
        if self.completed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.signal.complete();
        true
    }

    pub(crate) fn cancelled(&self) { self.signal.cancel(); }

    pub(crate) async fn wait_on(&self) -> bool {
        tokio::select! {
            biased;
            st = self.signal.settled() => st == SignalState::Cancelled,
            _ = self.cancel.cancelled() => {
                self.signal.cancel();
                self.signal.state() == SignalState::Cancelled
            }
        }
    }

    pub(crate) fn delete(&self) {
        self.cancel.cancel();
        self.signal.cancel();
    }
}

//! Broadcast-once completion signal: `Pending` settles exactly once into
//! `Completed` or `Cancelled`, later transitions are no-ops.

use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalState {
    Pending,
    Completed,
    Cancelled,
}

#[derive(Debug)]
pub struct Signal {
    tx: watch::Sender<SignalState>,
}

impl Default for Signal {
    fn default() -> Self { Self::new(SignalState::Pending) }
}

impl Signal {
    pub fn new(initial: SignalState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx }
    }

    pub fn state(&self) -> SignalState { *self.tx.borrow() }

    /// Returns true when this call settled the signal.
    pub fn complete(&self) -> bool { self.settle(SignalState::Completed) }

    /// Returns true when this call settled the signal.
    pub fn cancel(&self) -> bool { self.settle(SignalState::Cancelled) }

    fn settle(&self, to: SignalState) -> bool {
        self.tx.send_if_modified(|s| {
            if *s == SignalState::Pending {
                *s = to;
                true
            } else {
                false
            }
        })
    }

    /// Wait until the signal leaves `Pending` and return the settled state.
    pub async fn settled(&self) -> SignalState {
        let mut rx = self.tx.subscribe();
        let settled = match rx.wait_for(|s| *s != SignalState::Pending).await {
            Ok(s) => *s,
            // sender lives in self, so the channel cannot close while we wait
            Err(_) => self.state(),
        };
        settled
    }
}

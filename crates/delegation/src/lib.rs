//! kdelegate delegation: the activation protocol that gates a grant or a
//! revoke on a trigger set, and the coordinator that runs both phases and
//! hands the actual RBAC work to a [`RoleBinder`].

#![forbid(unsafe_code)]

use kdelegate_core::{CoreError, DelegationSpec, Phase};
use kdelegate_trigger::TriggerError;
use tracing::info;

pub mod delegation;
pub mod protocol;

pub use delegation::{Delegation, DelegationOutcome};
pub use protocol::{ActivationProtocol, Outcome, ProtocolState};

#[derive(Debug, thiserror::Error)]
pub enum DelegationError {
    #[error(transparent)]
    Spec(#[from] CoreError),
    #[error("{phase} triggers: {source}")]
    Trigger { phase: Phase, source: TriggerError },
    #[error("{phase} binding failed: {source}")]
    Bind { phase: Phase, source: anyhow::Error },
}

/// Materializes (grant) and removes (revoke) the origin's permissions on the
/// destinations. Both calls must be idempotent: a resumed delegation may
/// repeat them.
#[async_trait::async_trait]
pub trait RoleBinder: Send + Sync {
    async fn grant(&self, spec: &DelegationSpec) -> anyhow::Result<()>;
    async fn revoke(&self, spec: &DelegationSpec) -> anyhow::Result<()>;
}

/// Binder that only logs; for `--dry-run`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryRunBinder;

#[async_trait::async_trait]
impl RoleBinder for DryRunBinder {
    async fn grant(&self, spec: &DelegationSpec) -> anyhow::Result<()> {
        for d in &spec.destinations {
            info!(delegation = %spec.name, origin = %spec.origin, destination = %d, "dry-run: grant");
        }
        Ok(())
    }

    async fn revoke(&self, spec: &DelegationSpec) -> anyhow::Result<()> {
        for d in &spec.destinations {
            info!(delegation = %spec.name, origin = %spec.origin, destination = %d, "dry-run: revoke");
        }
        Ok(())
    }
}

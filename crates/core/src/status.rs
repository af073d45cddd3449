//! Persisted delegation bookkeeping. Only completion flags and the
//! activation/firing instants survive a restart; in-flight counts do not.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Grant runs over the event triggers, revoke over the deletion triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    Grant,
    Revoke,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Grant => "grant",
            Phase::Revoke => "revoke",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseStatus {
    /// Unix seconds when the phase started waiting; 0 when not activating.
    #[serde(default)]
    pub time_activated: i64,
    /// Unix seconds when the phase was satisfied; 0 when not yet fired.
    #[serde(default)]
    pub time_fired: i64,
    #[serde(default)]
    pub triggered: bool,
    /// Trigger UID -> completed.
    #[serde(default)]
    pub triggers: BTreeMap<u32, bool>,
}

impl PhaseStatus {
    pub fn trigger_completed(&self, uid: u32) -> bool {
        self.triggers.get(&uid).copied().unwrap_or(false)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelegationStatus {
    #[serde(default)]
    pub grant: PhaseStatus,
    #[serde(default)]
    pub revoke: PhaseStatus,
}

impl DelegationStatus {
    pub fn phase(&self, phase: Phase) -> &PhaseStatus {
        match phase {
            Phase::Grant => &self.grant,
            Phase::Revoke => &self.revoke,
        }
    }

    pub fn phase_mut(&mut self, phase: Phase) -> &mut PhaseStatus {
        match phase {
            Phase::Grant => &mut self.grant,
            Phase::Revoke => &mut self.revoke,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phases_are_independent() {
        let mut st = DelegationStatus::default();
        st.phase_mut(Phase::Grant).triggered = true;
        st.phase_mut(Phase::Revoke).triggers.insert(3, true);
        assert!(st.grant.triggered);
        assert!(!st.revoke.triggered);
        assert!(st.phase(Phase::Revoke).trigger_completed(3));
        assert!(!st.phase(Phase::Grant).trigger_completed(3));
    }

    #[test]
    fn status_tolerates_missing_fields() {
        let st: DelegationStatus = serde_json::from_str(r#"{"grant":{"timeActivated":5}}"#).unwrap();
        assert_eq!(st.grant.time_activated, 5);
        assert_eq!(st.revoke, PhaseStatus::default());
    }
}

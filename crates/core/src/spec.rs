//! Delegation spec: who lends permissions to whom, gated by which triggers.

use serde::{Deserialize, Serialize};

use crate::{assign_uids, CoreError, TriggerSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubjectKind {
    ServiceAccount,
    User,
    Group,
    /// Destination only; resolved to the pod's service account.
    Pod,
}

impl SubjectKind {
    pub fn namespaced(&self) -> bool { matches!(self, SubjectKind::ServiceAccount | SubjectKind::Pod) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub kind: SubjectKind,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl Subject {
    pub fn service_account(namespace: &str, name: &str) -> Self {
        Self { kind: SubjectKind::ServiceAccount, name: name.to_string(), namespace: Some(namespace.to_string()) }
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{:?}:{}/{}", self.kind, ns, self.name),
            None => write!(f, "{:?}:{}", self.kind, self.name),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegationSpec {
    pub name: String,
    /// Default namespace for namespaced subjects that omit one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    pub origin: Subject,
    pub destinations: Vec<Subject>,
    #[serde(default)]
    pub event_triggers: Vec<TriggerSpec>,
    #[serde(default)]
    pub deletion_triggers: Vec<TriggerSpec>,
}

impl DelegationSpec {
    /// Validate, fill namespaces from `namespace` and assign trigger UIDs.
    pub fn normalize(&mut self) -> Result<(), CoreError> {
        if self.name.trim().is_empty() {
            return Err(CoreError::InvalidSpec("name must not be empty".into()));
        }
        if self.origin.kind == SubjectKind::Pod {
            return Err(CoreError::InvalidSpec("origin cannot be a Pod".into()));
        }
        if self.destinations.is_empty() {
            return Err(CoreError::InvalidSpec("at least one destination is required".into()));
        }
        let default_ns = self.namespace.clone();
        for s in std::iter::once(&mut self.origin).chain(self.destinations.iter_mut()) {
            if s.kind.namespaced() && s.namespace.is_none() {
                s.namespace = default_ns.clone();
            }
            if s.kind.namespaced() && s.namespace.is_none() {
                return Err(CoreError::InvalidSpec(format!("{:?} {} needs a namespace", s.kind, s.name)));
            }
            if s.name.is_empty() {
                return Err(CoreError::InvalidSpec("subject name must not be empty".into()));
            }
        }
        if let Some(t) = self.event_triggers.iter().chain(self.deletion_triggers.iter()).find(|t| t.replicas < 1) {
            return Err(CoreError::InvalidSpec(format!("trigger {} {}: replicas must be >= 1", t.kind, t.value)));
        }
        assign_uids(self.event_triggers.iter_mut().chain(self.deletion_triggers.iter_mut()));
        Ok(())
    }
}

//! kdelegate core types: trigger specs, resource kinds, watch events and
//! the persisted bookkeeping shared by the trigger and delegation crates.

#![forbid(unsafe_code)]

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub mod clock;
pub mod spec;
pub mod status;

pub use clock::{Clock, OffsetClock, SystemClock};
pub use spec::{DelegationSpec, Subject, SubjectKind};
pub use status::{DelegationStatus, Phase, PhaseStatus};

/// Kubernetes object UID (`metadata.uid`) as raw UUID bytes.
pub type Uid = [u8; 16];

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("invalid trigger kind: {0}")]
    InvalidTriggerKind(String),
    #[error("invalid uid: {0}")]
    InvalidUid(String),
    #[error("invalid delegation spec: {0}")]
    InvalidSpec(String),
}

/// Parse `metadata.uid` into its 16 raw bytes.
pub fn parse_uid(uid_str: &str) -> Result<Uid, CoreError> {
    uuid::Uuid::parse_str(uid_str)
        .map(|u| *u.as_bytes())
        .map_err(|e| CoreError::InvalidUid(format!("{}: {}", uid_str, e)))
}

/// Resource kinds an event trigger can watch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceKind {
    Pod,
    Deployment,
    ReplicaSet,
    StatefulSet,
    DaemonSet,
    Service,
    Job,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 7] = [
        ResourceKind::Pod,
        ResourceKind::Deployment,
        ResourceKind::ReplicaSet,
        ResourceKind::StatefulSet,
        ResourceKind::DaemonSet,
        ResourceKind::Service,
        ResourceKind::Job,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Pod => "Pod",
            ResourceKind::Deployment => "Deployment",
            ResourceKind::ReplicaSet => "ReplicaSet",
            ResourceKind::StatefulSet => "StatefulSet",
            ResourceKind::DaemonSet => "DaemonSet",
            ResourceKind::Service => "Service",
            ResourceKind::Job => "Job",
        }
    }

    /// `version/Kind` or `group/version/Kind`.
    pub fn gvk_key(&self) -> &'static str {
        match self {
            ResourceKind::Pod => "v1/Pod",
            ResourceKind::Service => "v1/Service",
            ResourceKind::Deployment => "apps/v1/Deployment",
            ResourceKind::ReplicaSet => "apps/v1/ReplicaSet",
            ResourceKind::StatefulSet => "apps/v1/StatefulSet",
            ResourceKind::DaemonSet => "apps/v1/DaemonSet",
            ResourceKind::Job => "batch/v1/Job",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        ResourceKind::ALL.iter().copied().find(|k| k.as_str().eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which notification an event trigger reacts to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EventMode {
    Add,
    Update,
    Del,
}

impl EventMode {
    fn prefix(&self) -> &'static str {
        match self {
            EventMode::Add => "Add",
            EventMode::Update => "Update",
            EventMode::Del => "Del",
        }
    }
}

/// Trigger kind as written in a delegation spec: `AddPod`, `DelJob`,
/// `UpdateDeployment`, ..., or `Time`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum TriggerKind {
    Event { resource: ResourceKind, mode: EventMode },
    Time,
}

impl TriggerKind {
    pub fn event(mode: EventMode, resource: ResourceKind) -> Self {
        TriggerKind::Event { resource, mode }
    }

    pub fn resource(&self) -> Option<ResourceKind> {
        match self {
            TriggerKind::Event { resource, .. } => Some(*resource),
            TriggerKind::Time => None,
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerKind::Event { resource, mode } => write!(f, "{}{}", mode.prefix(), resource),
            TriggerKind::Time => f.write_str("Time"),
        }
    }
}

impl FromStr for TriggerKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let t = s.trim();
        if t.eq_ignore_ascii_case("time") {
            return Ok(TriggerKind::Time);
        }
        for mode in [EventMode::Update, EventMode::Add, EventMode::Del] {
            let p = mode.prefix();
            if t.len() > p.len() && t.is_char_boundary(p.len()) && t[..p.len()].eq_ignore_ascii_case(p) {
                if let Some(resource) = ResourceKind::from_name(&t[p.len()..]) {
                    return Ok(TriggerKind::Event { resource, mode });
                }
            }
        }
        Err(CoreError::InvalidTriggerKind(s.to_string()))
    }
}

impl TryFrom<String> for TriggerKind {
    type Error = CoreError;
    fn try_from(value: String) -> Result<Self, Self::Error> { value.parse() }
}

impl From<TriggerKind> for String {
    fn from(k: TriggerKind) -> Self { k.to_string() }
}

fn default_replicas() -> u32 { 1 }

/// Declarative trigger as persisted in a delegation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TriggerSpec {
    /// Assigned once (see [`assign_uids`]); 0 means unassigned.
    #[serde(default)]
    pub uid: u32,
    pub kind: TriggerKind,
    pub value: String,
    #[serde(default = "default_replicas")]
    pub replicas: u32,
    #[serde(default)]
    pub triggered: bool,
}

impl TriggerSpec {
    pub fn new(kind: TriggerKind, value: impl Into<String>, replicas: u32) -> Self {
        Self { uid: 0, kind, value: value.into(), replicas, triggered: false }
    }
}

/// Give every unassigned trigger (uid 0) a UID above the current maximum.
/// Existing UIDs are left untouched so they stay stable across updates.
pub fn assign_uids<'a>(specs: impl IntoIterator<Item = &'a mut TriggerSpec>) {
    let mut specs: Vec<&mut TriggerSpec> = specs.into_iter().collect();
    let mut next = specs.iter().map(|s| s.uid).max().unwrap_or(0);
    for s in specs.iter_mut().filter(|s| s.uid == 0) {
        next += 1;
        s.uid = next;
    }
}

/// A watch notification carrying raw objects as delivered by the watch layer.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    Added(serde_json::Value),
    Updated { old: serde_json::Value, new: serde_json::Value },
    Deleted(serde_json::Value),
}

impl WatchEvent {
    pub fn mode(&self) -> EventMode {
        match self {
            WatchEvent::Added(_) => EventMode::Add,
            WatchEvent::Updated { .. } => EventMode::Update,
            WatchEvent::Deleted(_) => EventMode::Del,
        }
    }

    /// The object a trigger inspects: the new version for updates.
    pub fn object(&self) -> &serde_json::Value {
        match self {
            WatchEvent::Added(o) | WatchEvent::Deleted(o) => o,
            WatchEvent::Updated { new, .. } => new,
        }
    }
}

pub mod prelude {
    pub use super::{
        assign_uids, Clock, DelegationSpec, DelegationStatus, EventMode, Phase, PhaseStatus, ResourceKind, Subject,
        SubjectKind, TriggerKind, TriggerSpec, Uid, WatchEvent,
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_kind_parses_case_insensitively() {
        assert_eq!("AddPod".parse::<TriggerKind>().unwrap(), TriggerKind::event(EventMode::Add, ResourceKind::Pod));
        assert_eq!("delstatefulset".parse::<TriggerKind>().unwrap(), TriggerKind::event(EventMode::Del, ResourceKind::StatefulSet));
        assert_eq!("UPDATEJOB".parse::<TriggerKind>().unwrap(), TriggerKind::event(EventMode::Update, ResourceKind::Job));
        assert_eq!("time".parse::<TriggerKind>().unwrap(), TriggerKind::Time);
        assert!("AddNode".parse::<TriggerKind>().is_err());
        assert!("Add".parse::<TriggerKind>().is_err());
        assert!("".parse::<TriggerKind>().is_err());
    }

    #[test]
    fn trigger_kind_display_is_canonical() {
        for r in ResourceKind::ALL {
            for m in [EventMode::Add, EventMode::Update, EventMode::Del] {
                let k = TriggerKind::event(m, r);
                assert_eq!(k.to_string().to_lowercase().parse::<TriggerKind>().unwrap(), k);
            }
        }
        assert_eq!(TriggerKind::event(EventMode::Del, ResourceKind::ReplicaSet).to_string(), "DelReplicaSet");
    }

    #[test]
    fn trigger_spec_defaults_from_json() {
        let s: TriggerSpec = serde_json::from_value(serde_json::json!({ "kind": "AddPod", "value": "web-*" })).unwrap();
        assert_eq!(s.uid, 0);
        assert_eq!(s.replicas, 1);
        assert!(!s.triggered);
        let back = serde_json::to_value(&s).unwrap();
        assert_eq!(back["kind"], "AddPod");
    }

    #[test]
    fn assign_uids_keeps_existing_and_fills_gaps() {
        let mut specs = vec![
            TriggerSpec::new(TriggerKind::Time, "1h", 1),
            TriggerSpec { uid: 7, ..TriggerSpec::new(TriggerKind::Time, "2h", 1) },
            TriggerSpec::new(TriggerKind::Time, "3h", 1),
        ];
        assign_uids(specs.iter_mut());
        let uids: Vec<u32> = specs.iter().map(|s| s.uid).collect();
        assert_eq!(uids, vec![8, 7, 9]);
        assign_uids(specs.iter_mut());
        assert_eq!(specs.iter().map(|s| s.uid).collect::<Vec<_>>(), vec![8, 7, 9]);
    }

    #[test]
    fn parse_uid_accepts_uuid_and_rejects_garbage() {
        let u = parse_uid("00000000-0000-0000-0000-000000000001").unwrap();
        assert_eq!(u[15], 1);
        assert!(parse_uid("not-a-uid").is_err());
    }

    #[test]
    fn watch_event_object_is_new_for_updates() {
        let ev = WatchEvent::Updated { old: serde_json::json!({"v": 1}), new: serde_json::json!({"v": 2}) };
        assert_eq!(ev.mode(), EventMode::Update);
        assert_eq!(ev.object()["v"], 2);
    }
}

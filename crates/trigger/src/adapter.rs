//! Per-kind decoding of raw watch objects into `(name, uid)`.

use std::marker::PhantomData;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, ReplicaSet, StatefulSet};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kdelegate_core::{parse_uid, CoreError, ResourceKind, Uid};
use serde::de::DeserializeOwned;

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("expected kind {expected}, got {got}")]
    WrongKind { expected: &'static str, got: String },
    #[error("decoding {kind}: {source}")]
    Json { kind: &'static str, source: serde_json::Error },
    #[error("object has no metadata.name")]
    MissingName,
    #[error("object has no metadata.uid")]
    MissingUid,
    #[error(transparent)]
    Uid(#[from] CoreError),
}

pub trait ObjectAdapter: Send + Sync {
    fn kind(&self) -> ResourceKind;
    fn extract(&self, obj: &serde_json::Value) -> Result<(String, Uid), DecodeError>;
}

/// Adapter backed by the typed k8s-openapi object for the kind.
pub struct TypedAdapter<K> {
    kind: ResourceKind,
    _k: PhantomData<fn() -> K>,
}

impl<K> TypedAdapter<K> {
    pub fn new(kind: ResourceKind) -> Self { Self { kind, _k: PhantomData } }
}

impl<K> ObjectAdapter for TypedAdapter<K>
where
    K: k8s_openapi::Resource + k8s_openapi::Metadata<Ty = ObjectMeta> + DeserializeOwned,
{
    fn kind(&self) -> ResourceKind { self.kind }

    fn extract(&self, obj: &serde_json::Value) -> Result<(String, Uid), DecodeError> {
        if let Some(got) = obj.get("kind").and_then(|v| v.as_str()) {
            if got != K::KIND {
                return Err(DecodeError::WrongKind { expected: K::KIND, got: got.to_string() });
            }
        }
        let typed: K = serde_json::from_value(obj.clone()).map_err(|source| DecodeError::Json { kind: K::KIND, source })?;
        let meta = typed.metadata();
        let name = meta.name.clone().ok_or(DecodeError::MissingName)?;
        let uid = parse_uid(meta.uid.as_deref().ok_or(DecodeError::MissingUid)?)?;
        Ok((name, uid))
    }
}

/// Kind dispatch table.
pub fn adapter_for(kind: ResourceKind) -> Arc<dyn ObjectAdapter> {
    match kind {
        ResourceKind::Pod => Arc::new(TypedAdapter::<Pod>::new(kind)),
        ResourceKind::Deployment => Arc::new(TypedAdapter::<Deployment>::new(kind)),
        ResourceKind::ReplicaSet => Arc::new(TypedAdapter::<ReplicaSet>::new(kind)),
        ResourceKind::StatefulSet => Arc::new(TypedAdapter::<StatefulSet>::new(kind)),
        ResourceKind::DaemonSet => Arc::new(TypedAdapter::<DaemonSet>::new(kind)),
        ResourceKind::Service => Arc::new(TypedAdapter::<Service>::new(kind)),
        ResourceKind::Job => Arc::new(TypedAdapter::<Job>::new(kind)),
    }
}

//! RBAC materialization: a grant copies every RoleBinding and
//! ClusterRoleBinding the origin is a subject of, with the destinations as
//! subjects and a label naming the delegation. A revoke deletes by label.

use std::collections::BTreeMap;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::rbac::v1::{ClusterRoleBinding, RoleBinding, Subject as RbacSubject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kdelegate_core::{DelegationSpec, Subject, SubjectKind};
use kdelegate_delegation::RoleBinder;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::Client;
use metrics::{counter, histogram};
use tracing::{debug, info, warn};

pub const DELEGATION_LABEL: &str = "kdelegate.io/delegation";
pub const FIELD_MANAGER: &str = "kdelegate";
const RBAC_GROUP: &str = "rbac.authorization.k8s.io";

pub struct KubeRoleBinder {
    client: Client,
}

impl KubeRoleBinder {
    pub fn new(client: Client) -> Self { Self { client } }

    /// Pod destinations become the pod's service account.
    async fn resolve_destinations(&self, spec: &DelegationSpec) -> Result<Vec<RbacSubject>> {
        let mut out = Vec::with_capacity(spec.destinations.len());
        for d in &spec.destinations {
            if d.kind != SubjectKind::Pod {
                out.push(to_rbac_subject(d));
                continue;
            }
            let ns = d.namespace.as_deref().ok_or_else(|| anyhow!("pod destination {} has no namespace", d.name))?;
            let pods: Api<Pod> = Api::namespaced(self.client.clone(), ns);
            let pod = pods.get(&d.name).await.with_context(|| format!("resolving pod {}/{}", ns, d.name))?;
            let sa = pod.spec.and_then(|s| s.service_account_name).unwrap_or_else(|| "default".to_string());
            debug!(pod = %d.name, namespace = ns, service_account = %sa, "resolved pod destination");
            out.push(to_rbac_subject(&Subject::service_account(ns, &sa)));
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl RoleBinder for KubeRoleBinder {
    async fn grant(&self, spec: &DelegationSpec) -> Result<()> {
        let started = Instant::now();
        let subjects = self.resolve_destinations(spec).await?;
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        let mut copied = 0usize;

        let all: Api<RoleBinding> = Api::all(self.client.clone());
        for rb in all.list(&ListParams::default()).await.context("listing rolebindings")?.items {
            if is_delegated(&rb.metadata) || !binds(rb.subjects.as_deref(), &spec.origin) {
                continue;
            }
            let copy = delegated_role_binding(&spec.name, &rb, subjects.clone());
            let (ns, name) = (copy.metadata.namespace.clone().unwrap_or_default(), copy.metadata.name.clone().unwrap_or_default());
            let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), &ns);
            api.patch(&name, &pp, &Patch::Apply(&copy)).await.with_context(|| format!("applying rolebinding {}/{}", ns, name))?;
            info!(delegation = %spec.name, namespace = %ns, binding = %name, role = %rb.role_ref.name, "rolebinding granted");
            copied += 1;
        }

        let cluster: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        for crb in cluster.list(&ListParams::default()).await.context("listing clusterrolebindings")?.items {
            if is_delegated(&crb.metadata) || !binds(crb.subjects.as_deref(), &spec.origin) {
                continue;
            }
            let copy = delegated_cluster_role_binding(&spec.name, &crb, subjects.clone());
            let name = copy.metadata.name.clone().unwrap_or_default();
            cluster.patch(&name, &pp, &Patch::Apply(&copy)).await.with_context(|| format!("applying clusterrolebinding {}", name))?;
            info!(delegation = %spec.name, binding = %name, role = %crb.role_ref.name, "clusterrolebinding granted");
            copied += 1;
        }

        if copied == 0 {
            warn!(delegation = %spec.name, origin = %spec.origin, "origin has no bindings; nothing delegated");
        }
        histogram!("rbac_grant_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("rbac_bindings_created_total", copied as u64);
        Ok(())
    }

    async fn revoke(&self, spec: &DelegationSpec) -> Result<()> {
        let started = Instant::now();
        let lp = ListParams::default().labels(&label_selector(&spec.name));
        let dp = DeleteParams::default();
        let mut removed = 0usize;

        let all: Api<RoleBinding> = Api::all(self.client.clone());
        for rb in all.list(&lp).await.context("listing delegated rolebindings")?.items {
            let (ns, name) = (rb.metadata.namespace.unwrap_or_default(), rb.metadata.name.unwrap_or_default());
            let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), &ns);
            if ignore_not_found(api.delete(&name, &dp).await.map(|_| ())).with_context(|| format!("deleting rolebinding {}/{}", ns, name))? {
                removed += 1;
            }
        }

        let cluster: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        for crb in cluster.list(&lp).await.context("listing delegated clusterrolebindings")?.items {
            let name = crb.metadata.name.unwrap_or_default();
            if ignore_not_found(cluster.delete(&name, &dp).await.map(|_| ())).with_context(|| format!("deleting clusterrolebinding {}", name))? {
                removed += 1;
            }
        }

        info!(delegation = %spec.name, removed, "delegated bindings revoked");
        histogram!("rbac_revoke_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("rbac_bindings_deleted_total", removed as u64);
        Ok(())
    }
}

/// `Ok(true)` when deleted, `Ok(false)` when already gone.
fn ignore_not_found(res: kube::Result<()>) -> kube::Result<bool> {
    match res {
        Ok(()) => Ok(true),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
        Err(e) => Err(e),
    }
}

pub fn to_rbac_subject(s: &Subject) -> RbacSubject {
    match s.kind {
        SubjectKind::ServiceAccount | SubjectKind::Pod => RbacSubject {
            api_group: None,
            kind: "ServiceAccount".to_string(),
            name: s.name.clone(),
            namespace: s.namespace.clone(),
        },
        SubjectKind::User | SubjectKind::Group => RbacSubject {
            api_group: Some(RBAC_GROUP.to_string()),
            kind: if s.kind == SubjectKind::User { "User" } else { "Group" }.to_string(),
            name: s.name.clone(),
            namespace: None,
        },
    }
}

/// Whether `subjects` names `origin`; service accounts also match on namespace.
pub fn binds(subjects: Option<&[RbacSubject]>, origin: &Subject) -> bool {
    let want = to_rbac_subject(origin);
    subjects.unwrap_or_default().iter().any(|s| {
        s.kind == want.kind && s.name == want.name && (want.kind != "ServiceAccount" || s.namespace == want.namespace)
    })
}

fn is_delegated(meta: &ObjectMeta) -> bool {
    meta.labels.as_ref().is_some_and(|l| l.contains_key(DELEGATION_LABEL))
}

/// Label values are capped at 63 characters.
fn label_value(delegation: &str) -> String {
    delegation.chars().take(63).collect::<String>().trim_end_matches(['-', '.', '_']).to_string()
}

fn label_selector(delegation: &str) -> String { format!("{}={}", DELEGATION_LABEL, label_value(delegation)) }

/// `kdelegate-<delegation>-<source>`, capped at 253 characters.
pub fn delegated_name(delegation: &str, source: &str) -> String {
    format!("kdelegate-{}-{}", delegation, source).to_ascii_lowercase().chars().take(253).collect()
}

fn delegated_meta(delegation: &str, source: &ObjectMeta) -> ObjectMeta {
    ObjectMeta {
        name: Some(delegated_name(delegation, source.name.as_deref().unwrap_or_default())),
        namespace: source.namespace.clone(),
        labels: Some(BTreeMap::from([(DELEGATION_LABEL.to_string(), label_value(delegation))])),
        ..Default::default()
    }
}

pub fn delegated_role_binding(delegation: &str, source: &RoleBinding, subjects: Vec<RbacSubject>) -> RoleBinding {
    RoleBinding { metadata: delegated_meta(delegation, &source.metadata), role_ref: source.role_ref.clone(), subjects: Some(subjects) }
}

pub fn delegated_cluster_role_binding(
    delegation: &str,
    source: &ClusterRoleBinding,
    subjects: Vec<RbacSubject>,
) -> ClusterRoleBinding {
    ClusterRoleBinding { metadata: delegated_meta(delegation, &source.metadata), role_ref: source.role_ref.clone(), subjects: Some(subjects) }
}

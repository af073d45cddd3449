//! kdelegate kubehub: list+watch wiring from the cluster into the watch hub,
//! and the kube-backed [`KubeRoleBinder`].

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use kube::Client;

pub mod rbac;
pub mod watch;

pub use rbac::{KubeRoleBinder, DELEGATION_LABEL, FIELD_MANAGER};
pub use watch::{preflight, start_watcher, start_watchers, Tracker};

/// Client from the ambient kubeconfig or in-cluster config.
pub async fn client() -> Result<Client> {
    Client::try_default().await.context("building kube client (kubeconfig or in-cluster)")
}

//! Rsync transfer: daemon server pod + one-shot client pods
//!
//! The server mounts every destination PVC under `/mnt/<ns>/<name>` and
//! serves them as rsync modules; each client pod pushes one source PVC
//! into the matching module. Transport sidecars are fused into both pod
//! shapes.

use k8s_openapi::api::core::v1::{Container, PodSpec};

use crate::meta::{ContainerMutation, MutationMode, PodSpecMutation};
use crate::pvc::PvcRef;

pub mod options;

mod client;
mod server;

pub use client::RsyncClient;
pub use server::{
    RsyncServer, NULL_TRANSPORT_BACKEND_PORT, NULL_TRANSPORT_INGRESS_PORT, RSYNC_SERVER_POD,
};

/// Name of the rsync container in both pod shapes
pub const RSYNC_CONTAINER: &str = "rsync";

/// Fixed configmap name holding `rsyncd.conf`
pub const RSYNC_CONFIG_NAME: &str = "volrep-rsync-config";

/// Fixed secret name holding the rsync daemon credentials
pub const RSYNC_SECRET_NAME: &str = "volrep-rsync-secret";

pub(crate) const RSYNC_IMAGE: &str = "quay.io/volrep/rsync-transfer:latest";

/// Default rsync daemon user when the caller supplies none
pub(crate) const DEFAULT_RSYNC_USER: &str = "root";

/// Where a PVC is mounted within a transfer pod
pub(crate) fn mount_path(pvc: &PvcRef) -> String {
    format!("/mnt/{}/{}", pvc.namespace(), pvc.label_safe_name())
}

/// Apply replace-mode pod-spec mutations.
///
/// Only the node selector, pod security context, and node name are
/// mutable.
pub(crate) fn apply_pod_mutations(spec: &mut PodSpec, mutations: &[PodSpecMutation]) {
    for m in mutations {
        if m.mode != MutationMode::Replace {
            continue;
        }
        spec.node_selector = m.node_selector.clone();
        if m.security_context.is_some() {
            spec.security_context = m.security_context.clone();
        }
        if let Some(node_name) = &m.node_name {
            spec.node_name = Some(node_name.clone());
        }
    }
}

/// Apply replace-mode container mutations.
///
/// Only the security context and resource requirements are mutable.
pub(crate) fn apply_container_mutations(container: &mut Container, mutations: &[ContainerMutation]) {
    for m in mutations {
        if m.mode != MutationMode::Replace {
            continue;
        }
        if m.security_context.is_some() {
            container.security_context = m.security_context.clone();
        }
        if let Some(resources) = &m.resources {
            container.resources = Some(resources.clone());
        }
    }
}

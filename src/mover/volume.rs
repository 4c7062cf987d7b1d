//! Volume-handler collaborator interface
//!
//! Snapshotting and temp-PVC provisioning belong to the outer
//! reconciler; the mover only needs these three operations. Each returns
//! `None` while the underlying storage operation is still in flight, so
//! the mover reports in-progress and retries next iteration.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, TypedLocalObjectReference};

#[cfg(test)]
use mockall::automock;

use crate::Result;

/// Provisions the volumes the data path reads from and writes to
#[cfg_attr(test, automock)]
#[async_trait]
pub trait VolumeHandler: Send + Sync {
    /// A point-in-time copy (or direct handle) of `source` under `name`,
    /// suitable for a transfer pod to mount
    async fn ensure_pvc_from_src(
        &self,
        source: &PersistentVolumeClaim,
        name: &str,
        is_temporary: bool,
    ) -> Result<Option<PersistentVolumeClaim>>;

    /// A freshly provisioned PVC under `name` for incoming data
    async fn ensure_new_pvc(&self, name: &str) -> Result<Option<PersistentVolumeClaim>>;

    /// A snapshot "image" of the just-written volume, referenced from the
    /// destination CR's status
    async fn ensure_image(
        &self,
        pvc: &PersistentVolumeClaim,
    ) -> Result<Option<TypedLocalObjectReference>>;
}

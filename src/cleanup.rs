//! Label-based reclamation of per-iteration objects
//!
//! Every object a transfer materializes is marked with
//! `volrep.dev/cleanup: <owner-uid>` once its iteration completes. The
//! sweeper deletes by that label across a fixed type catalog: one
//! delete-collection call per bulk-capable kind, then a list+delete loop
//! for services (not every orchestrator implements the bulk verb for the
//! service kind). The sweep is safe to re-run; missing objects are
//! success.

use k8s_openapi::api::core::v1::{ConfigMap, PersistentVolumeClaim, Pod, Secret, Service};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PropagationPolicy};
use kube::core::ApiResource;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::{is_not_found, Error};
use crate::Result;

/// Label key marking an object as iteration-scoped garbage
pub const CLEANUP_LABEL_KEY: &str = "volrep.dev/cleanup";

/// ApiResource for OpenShift passthrough routes
pub(crate) fn route_api_resource() -> ApiResource {
    ApiResource {
        group: "route.openshift.io".to_string(),
        version: "v1".to_string(),
        api_version: "route.openshift.io/v1".to_string(),
        kind: "Route".to_string(),
        plural: "routes".to_string(),
    }
}

/// ApiResource for CSI volume snapshots
pub(crate) fn volume_snapshot_api_resource() -> ApiResource {
    ApiResource {
        group: "snapshot.storage.k8s.io".to_string(),
        version: "v1".to_string(),
        api_version: "snapshot.storage.k8s.io/v1".to_string(),
        kind: "VolumeSnapshot".to_string(),
        plural: "volumesnapshots".to_string(),
    }
}

/// Attach the cleanup label to a namespaced object via a merge patch.
///
/// The patch only touches `metadata.labels`, so spec fields of existing
/// objects are never overwritten.
pub async fn label_for_cleanup<K>(
    client: &Client,
    namespace: &str,
    name: &str,
    key: &str,
    value: &str,
) -> Result<()>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + Serialize
        + std::fmt::Debug,
    K::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({"metadata": {"labels": {key: value}}});
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    debug!(namespace, name, key, value, "marked object for cleanup");
    Ok(())
}

/// Attach the cleanup label to a dynamically typed object (route, snapshot)
pub async fn label_dynamic_for_cleanup(
    client: &Client,
    ar: &ApiResource,
    namespace: &str,
    name: &str,
    key: &str,
    value: &str,
) -> Result<()> {
    let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, ar);
    let patch = serde_json::json!({"metadata": {"labels": {key: value}}});
    api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    debug!(namespace, name, kind = %ar.kind, "marked object for cleanup");
    Ok(())
}

/// Delete every marked object owned by `owner_uid` in `namespace`.
///
/// Errors from individual kinds are accumulated so one failing API group
/// does not shadow the rest; not-found responses are absorbed.
pub async fn cleanup_objects(client: &Client, namespace: &str, owner_uid: &str) -> Result<()> {
    info!(namespace, owner_uid, "deleting temporary objects");
    let selector = format!("{CLEANUP_LABEL_KEY}={owner_uid}");
    let mut errs = Vec::new();

    if let Err(e) = bulk_delete::<PersistentVolumeClaim>(client, namespace, &selector).await {
        errs.push(e);
    }
    if let Err(e) = bulk_delete::<ConfigMap>(client, namespace, &selector).await {
        errs.push(e);
    }
    if let Err(e) = bulk_delete::<Secret>(client, namespace, &selector).await {
        errs.push(e);
    }
    if let Err(e) = bulk_delete::<Pod>(client, namespace, &selector).await {
        errs.push(e);
    }
    for ar in [volume_snapshot_api_resource(), route_api_resource()] {
        if let Err(e) = bulk_delete_dynamic(client, &ar, namespace, &selector).await {
            errs.push(e);
        }
    }

    if let Err(e) = delete_services_individually(client, namespace, &selector).await {
        errs.push(e);
    }

    Error::aggregate(errs)
}

async fn bulk_delete<K>(client: &Client, namespace: &str, selector: &str) -> Result<()>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + DeserializeOwned
        + std::fmt::Debug,
    K::DynamicType: Default,
{
    let api: Api<K> = Api::namespaced(client.clone(), namespace);
    match api
        .delete_collection(&background_delete(), &ListParams::default().labels(selector))
        .await
    {
        Ok(_) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn bulk_delete_dynamic(
    client: &Client,
    ar: &ApiResource,
    namespace: &str,
    selector: &str,
) -> Result<()> {
    let api: Api<DynamicObject> = Api::namespaced_with(client.clone(), namespace, ar);
    match api
        .delete_collection(&background_delete(), &ListParams::default().labels(selector))
        .await
    {
        Ok(_) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn delete_services_individually(
    client: &Client,
    namespace: &str,
    selector: &str,
) -> Result<()> {
    let api: Api<Service> = Api::namespaced(client.clone(), namespace);
    let list = api.list(&ListParams::default().labels(selector)).await?;

    let mut errs = Vec::new();
    for svc in list.items {
        let Some(name) = svc.metadata.name.as_deref() else {
            continue;
        };
        match api.delete(name, &background_delete()).await {
            Ok(_) => {}
            Err(e) if is_not_found(&e) => {}
            Err(e) => errs.push(e.into()),
        }
    }
    Error::aggregate(errs)
}

fn background_delete() -> DeleteParams {
    DeleteParams {
        propagation_policy: Some(PropagationPolicy::Background),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn route_resource_targets_openshift_group() {
        let ar = route_api_resource();
        assert_eq!(ar.api_version, "route.openshift.io/v1");
        assert_eq!(ar.plural, "routes");
    }

    #[test]
    fn snapshot_resource_targets_csi_group() {
        let ar = volume_snapshot_api_resource();
        assert_eq!(ar.api_version, "snapshot.storage.k8s.io/v1");
        assert_eq!(ar.kind, "VolumeSnapshot");
    }

    #[test]
    fn delete_propagation_is_background() {
        let dp = background_delete();
        assert!(matches!(
            dp.propagation_policy,
            Some(PropagationPolicy::Background)
        ));
    }
}

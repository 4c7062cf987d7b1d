//! Transfer abstraction: the processes that move the bytes
//!
//! A transfer is a (server, client) pair implementing a data-copy
//! protocol on top of a [`crate::transport::Transport`] and a
//! [`crate::endpoint::Endpoint`]. The only implementation here is rsync
//! ([`rsync`]): a long-running daemon pod on the destination and one-shot
//! client pods on the source.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::Client as KubeClient;

use crate::endpoint::Endpoint;
use crate::error::{is_not_found, Error};
use crate::meta::NamespacedName;
use crate::pvc::PvcList;
use crate::transport::Transport;
use crate::Result;

pub mod rsync;

/// Progress of a transfer attempt
#[derive(Clone, Debug, PartialEq)]
pub enum TransferStatus {
    /// The transfer is still copying
    Running {
        /// When the pod reported itself started
        started_at: Option<DateTime<Utc>>,
    },
    /// The transfer finished
    Completed {
        /// Whether every container exited zero
        successful: bool,
        /// When the last container terminated
        finished_at: Option<DateTime<Utc>>,
    },
}

/// The server side of a transfer: a daemon pod on the destination
#[async_trait]
pub trait Server: Send + Sync {
    /// The endpoint publishing this server's coordinates
    fn endpoint(&self) -> &dyn Endpoint;

    /// The transport wrapping the data protocol
    fn transport(&self) -> &dyn Transport;

    /// Port the server process listens on inside the pod
    fn listen_port(&self) -> i32;

    /// Volumes this transfer serves
    fn pvcs(&self) -> &PvcList;

    /// Whether the server pod exists with every container ready
    async fn is_healthy(&self, client: &KubeClient) -> Result<bool>;

    /// Whether the current transfer attempt has finished
    async fn completed(&self, client: &KubeClient) -> Result<bool>;

    /// Attach the cleanup label to every object this transfer created
    async fn mark_for_cleanup(&self, client: &KubeClient, key: &str, value: &str) -> Result<()>;
}

/// The client side of a transfer: one-shot pods on the source
#[async_trait]
pub trait Client: Send + Sync {
    /// The transport wrapping the data protocol
    fn transport(&self) -> &dyn Transport;

    /// Volumes this transfer sends
    fn pvcs(&self) -> &PvcList;

    /// Aggregated status across the per-PVC pods
    async fn status(&self, client: &KubeClient) -> Result<TransferStatus>;

    /// Whether every per-PVC pod has fully terminated
    async fn is_completed(&self, client: &KubeClient) -> Result<bool>;

    /// Attach the cleanup label to every object this transfer created
    async fn mark_for_cleanup(&self, client: &KubeClient, key: &str, value: &str) -> Result<()>;
}

/// Expected container count in a transfer server pod (payload + sidecar)
const SERVER_CONTAINER_COUNT: usize = 2;

/// Whether the named pod exists with all containers ready.
///
/// A missing pod is "not healthy yet". A pod with the wrong number of
/// container statuses is malformed and reported as an error.
pub(crate) async fn is_pod_healthy(client: &KubeClient, pod: &NamespacedName) -> Result<bool> {
    let api: Api<Pod> = Api::namespaced(client.clone(), &pod.namespace);
    match api.get(&pod.name).await {
        Ok(p) => are_containers_ready(pod, &p),
        Err(e) if is_not_found(&e) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Whether the named container in the pod has terminated. A missing pod
/// counts as "not completed yet".
pub(crate) async fn is_pod_completed(
    client: &KubeClient,
    pod: &NamespacedName,
    container_name: &str,
) -> Result<bool> {
    let api: Api<Pod> = Api::namespaced(client.clone(), &pod.namespace);
    let p = match api.get(&pod.name).await {
        Ok(p) => p,
        Err(e) if is_not_found(&e) => return Ok(false),
        Err(e) => return Err(e.into()),
    };

    let statuses = p
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .cloned()
        .unwrap_or_default();
    if statuses.len() != SERVER_CONTAINER_COUNT {
        return Err(Error::internal(
            "transfer",
            format!(
                "expected {SERVER_CONTAINER_COUNT} container statuses, found {} for pod {pod}",
                statuses.len()
            ),
        ));
    }

    Ok(statuses
        .iter()
        .find(|cs| cs.name == container_name)
        .is_some_and(|cs| cs.state.as_ref().is_some_and(|s| s.terminated.is_some())))
}

fn are_containers_ready(key: &NamespacedName, pod: &Pod) -> Result<bool> {
    let statuses = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .cloned()
        .unwrap_or_default();
    if statuses.len() != SERVER_CONTAINER_COUNT {
        return Err(Error::internal(
            "transfer",
            format!(
                "expected {SERVER_CONTAINER_COUNT} container statuses, found {} for pod {key}",
                statuses.len()
            ),
        ));
    }

    Ok(statuses.iter().all(|cs| cs.ready))
}

/// Whether every container of the pod has terminated
pub(crate) fn all_containers_terminated(pod: &Pod) -> bool {
    let statuses = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .cloned()
        .unwrap_or_default();
    !statuses.is_empty()
        && statuses
            .iter()
            .all(|cs| cs.state.as_ref().is_some_and(|s| s.terminated.is_some()))
}

/// Whether every terminated container of the pod exited zero
pub(crate) fn all_containers_succeeded(pod: &Pod) -> bool {
    let statuses = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .cloned()
        .unwrap_or_default();
    statuses.iter().all(|cs| {
        cs.state
            .as_ref()
            .and_then(|s| s.terminated.as_ref())
            .is_some_and(|t| t.exit_code == 0)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateRunning, ContainerStateTerminated, ContainerStatus,
        PodStatus,
    };

    fn status(name: &str, ready: bool, terminated: Option<i32>) -> ContainerStatus {
        ContainerStatus {
            name: name.to_string(),
            ready,
            state: Some(ContainerState {
                running: terminated.is_none().then(ContainerStateRunning::default),
                terminated: terminated.map(|exit_code| ContainerStateTerminated {
                    exit_code,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn pod_with(statuses: Vec<ContainerStatus>) -> Pod {
        Pod {
            status: Some(PodStatus {
                container_statuses: Some(statuses),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn both_containers_must_be_ready() {
        let key = NamespacedName::new("ns1", "rsync-server");
        let pod = pod_with(vec![
            status("rsync", true, None),
            status("stunnel", true, None),
        ]);
        assert!(are_containers_ready(&key, &pod).unwrap());

        let pod = pod_with(vec![
            status("rsync", true, None),
            status("stunnel", false, None),
        ]);
        assert!(!are_containers_ready(&key, &pod).unwrap());
    }

    #[test]
    fn wrong_container_count_is_an_error() {
        let key = NamespacedName::new("ns1", "rsync-server");
        let pod = pod_with(vec![status("rsync", true, None)]);
        assert!(are_containers_ready(&key, &pod).is_err());
    }

    #[test]
    fn termination_is_tracked_per_container() {
        let pod = pod_with(vec![
            status("rsync", false, Some(0)),
            status("stunnel", false, None),
        ]);
        assert!(!all_containers_terminated(&pod));

        let pod = pod_with(vec![
            status("rsync", false, Some(0)),
            status("stunnel", false, Some(0)),
        ]);
        assert!(all_containers_terminated(&pod));
        assert!(all_containers_succeeded(&pod));

        let pod = pod_with(vec![
            status("rsync", false, Some(1)),
            status("stunnel", false, Some(0)),
        ]);
        assert!(all_containers_terminated(&pod));
        assert!(!all_containers_succeeded(&pod));
    }

    #[test]
    fn pod_without_statuses_is_not_terminated() {
        assert!(!all_containers_terminated(&Pod::default()));
    }
}

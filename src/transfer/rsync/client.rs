//! Rsync client pods
//!
//! One one-shot pod per source PVC pushes data into the matching module
//! on the destination daemon. With the stunnel transport the rsync
//! invocation is wrapped in a loopback-wait loop, and a coordination
//! file on a shared emptyDir tells the tunnel sidecar when to exit, so
//! the whole pod reaches a well-defined terminal state.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, EmptyDirVolumeSource, EnvVar, PersistentVolumeClaimVolumeSource, Pod, PodSpec,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams, PostParams};
use kube::Client as KubeClient;
use tracing::{debug, info};

use crate::cleanup::label_for_cleanup;
use crate::error::Error;
use crate::meta::NamespacedName;
use crate::pvc::{PvcList, PvcRef};
use crate::transfer::{
    all_containers_succeeded, all_containers_terminated, TransferStatus,
};
use crate::transport::stunnel::{StunnelClient, STUNNEL_CONTAINER};
use crate::transport::{NullTransport, Transport, TransportOptions, TransportType};
use crate::Result;

use super::options::TransferOptions;
use super::{
    apply_container_mutations, apply_pod_mutations, mount_path, RSYNC_CONTAINER, RSYNC_IMAGE,
};

/// generateName prefix for client pods
const POD_GENERATE_NAME: &str = "rsync-";

/// Where the coordination emptyDir is mounted in both containers
const COMM_MOUNT_PATH: &str = "/usr/share/rsync";

/// Volume name of the coordination emptyDir
const COMM_VOLUME: &str = "rsync-communication";

/// File whose appearance tells the tunnel sidecar the copy is over
const DONE_FILE: &str = "/usr/share/rsync/rsync-client-container-done";

/// Seconds the client waits for the loopback tunnel to come up
const TUNNEL_WAIT_SECONDS: u32 = 120;

const SIDECAR_WAIT_SCRIPT: &str = "/bin/stunnel /etc/stunnel/stunnel.conf
while true
do test -f /usr/share/rsync/rsync-client-container-done
if [ $? -eq 0 ]
then
break
fi
done
exit 0";

/// The rsync client transfer on the source side
pub struct RsyncClient {
    pvc_list: PvcList,
    transport: Box<dyn Transport>,
    options: TransferOptions,
}

impl RsyncClient {
    /// Source data path through a loopback stunnel tunnel dialing the
    /// destination's ingress
    pub async fn with_stunnel(
        client: &KubeClient,
        server_hostname: impl Into<String>,
        ingress_port: i32,
        pvc_list: PvcList,
        options: TransferOptions,
    ) -> Result<Self> {
        let namespace = first_namespace(&pvc_list)?;
        let nn = NamespacedName::new(
            namespace,
            options.source_pod_meta.name().unwrap_or_default(),
        );
        let transport = StunnelClient::new(
            client,
            nn,
            server_hostname,
            ingress_port,
            TransportOptions {
                obj_meta: options.source_pod_meta.clone(),
                ..Default::default()
            },
        )
        .await?;
        Self::new(client, Box::new(transport), pvc_list, options).await
    }

    /// Source data path dialing the destination directly, no tunnel
    pub async fn with_null(
        client: &KubeClient,
        server_hostname: impl Into<String>,
        server_port: i32,
        pvc_list: PvcList,
        options: TransferOptions,
    ) -> Result<Self> {
        let transport = NullTransport::new(server_hostname, server_port);
        Self::new(client, Box::new(transport), pvc_list, options).await
    }

    /// Materialize one client pod per PVC around an already-built
    /// transport
    pub async fn new(
        client: &KubeClient,
        transport: Box<dyn Transport>,
        pvc_list: PvcList,
        options: TransferOptions,
    ) -> Result<Self> {
        let transfer = Self {
            pvc_list,
            transport,
            options,
        };
        let namespace = first_namespace(&transfer.pvc_list)?;
        transfer.ensure_pods(client, &namespace).await?;
        Ok(transfer)
    }

    async fn ensure_pods(&self, client: &KubeClient, namespace: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(client.clone(), namespace);

        // pods are generate-named; an existing generation is this
        // iteration resuming, not a conflict
        let existing = api
            .list(&ListParams::default().labels(&self.label_selector()))
            .await?;
        if !existing.items.is_empty() {
            debug!(namespace, count = existing.items.len(), "client pods already exist");
            return Ok(());
        }

        let (rsync_args, errs) = self.options.command.as_rsync_arguments();
        Error::aggregate(errs)?;

        let mut errs = Vec::new();
        for pvc in self.pvc_list.in_namespace(namespace).pvcs() {
            let pod = self.build_pod(pvc, &rsync_args);
            if let Err(e) = api.create(&PostParams::default(), &pod).await {
                errs.push(e.into());
            }
        }
        if errs.is_empty() {
            info!(namespace, "rsync client pods created");
        }
        Error::aggregate(errs)
    }

    fn label_selector(&self) -> String {
        self.options
            .source_pod_meta
            .labels()
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// The full rsync invocation for one PVC, without any shell wrapper
    fn rsync_invocation(&self, rsync_args: &[String], pvc: &PvcRef) -> String {
        let mut command = vec!["/usr/bin/rsync".to_string()];
        command.extend(rsync_args.iter().cloned());
        command.push(format!("{}/", mount_path(pvc)));
        command.push(format!(
            "rsync://{}@{}/{} --port {}",
            self.options.effective_username(),
            self.transport.hostname(),
            pvc.label_safe_name(),
            self.transport.listen_port(),
        ));
        command.join(" ")
    }

    /// The container command: a bare invocation over the null transport,
    /// or the tunnel-wait wrapper over stunnel
    fn container_command(&self, rsync_args: &[String], pvc: &PvcRef) -> Vec<String> {
        let invocation = self.rsync_invocation(rsync_args, pvc);
        let script = match self.transport.transport_type() {
            TransportType::Null => invocation,
            TransportType::Stunnel => format!(
                "trap \"touch {DONE_FILE}\" EXIT SIGINT SIGTERM; \
                 timeout={TUNNEL_WAIT_SECONDS}; SECONDS=0; \
                 while [ $SECONDS -lt $timeout ]; do \
                 nc -z localhost {port}; rc=$?; \
                 if [ $rc -eq 0 ]; then {invocation}; rc=$?; break; fi; \
                 done; exit $rc;",
                port = self.transport.listen_port(),
            ),
        };
        vec!["/bin/bash".to_string(), "-c".to_string(), script]
    }

    /// Transport sidecars adjusted for one-shot semantics: the stunnel
    /// container exits once the coordination file appears
    fn transport_sidecars(&self) -> Vec<Container> {
        let mut containers = self.transport.containers().to_vec();
        if self.transport.transport_type() != TransportType::Stunnel {
            return containers;
        }
        for container in &mut containers {
            if container.name == STUNNEL_CONTAINER {
                container.command = Some(vec![
                    "/bin/bash".to_string(),
                    "-c".to_string(),
                    SIDECAR_WAIT_SCRIPT.to_string(),
                ]);
                container
                    .volume_mounts
                    .get_or_insert_with(Vec::new)
                    .push(VolumeMount {
                        name: COMM_VOLUME.to_string(),
                        mount_path: COMM_MOUNT_PATH.to_string(),
                        ..Default::default()
                    });
            }
        }
        containers
    }

    fn build_pod(&self, pvc: &PvcRef, rsync_args: &[String]) -> Pod {
        let mut containers = vec![Container {
            name: RSYNC_CONTAINER.to_string(),
            image: Some(RSYNC_IMAGE.to_string()),
            command: Some(self.container_command(rsync_args, pvc)),
            env: Some(vec![EnvVar {
                name: "RSYNC_PASSWORD".to_string(),
                value: Some(self.options.supplied_password().unwrap_or_default().to_string()),
                ..Default::default()
            }]),
            volume_mounts: Some(vec![
                VolumeMount {
                    name: "mnt".to_string(),
                    mount_path: mount_path(pvc),
                    ..Default::default()
                },
                VolumeMount {
                    name: COMM_VOLUME.to_string(),
                    mount_path: COMM_MOUNT_PATH.to_string(),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }];
        containers.extend(self.transport_sidecars());
        for container in &mut containers {
            apply_container_mutations(container, &self.options.source_container_mutations);
        }

        let mut volumes = vec![
            Volume {
                name: "mnt".to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: pvc.name().to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            },
            Volume {
                name: COMM_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            },
        ];
        volumes.extend_from_slice(self.transport.volumes());

        let mut spec = PodSpec {
            containers,
            volumes: Some(volumes),
            restart_policy: Some("Never".to_string()),
            ..Default::default()
        };
        apply_pod_mutations(&mut spec, &self.options.source_pod_mutations);

        Pod {
            metadata: ObjectMeta {
                generate_name: Some(POD_GENERATE_NAME.to_string()),
                namespace: Some(pvc.namespace().to_string()),
                labels: Some(self.options.source_pod_meta.labels()),
                owner_references: Some(self.options.source_pod_meta.owner_references()),
                ..Default::default()
            },
            spec: Some(spec),
            ..Default::default()
        }
    }

    async fn list_pods(&self, client: &KubeClient) -> Result<Vec<Pod>> {
        let namespace = first_namespace(&self.pvc_list)?;
        let api: Api<Pod> = Api::namespaced(client.clone(), &namespace);
        let list = api
            .list(&ListParams::default().labels(&self.label_selector()))
            .await?;
        Ok(list.items)
    }
}

fn first_namespace(pvc_list: &PvcList) -> Result<String> {
    pvc_list
        .namespaces()
        .first()
        .cloned()
        .ok_or_else(|| Error::validation("transfer requires at least one PVC"))
}

#[async_trait]
impl crate::transfer::Client for RsyncClient {
    fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    fn pvcs(&self) -> &PvcList {
        &self.pvc_list
    }

    async fn status(&self, client: &KubeClient) -> Result<TransferStatus> {
        let pods = self.list_pods(client).await?;
        if pods.is_empty() {
            return Ok(TransferStatus::Running { started_at: None });
        }

        // status aggregates with AND: one unfinished pod keeps the whole
        // transfer running
        if pods.iter().all(all_containers_terminated) {
            let successful = pods.iter().all(all_containers_succeeded);
            let finished_at = pods
                .iter()
                .flat_map(|p| p.status.iter())
                .flat_map(|s| s.container_statuses.iter().flatten())
                .filter_map(|cs| cs.state.as_ref())
                .filter_map(|s| s.terminated.as_ref())
                .filter_map(|t| t.finished_at.as_ref())
                .map(|t| t.0)
                .max();
            return Ok(TransferStatus::Completed {
                successful,
                finished_at,
            });
        }

        let started_at = pods
            .iter()
            .filter_map(|p| p.status.as_ref())
            .filter_map(|s| s.start_time.as_ref())
            .map(|t| t.0)
            .min();
        Ok(TransferStatus::Running { started_at })
    }

    async fn is_completed(&self, client: &KubeClient) -> Result<bool> {
        let pods = self.list_pods(client).await?;
        Ok(!pods.is_empty() && pods.iter().all(all_containers_terminated))
    }

    async fn mark_for_cleanup(&self, client: &KubeClient, key: &str, value: &str) -> Result<()> {
        let pods = self.list_pods(client).await?;
        let mut errs = Vec::new();
        for pod in &pods {
            let (Some(ns), Some(name)) = (pod.metadata.namespace.as_deref(), pod.metadata.name.as_deref())
            else {
                continue;
            };
            if let Err(e) = label_for_cleanup::<Pod>(client, ns, name, key, value).await {
                errs.push(e);
            }
        }
        if let Err(e) = self.transport.mark_for_cleanup(client, key, value).await {
            errs.push(e);
        }
        Error::aggregate(errs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::ObjectMetaMutation;
    use crate::transport::stunnel::CLIENT_LISTEN_PORT;
    use k8s_openapi::api::core::v1::PersistentVolumeClaim;
    use std::collections::BTreeMap;

    fn pvc(ns: &str, name: &str) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                namespace: Some(ns.to_string()),
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn source_meta() -> ObjectMetaMutation {
        let mut labels = BTreeMap::new();
        labels.insert(
            "app.kubernetes.io/name".to_string(),
            "volrep-src-x".to_string(),
        );
        ObjectMetaMutation::merge("src", "ns0", labels, vec![])
    }

    fn stunnel_client() -> RsyncClient {
        RsyncClient {
            pvc_list: PvcList::singleton(pvc("ns0", "src")),
            transport: Box::new(crate::transport::stunnel::test_support::client(
                "ns0",
                "src",
                "h.example",
                443,
            )),
            options: TransferOptions::default_options()
                .source_meta(source_meta())
                .username("root")
                .password("sekrit"),
        }
    }

    fn null_client() -> RsyncClient {
        RsyncClient {
            pvc_list: PvcList::singleton(pvc("ns0", "src")),
            transport: Box::new(NullTransport::new("lb.example", 8080)),
            options: TransferOptions::default_options()
                .source_meta(source_meta())
                .username("root")
                .password("sekrit"),
        }
    }

    #[test]
    fn stunnel_invocation_dials_loopback_tunnel() {
        let client = stunnel_client();
        let (args, errs) = client.options.command.as_rsync_arguments();
        assert!(errs.is_empty());
        let invocation = client.rsync_invocation(&args, &client.pvc_list.pvcs()[0]);
        assert!(invocation.starts_with("/usr/bin/rsync --recursive"));
        assert!(invocation.contains("/mnt/ns0/src/"));
        assert!(invocation.ends_with(&format!(
            "rsync://root@localhost/src --port {CLIENT_LISTEN_PORT}"
        )));
    }

    #[test]
    fn null_invocation_dials_the_endpoint_directly() {
        let client = null_client();
        let (args, _) = client.options.command.as_rsync_arguments();
        let invocation = client.rsync_invocation(&args, &client.pvc_list.pvcs()[0]);
        assert!(invocation.ends_with("rsync://root@lb.example/src --port 8080"));
    }

    #[test]
    fn null_command_is_a_bare_invocation() {
        let client = null_client();
        let (args, _) = client.options.command.as_rsync_arguments();
        let command = client.container_command(&args, &client.pvc_list.pvcs()[0]);
        assert_eq!(command[0], "/bin/bash");
        assert_eq!(command[1], "-c");
        assert!(!command[2].contains("nc -z"));
        assert!(!command[2].contains("trap"));
    }

    #[test]
    fn stunnel_command_waits_for_the_tunnel_and_touches_done_file() {
        let client = stunnel_client();
        let (args, _) = client.options.command.as_rsync_arguments();
        let command = client.container_command(&args, &client.pvc_list.pvcs()[0]);
        let script = &command[2];
        assert!(script.contains(&format!("nc -z localhost {CLIENT_LISTEN_PORT}")));
        assert!(script.contains("timeout=120"));
        assert!(script.contains(
            "trap \"touch /usr/share/rsync/rsync-client-container-done\" EXIT SIGINT SIGTERM"
        ));
        assert!(script.ends_with("exit $rc;"));
    }

    #[test]
    fn stunnel_sidecar_is_rewritten_to_exit_on_done_file() {
        let client = stunnel_client();
        let sidecars = client.transport_sidecars();
        assert_eq!(sidecars.len(), 1);
        let command = sidecars[0].command.as_ref().unwrap();
        assert_eq!(command[0], "/bin/bash");
        assert!(command[2].contains("test -f /usr/share/rsync/rsync-client-container-done"));
        assert!(command[2].ends_with("exit 0"));
        let mounts = sidecars[0].volume_mounts.as_ref().unwrap();
        assert!(mounts.iter().any(|m| m.mount_path == COMM_MOUNT_PATH));
    }

    #[test]
    fn pod_is_one_shot_with_shared_emptydir() {
        let client = stunnel_client();
        let (args, _) = client.options.command.as_rsync_arguments();
        let pod = client.build_pod(&client.pvc_list.pvcs()[0], &args);
        assert_eq!(pod.metadata.generate_name.as_deref(), Some("rsync-"));

        let spec = pod.spec.unwrap();
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.containers.len(), 2);

        let volume_names: Vec<&str> = spec
            .volumes
            .as_ref()
            .unwrap()
            .iter()
            .map(|v| v.name.as_str())
            .collect();
        assert!(volume_names.contains(&"mnt"));
        assert!(volume_names.contains(&COMM_VOLUME));

        let env = spec.containers[0].env.as_ref().unwrap();
        assert_eq!(env[0].name, "RSYNC_PASSWORD");
        assert_eq!(env[0].value.as_deref(), Some("sekrit"));
    }

    #[test]
    fn null_pod_has_no_sidecar() {
        let client = null_client();
        let (args, _) = client.options.command.as_rsync_arguments();
        let pod = client.build_pod(&client.pvc_list.pvcs()[0], &args);
        assert_eq!(pod.spec.unwrap().containers.len(), 1);
    }

    #[test]
    fn label_selector_matches_source_meta() {
        let client = stunnel_client();
        assert_eq!(
            client.label_selector(),
            "app.kubernetes.io/name=volrep-src-x"
        );
    }
}

//! Rsync daemon server
//!
//! Materializes the destination side: an `rsyncd.conf` configmap, a
//! credentials secret, and the long-running `rsync-server` pod serving
//! one module per PVC. When the transport is stunnel the daemon only
//! accepts loopback traffic, so every byte must arrive through the
//! tunnel.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, KeyToPath,
    PersistentVolumeClaimVolumeSource, Pod, PodSpec, Secret, SecretVolumeSource, Volume,
    VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, PostParams};
use kube::Client as KubeClient;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use tracing::{debug, info};

use crate::cleanup::label_for_cleanup;
use crate::endpoint::load_balancer::LoadBalancerEndpoint;
use crate::endpoint::route::RouteEndpoint;
use crate::endpoint::Endpoint;
use crate::error::{is_already_exists, Error};
use crate::meta::NamespacedName;
use crate::pvc::PvcList;
use crate::transport::stunnel::{render_conf, StunnelServer};
use crate::transport::{NullTransport, Transport, TransportOptions, TransportType};
use crate::Result;

use super::options::TransferOptions;
use super::{
    apply_container_mutations, apply_pod_mutations, mount_path, RSYNC_CONFIG_NAME,
    RSYNC_CONTAINER, RSYNC_IMAGE, RSYNC_SECRET_NAME,
};

/// Name of the long-running daemon pod
pub const RSYNC_SERVER_POD: &str = "rsync-server";

/// Ingress port of the load-balancer endpoint used with the null transport
pub const NULL_TRANSPORT_INGRESS_PORT: i32 = 8080;

/// Backend port of the load-balancer endpoint used with the null transport
pub const NULL_TRANSPORT_BACKEND_PORT: i32 = 2222;

const PASSWORD_LENGTH: usize = 24;

const RSYNCD_CONF_TEMPLATE: &str = "\
syslog facility = local7
read only = no
list = yes
log file = /dev/stdout
max verbosity = 4
auth users = {{ username }}
{%- if allow_localhost_only %}
hosts allow = ::1, 127.0.0.1, localhost
{%- else %}
hosts allow = *.*.*.*, *
{%- endif %}
uid = root
gid = root
{% for pvc in pvcs %}
[{{ pvc.label_safe_name }}]
    comment = archive for {{ pvc.namespace }}/{{ pvc.name }}
    path = /mnt/{{ pvc.namespace }}/{{ pvc.label_safe_name }}
    use chroot = no
    munge symlinks = no
    list = yes
    read only = false
    auth users = {{ username }}
    secrets file = /etc/rsync-secret/rsyncd.secrets
{% endfor %}";

#[derive(Serialize)]
struct ModuleContext {
    label_safe_name: String,
    namespace: String,
    name: String,
}

/// The rsync daemon transfer on the destination side
pub struct RsyncServer {
    pvc_list: PvcList,
    transport: Box<dyn Transport>,
    endpoint: Box<dyn Endpoint>,
    listen_port: i32,
    options: TransferOptions,
}

impl RsyncServer {
    /// Destination data path behind a passthrough route and an stunnel
    /// tunnel.
    ///
    /// The route must be admitted before the tunnel can bind to its
    /// backend port; until then construction fails with a transient
    /// error and the next iteration retries.
    pub async fn with_stunnel(
        client: &KubeClient,
        pvc_list: PvcList,
        options: TransferOptions,
    ) -> Result<Self> {
        let (namespace, name) = destination_identity(&pvc_list, &options)?;
        let nn = NamespacedName::new(&namespace, &name);

        let mut endpoint =
            RouteEndpoint::new(client, nn.clone(), options.destination_pod_meta.clone()).await?;
        if !endpoint.is_healthy(client).await? {
            return Err(Error::EndpointNotReady {
                namespace,
                name,
            });
        }

        let transport = StunnelServer::new(
            client,
            nn,
            &endpoint,
            TransportOptions {
                obj_meta: options.destination_pod_meta.clone(),
                ..Default::default()
            },
        )
        .await?;

        Self::new(client, pvc_list, Box::new(transport), Box::new(endpoint), options).await
    }

    /// Destination data path behind a plain load balancer, no tunnel
    pub async fn with_null(
        client: &KubeClient,
        pvc_list: PvcList,
        options: TransferOptions,
    ) -> Result<Self> {
        let (namespace, name) = destination_identity(&pvc_list, &options)?;
        let nn = NamespacedName::new(&namespace, &name);

        let mut endpoint = LoadBalancerEndpoint::new(
            client,
            nn,
            options.destination_pod_meta.clone(),
            NULL_TRANSPORT_BACKEND_PORT,
            NULL_TRANSPORT_INGRESS_PORT,
        )
        .await?;
        if !endpoint.is_healthy(client).await? {
            return Err(Error::EndpointNotReady {
                namespace,
                name,
            });
        }

        let hostname = endpoint
            .hostname()
            .unwrap_or_default()
            .to_string();
        let transport = NullTransport::new(hostname, endpoint.backend_port());

        Self::new(client, pvc_list, Box::new(transport), Box::new(endpoint), options).await
    }

    /// Materialize config, credentials, and the daemon pod around an
    /// already-built transport and endpoint.
    pub async fn new(
        client: &KubeClient,
        pvc_list: PvcList,
        transport: Box<dyn Transport>,
        endpoint: Box<dyn Endpoint>,
        mut options: TransferOptions,
    ) -> Result<Self> {
        let namespace = pvc_list
            .namespaces()
            .first()
            .cloned()
            .ok_or_else(|| Error::validation("transfer requires at least one PVC"))?;

        // the daemon and the secret must agree on the password, so settle
        // it before anything is persisted
        if options.supplied_password().is_none() {
            options.set_password(generate_password());
            debug!("generated rsync daemon password");
        }

        let server = Self {
            listen_port: transport.connect_port(),
            pvc_list,
            transport,
            endpoint,
            options,
        };

        server.ensure_config(client, &namespace).await?;
        server.ensure_secret(client, &namespace).await?;
        server.ensure_pod(client, &namespace).await?;
        info!(namespace = %namespace, pod = RSYNC_SERVER_POD, "rsync server materialized");

        Ok(server)
    }

    fn render_config(&self, namespace: &str) -> Result<String> {
        let allow_localhost_only = self.transport.transport_type() == TransportType::Stunnel;
        let pvcs: Vec<ModuleContext> = self
            .pvc_list
            .in_namespace(namespace)
            .pvcs()
            .iter()
            .map(|p| ModuleContext {
                label_safe_name: p.label_safe_name().to_string(),
                namespace: p.namespace().to_string(),
                name: p.name().to_string(),
            })
            .collect();

        render_conf(
            RSYNCD_CONF_TEMPLATE,
            minijinja::context! {
                username => self.options.effective_username(),
                allow_localhost_only => allow_localhost_only,
                pvcs => pvcs,
            },
        )
    }

    fn build_config_map(&self, namespace: &str) -> Result<ConfigMap> {
        Ok(ConfigMap {
            metadata: ObjectMeta {
                name: Some(RSYNC_CONFIG_NAME.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(self.options.destination_pod_meta.labels()),
                owner_references: Some(self.options.destination_pod_meta.owner_references()),
                ..Default::default()
            },
            data: Some([("rsyncd.conf".to_string(), self.render_config(namespace)?)].into()),
            ..Default::default()
        })
    }

    fn build_secret(&self, namespace: &str) -> Secret {
        let credentials = format!(
            "{}:{}",
            self.options.effective_username(),
            self.options.supplied_password().unwrap_or_default()
        );
        Secret {
            metadata: ObjectMeta {
                name: Some(RSYNC_SECRET_NAME.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(self.options.destination_pod_meta.labels()),
                owner_references: Some(self.options.destination_pod_meta.owner_references()),
                ..Default::default()
            },
            data: Some(
                [(
                    "credentials".to_string(),
                    ByteString(credentials.into_bytes()),
                )]
                .into(),
            ),
            ..Default::default()
        }
    }

    fn rsync_container(&self, volume_mounts: Vec<VolumeMount>) -> Container {
        Container {
            name: RSYNC_CONTAINER.to_string(),
            image: Some(RSYNC_IMAGE.to_string()),
            command: Some(vec![
                "/usr/bin/rsync".to_string(),
                "--daemon".to_string(),
                "--no-detach".to_string(),
                format!("--port={}", self.listen_port),
                "-vvv".to_string(),
            ]),
            ports: Some(vec![ContainerPort {
                name: Some("rsyncd".to_string()),
                protocol: Some("TCP".to_string()),
                container_port: self.listen_port,
                ..Default::default()
            }]),
            volume_mounts: Some(volume_mounts),
            ..Default::default()
        }
    }

    fn build_pod(&self, namespace: &str) -> Pod {
        let mut volume_mounts = config_volume_mounts();
        volume_mounts.extend(self.pvc_volume_mounts(namespace));

        let mut containers = vec![self.rsync_container(volume_mounts)];
        containers.extend_from_slice(self.transport.containers());
        for container in &mut containers {
            apply_container_mutations(container, &self.options.destination_container_mutations);
        }

        let mut volumes = self.pvc_volumes(namespace);
        volumes.extend(config_volumes());
        volumes.extend_from_slice(self.transport.volumes());

        let mut spec = PodSpec {
            containers,
            volumes: Some(volumes),
            ..Default::default()
        };
        apply_pod_mutations(&mut spec, &self.options.destination_pod_mutations);

        Pod {
            metadata: ObjectMeta {
                name: Some(RSYNC_SERVER_POD.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(self.options.destination_pod_meta.labels()),
                owner_references: Some(self.options.destination_pod_meta.owner_references()),
                ..Default::default()
            },
            spec: Some(spec),
            ..Default::default()
        }
    }

    fn pvc_volume_mounts(&self, namespace: &str) -> Vec<VolumeMount> {
        self.pvc_list
            .in_namespace(namespace)
            .pvcs()
            .iter()
            .map(|pvc| VolumeMount {
                name: pvc.label_safe_name().to_string(),
                mount_path: mount_path(pvc),
                ..Default::default()
            })
            .collect()
    }

    fn pvc_volumes(&self, namespace: &str) -> Vec<Volume> {
        self.pvc_list
            .in_namespace(namespace)
            .pvcs()
            .iter()
            .map(|pvc| Volume {
                name: pvc.label_safe_name().to_string(),
                persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                    claim_name: pvc.name().to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect()
    }

    async fn ensure_config(&self, client: &KubeClient, namespace: &str) -> Result<()> {
        let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
        match api
            .create(&PostParams::default(), &self.build_config_map(namespace)?)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_already_exists(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_secret(&self, client: &KubeClient, namespace: &str) -> Result<()> {
        let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
        match api
            .create(&PostParams::default(), &self.build_secret(namespace))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_already_exists(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn ensure_pod(&self, client: &KubeClient, namespace: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(client.clone(), namespace);
        match api
            .create(&PostParams::default(), &self.build_pod(namespace))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_already_exists(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn server_pod_key(&self) -> Result<NamespacedName> {
        let namespace = self
            .pvc_list
            .namespaces()
            .first()
            .cloned()
            .ok_or_else(|| Error::validation("transfer requires at least one PVC"))?;
        Ok(NamespacedName::new(namespace, RSYNC_SERVER_POD))
    }
}

fn destination_identity(
    pvc_list: &PvcList,
    options: &TransferOptions,
) -> Result<(String, String)> {
    let namespace = pvc_list
        .namespaces()
        .first()
        .cloned()
        .ok_or_else(|| Error::validation("transfer requires at least one PVC"))?;
    let name = options
        .destination_pod_meta
        .name()
        .ok_or_else(|| {
            Error::validation_for_field(
                "destinationPodMeta.name",
                "destination metadata must carry an object name",
            )
        })?
        .to_string();
    Ok((namespace, name))
}

fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}

fn config_volume_mounts() -> Vec<VolumeMount> {
    vec![
        VolumeMount {
            name: RSYNC_CONFIG_NAME.to_string(),
            mount_path: "/etc/rsyncd.conf".to_string(),
            sub_path: Some("rsyncd.conf".to_string()),
            ..Default::default()
        },
        VolumeMount {
            name: RSYNC_SECRET_NAME.to_string(),
            mount_path: "/etc/rsync-secret".to_string(),
            ..Default::default()
        },
    ]
}

fn config_volumes() -> Vec<Volume> {
    vec![
        Volume {
            name: RSYNC_CONFIG_NAME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: RSYNC_CONFIG_NAME.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: RSYNC_SECRET_NAME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(RSYNC_SECRET_NAME.to_string()),
                default_mode: Some(0o600),
                items: Some(vec![KeyToPath {
                    key: "credentials".to_string(),
                    path: "rsyncd.secrets".to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        },
    ]
}

#[async_trait]
impl crate::transfer::Server for RsyncServer {
    fn endpoint(&self) -> &dyn Endpoint {
        self.endpoint.as_ref()
    }

    fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    fn listen_port(&self) -> i32 {
        self.listen_port
    }

    fn pvcs(&self) -> &PvcList {
        &self.pvc_list
    }

    async fn is_healthy(&self, client: &KubeClient) -> Result<bool> {
        crate::transfer::is_pod_healthy(client, &self.server_pod_key()?).await
    }

    async fn completed(&self, client: &KubeClient) -> Result<bool> {
        crate::transfer::is_pod_completed(client, &self.server_pod_key()?, RSYNC_CONTAINER).await
    }

    async fn mark_for_cleanup(&self, client: &KubeClient, key: &str, value: &str) -> Result<()> {
        let pod_key = self.server_pod_key()?;
        let ns = &pod_key.namespace;
        label_for_cleanup::<Pod>(client, ns, RSYNC_SERVER_POD, key, value).await?;
        label_for_cleanup::<ConfigMap>(client, ns, RSYNC_CONFIG_NAME, key, value).await?;
        label_for_cleanup::<Secret>(client, ns, RSYNC_SECRET_NAME, key, value).await?;
        self.endpoint.mark_for_cleanup(client, key, value).await?;
        self.transport.mark_for_cleanup(client, key, value).await
    }
}

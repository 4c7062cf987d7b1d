//! stunnel transport: TLS 1.2 tunnel for the rsync data path
//!
//! Both directions share the sidecar shape: an stunnel container with
//! the rendered config and the TLS secret mounted. The server accepts on
//! the endpoint's backend port and relays to the local rsync daemon; the
//! client accepts on loopback and relays to the remote endpoint.

use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapVolumeSource, Container, ContainerPort, KeyToPath,
    SecretVolumeSource, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, PostParams};
use kube::Client;

use crate::error::is_already_exists;
use crate::meta::ObjectMetaMutation;
use crate::Result;

mod client;
mod server;

pub use client::StunnelClient;
pub use server::StunnelServer;

/// Name of the stunnel sidecar container
pub const STUNNEL_CONTAINER: &str = "stunnel";

/// Fixed configmap name holding `stunnel.conf`
pub const STUNNEL_CONFIG_NAME: &str = "volrep-stunnel-config";

/// Fixed secret name holding `tls.crt`/`tls.key`
pub const STUNNEL_SECRET_NAME: &str = "volrep-stunnel-secret";

/// Port the server-side tunnel relays to (the rsync daemon's port)
pub const SERVER_CONNECT_PORT: i32 = 8080;

/// Loopback port the client-side tunnel accepts rsync connections on
pub const CLIENT_LISTEN_PORT: i32 = 6443;

const STUNNEL_IMAGE: &str = "quay.io/volrep/stunnel:latest";

/// Render a config template with the given context
pub(crate) fn render_conf(template: &str, ctx: impl serde::Serialize) -> Result<String> {
    let env = minijinja::Environment::new();
    Ok(env.render_str(template, ctx)?)
}

/// The stunnel sidecar, identical for both tunnel directions
pub(crate) fn stunnel_container(listen_port: i32) -> Container {
    Container {
        name: STUNNEL_CONTAINER.to_string(),
        image: Some(STUNNEL_IMAGE.to_string()),
        command: Some(vec![
            "/bin/stunnel".to_string(),
            "/etc/stunnel/stunnel.conf".to_string(),
        ]),
        ports: Some(vec![ContainerPort {
            name: Some("stunnel".to_string()),
            protocol: Some("TCP".to_string()),
            container_port: listen_port,
            ..Default::default()
        }]),
        volume_mounts: Some(vec![
            VolumeMount {
                name: STUNNEL_CONFIG_NAME.to_string(),
                mount_path: "/etc/stunnel/stunnel.conf".to_string(),
                sub_path: Some("stunnel.conf".to_string()),
                ..Default::default()
            },
            VolumeMount {
                name: STUNNEL_SECRET_NAME.to_string(),
                mount_path: "/etc/stunnel/certs".to_string(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    }
}

/// Volumes backing the sidecar's mounts
pub(crate) fn stunnel_volumes() -> Vec<Volume> {
    vec![
        Volume {
            name: STUNNEL_CONFIG_NAME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: STUNNEL_CONFIG_NAME.to_string(),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: STUNNEL_SECRET_NAME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(STUNNEL_SECRET_NAME.to_string()),
                items: Some(vec![
                    KeyToPath {
                        key: "tls.crt".to_string(),
                        path: "tls.crt".to_string(),
                        ..Default::default()
                    },
                    KeyToPath {
                        key: "tls.key".to_string(),
                        path: "tls.key".to_string(),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }),
            ..Default::default()
        },
    ]
}

/// Persist `stunnel.conf` under the fixed configmap name (idempotent)
pub(crate) async fn ensure_config_map(
    client: &Client,
    namespace: &str,
    meta: &ObjectMetaMutation,
    conf: String,
) -> Result<()> {
    let cm = ConfigMap {
        metadata: ObjectMeta {
            name: Some(STUNNEL_CONFIG_NAME.to_string()),
            namespace: Some(namespace.to_string()),
            labels: Some(meta.labels()),
            owner_references: Some(meta.owner_references()),
            ..Default::default()
        },
        data: Some([("stunnel.conf".to_string(), conf)].into()),
        ..Default::default()
    };

    let api: Api<ConfigMap> = Api::namespaced(client.clone(), namespace);
    match api.create(&PostParams::default(), &cm).await {
        Ok(_) => Ok(()),
        Err(e) if is_already_exists(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::meta::NamespacedName;

    /// A server-side tunnel assembled without touching the API
    pub(crate) fn server(ns: &str, name: &str, listen_port: i32) -> StunnelServer {
        StunnelServer::assembled(NamespacedName::new(ns, name), listen_port)
    }

    /// A client-side tunnel assembled without touching the API
    pub(crate) fn client(
        ns: &str,
        name: &str,
        server_hostname: &str,
        ingress_port: i32,
    ) -> StunnelClient {
        StunnelClient::assembled(NamespacedName::new(ns, name), server_hostname, ingress_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sidecar_runs_stunnel_against_the_mounted_config() {
        let c = stunnel_container(2222);
        assert_eq!(c.name, "stunnel");
        assert_eq!(
            c.command.unwrap(),
            vec!["/bin/stunnel", "/etc/stunnel/stunnel.conf"]
        );
        assert_eq!(c.ports.unwrap()[0].container_port, 2222);

        let mounts = c.volume_mounts.unwrap();
        assert_eq!(mounts[0].mount_path, "/etc/stunnel/stunnel.conf");
        assert_eq!(mounts[0].sub_path.as_deref(), Some("stunnel.conf"));
        assert_eq!(mounts[1].mount_path, "/etc/stunnel/certs");
    }

    #[test]
    fn volumes_project_both_tls_keys() {
        let volumes = stunnel_volumes();
        assert_eq!(volumes[0].config_map.as_ref().unwrap().name, STUNNEL_CONFIG_NAME);
        let items = volumes[1].secret.as_ref().unwrap().items.as_ref().unwrap();
        let paths: Vec<&str> = items.iter().map(|i| i.path.as_str()).collect();
        assert_eq!(paths, vec!["tls.crt", "tls.key"]);
    }
}

//! Server-side stunnel transport
//!
//! Accepts TLS on the endpoint's backend port and relays plaintext to
//! the local rsync daemon on [`super::SERVER_CONNECT_PORT`]. Construction
//! provisions the TLS secret and the rendered config, then re-reads both
//! so a half-created state from a previous iteration is detected before
//! any pod references them.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, Secret, Volume};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::debug;

use crate::cleanup::label_for_cleanup;
use crate::endpoint::Endpoint;
use crate::error::{is_already_exists, is_not_found, Error};
use crate::meta::NamespacedName;
use crate::transport::tls::generate_tls_bundle;
use crate::transport::{Transport, TransportOptions, TransportType};
use crate::Result;

use super::{
    ensure_config_map, render_conf, stunnel_container, stunnel_volumes, SERVER_CONNECT_PORT,
    STUNNEL_CONFIG_NAME, STUNNEL_SECRET_NAME,
};

const SERVER_CONF_TEMPLATE: &str = "\
foreground = yes
pid =
socket = l:TCP_NODELAY=1
socket = r:TCP_NODELAY=1
debug = 7
sslVersion = TLSv1.2
[rsync]
accept = {{ accept_port }}
connect = {{ connect_port }}
key = /etc/stunnel/certs/tls.key
cert = /etc/stunnel/certs/tls.crt
TIMEOUTclose = 0
";

/// The server half of the stunnel tunnel
pub struct StunnelServer {
    namespaced_name: NamespacedName,
    listen_port: i32,
    connect_port: i32,
    crt: Vec<u8>,
    key: Vec<u8>,
    containers: Vec<Container>,
    volumes: Vec<Volume>,
    options: TransportOptions,
}

impl StunnelServer {
    /// Provision config and TLS secret, then assemble the sidecar.
    ///
    /// The endpoint must already be healthy: the tunnel accepts on its
    /// backend port.
    pub async fn new(
        client: &Client,
        namespaced_name: NamespacedName,
        endpoint: &dyn Endpoint,
        options: TransportOptions,
    ) -> Result<Self> {
        let mut server = Self {
            namespaced_name,
            listen_port: endpoint.backend_port(),
            connect_port: SERVER_CONNECT_PORT,
            crt: Vec::new(),
            key: Vec::new(),
            containers: Vec::new(),
            volumes: Vec::new(),
            options,
        };

        let conf = server.render_config()?;
        ensure_config_map(
            client,
            &server.namespaced_name.namespace,
            &server.options.obj_meta,
            conf,
        )
        .await?;
        server.ensure_secret(client).await?;
        server.load_credentials(client).await?;

        server.volumes = stunnel_volumes();
        server.containers = vec![stunnel_container(server.listen_port)];

        Ok(server)
    }

    fn render_config(&self) -> Result<String> {
        render_conf(
            SERVER_CONF_TEMPLATE,
            minijinja::context! {
                accept_port => self.listen_port,
                connect_port => self.connect_port,
            },
        )
    }

    async fn ensure_secret(&self, client: &Client) -> Result<()> {
        let bundle = generate_tls_bundle()?;
        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(STUNNEL_SECRET_NAME.to_string()),
                namespace: Some(self.namespaced_name.namespace.clone()),
                labels: Some(self.options.obj_meta.labels()),
                owner_references: Some(self.options.obj_meta.owner_references()),
                ..Default::default()
            },
            data: Some(
                [
                    (
                        "tls.crt".to_string(),
                        ByteString(bundle.crt_pem.into_bytes()),
                    ),
                    (
                        "tls.key".to_string(),
                        ByteString(bundle.key_pem.into_bytes()),
                    ),
                ]
                .into(),
            ),
            ..Default::default()
        };

        let api: Api<Secret> =
            Api::namespaced(client.clone(), &self.namespaced_name.namespace);
        match api.create(&PostParams::default(), &secret).await {
            Ok(_) => Ok(()),
            Err(e) if is_already_exists(&e) => {
                debug!(secret = STUNNEL_SECRET_NAME, "reusing existing tls secret");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read back the persisted TLS material; the authoritative copy is
    /// the secret, not whatever this iteration generated.
    async fn load_credentials(&mut self, client: &Client) -> Result<()> {
        let api: Api<Secret> =
            Api::namespaced(client.clone(), &self.namespaced_name.namespace);
        let secret = match api.get(STUNNEL_SECRET_NAME).await {
            Ok(secret) => secret,
            Err(e) if is_not_found(&e) => {
                return Err(Error::missing_credentials(
                    &self.namespaced_name.namespace,
                    STUNNEL_SECRET_NAME,
                    "tls.crt",
                ))
            }
            Err(e) => return Err(e.into()),
        };

        let data = secret.data.unwrap_or_default();
        self.crt = data
            .get("tls.crt")
            .map(|b| b.0.clone())
            .ok_or_else(|| {
                Error::missing_credentials(
                    &self.namespaced_name.namespace,
                    STUNNEL_SECRET_NAME,
                    "tls.crt",
                )
            })?;
        self.key = data
            .get("tls.key")
            .map(|b| b.0.clone())
            .ok_or_else(|| {
                Error::missing_credentials(
                    &self.namespaced_name.namespace,
                    STUNNEL_SECRET_NAME,
                    "tls.key",
                )
            })?;
        Ok(())
    }

    /// A fully assembled server without touching the API, for tests
    #[cfg(test)]
    pub(crate) fn assembled(namespaced_name: NamespacedName, listen_port: i32) -> Self {
        Self {
            namespaced_name,
            listen_port,
            connect_port: SERVER_CONNECT_PORT,
            crt: Vec::new(),
            key: Vec::new(),
            containers: vec![stunnel_container(listen_port)],
            volumes: stunnel_volumes(),
            options: TransportOptions::default(),
        }
    }

    /// The persisted certificate bytes (also the CA bundle the peer pins)
    pub fn crt(&self) -> &[u8] {
        &self.crt
    }

    /// The persisted private key bytes
    pub fn key(&self) -> &[u8] {
        &self.key
    }
}

#[async_trait]
impl Transport for StunnelServer {
    fn namespaced_name(&self) -> NamespacedName {
        self.namespaced_name.clone()
    }

    fn listen_port(&self) -> i32 {
        self.listen_port
    }

    fn connect_port(&self) -> i32 {
        self.connect_port
    }

    fn containers(&self) -> &[Container] {
        &self.containers
    }

    fn volumes(&self) -> &[Volume] {
        &self.volumes
    }

    fn options(&self) -> Option<&TransportOptions> {
        Some(&self.options)
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Stunnel
    }

    fn credentials(&self) -> Option<NamespacedName> {
        Some(NamespacedName::new(
            &self.namespaced_name.namespace,
            STUNNEL_SECRET_NAME,
        ))
    }

    fn hostname(&self) -> &str {
        "localhost"
    }

    async fn mark_for_cleanup(&self, client: &Client, key: &str, value: &str) -> Result<()> {
        let ns = &self.namespaced_name.namespace;
        label_for_cleanup::<k8s_openapi::api::core::v1::ConfigMap>(
            client,
            ns,
            STUNNEL_CONFIG_NAME,
            key,
            value,
        )
        .await?;
        label_for_cleanup::<Secret>(client, ns, STUNNEL_SECRET_NAME, key, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_server(listen: i32) -> StunnelServer {
        StunnelServer {
            namespaced_name: NamespacedName::new("ns1", "data"),
            listen_port: listen,
            connect_port: SERVER_CONNECT_PORT,
            crt: Vec::new(),
            key: Vec::new(),
            containers: Vec::new(),
            volumes: Vec::new(),
            options: TransportOptions::default(),
        }
    }

    #[test]
    fn config_accepts_endpoint_port_and_relays_to_daemon() {
        let conf = bare_server(2222).render_config().unwrap();
        assert!(conf.contains("accept = 2222"));
        assert!(conf.contains("connect = 8080"));
        assert!(conf.contains("sslVersion = TLSv1.2"));
        assert!(conf.contains("key = /etc/stunnel/certs/tls.key"));
        assert!(conf.contains("cert = /etc/stunnel/certs/tls.crt"));
        assert!(conf.contains("TIMEOUTclose = 0"));
    }

    #[test]
    fn config_renders_exactly() {
        let conf = bare_server(2222).render_config().unwrap();
        let expected = "\
foreground = yes
pid =
socket = l:TCP_NODELAY=1
socket = r:TCP_NODELAY=1
debug = 7
sslVersion = TLSv1.2
[rsync]
accept = 2222
connect = 8080
key = /etc/stunnel/certs/tls.key
cert = /etc/stunnel/certs/tls.crt
TIMEOUTclose = 0
";
        assert_eq!(conf, expected);
    }

    #[test]
    fn server_side_dials_loopback() {
        let s = bare_server(2222);
        assert_eq!(s.hostname(), "localhost");
        assert_eq!(s.transport_type(), TransportType::Stunnel);
        assert_eq!(
            s.credentials(),
            Some(NamespacedName::new("ns1", STUNNEL_SECRET_NAME))
        );
    }
}

//! Client-side stunnel transport
//!
//! Accepts plaintext rsync on loopback [`super::CLIENT_LISTEN_PORT`] and
//! relays TLS to the remote endpoint's ingress port, optionally through
//! an HTTP CONNECT proxy. The TLS secret must already exist in the
//! namespace: the outer reconciler copies it over from the destination
//! before the client side runs.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, Secret, Volume};
use kube::api::Api;
use kube::Client;

use crate::cleanup::label_for_cleanup;
use crate::error::{is_not_found, Error};
use crate::meta::NamespacedName;
use crate::transport::{Transport, TransportOptions, TransportType};
use crate::Result;

use super::{
    ensure_config_map, render_conf, stunnel_container, stunnel_volumes, CLIENT_LISTEN_PORT,
    STUNNEL_CONFIG_NAME, STUNNEL_SECRET_NAME,
};

const DEFAULT_CA_VERIFY_LEVEL: &str = "2";

const CLIENT_CONF_TEMPLATE: &str = "\
pid =
sslVersion = TLSv1.2
client = yes
syslog = no
output = /dev/stdout
[rsync]
debug = 7
accept = {{ listen_port }}
cert = /etc/stunnel/certs/tls.crt
key = /etc/stunnel/certs/tls.key
{%- if proxy_host %}
protocol = connect
connect = {{ proxy_host }}
protocolHost = {{ hostname }}:{{ listen_port }}
{%- if proxy_username %}
protocolUsername = {{ proxy_username }}
{%- endif %}
{%- if proxy_password %}
protocolPassword = {{ proxy_password }}
{%- endif %}
{%- else %}
connect = {{ hostname }}:{{ connect_port }}
{%- endif %}
{%- if not no_verify_ca %}
verify = {{ ca_verify_level }}
{%- endif %}
";

/// The client half of the stunnel tunnel
pub struct StunnelClient {
    namespaced_name: NamespacedName,
    listen_port: i32,
    ingress_port: i32,
    server_hostname: String,
    crt: Vec<u8>,
    key: Vec<u8>,
    containers: Vec<Container>,
    volumes: Vec<Volume>,
    options: TransportOptions,
}

impl StunnelClient {
    /// Render and persist the client config, load the copied TLS secret,
    /// and assemble the sidecar.
    pub async fn new(
        client: &Client,
        namespaced_name: NamespacedName,
        server_hostname: impl Into<String>,
        ingress_port: i32,
        options: TransportOptions,
    ) -> Result<Self> {
        let mut transport = Self {
            namespaced_name,
            listen_port: CLIENT_LISTEN_PORT,
            ingress_port,
            server_hostname: server_hostname.into(),
            crt: Vec::new(),
            key: Vec::new(),
            containers: Vec::new(),
            volumes: Vec::new(),
            options,
        };

        let conf = transport.render_config()?;
        ensure_config_map(
            client,
            &transport.namespaced_name.namespace,
            &transport.options.obj_meta,
            conf,
        )
        .await?;
        transport.load_credentials(client).await?;

        transport.volumes = stunnel_volumes();
        transport.containers = vec![stunnel_container(transport.listen_port)];

        Ok(transport)
    }

    /// A fully assembled client without touching the API, for tests
    #[cfg(test)]
    pub(crate) fn assembled(
        namespaced_name: NamespacedName,
        server_hostname: &str,
        ingress_port: i32,
    ) -> Self {
        Self {
            namespaced_name,
            listen_port: CLIENT_LISTEN_PORT,
            ingress_port,
            server_hostname: server_hostname.to_string(),
            crt: Vec::new(),
            key: Vec::new(),
            containers: vec![stunnel_container(CLIENT_LISTEN_PORT)],
            volumes: stunnel_volumes(),
            options: TransportOptions::default(),
        }
    }

    fn render_config(&self) -> Result<String> {
        let ca_verify_level = self
            .options
            .ca_verify_level
            .clone()
            .unwrap_or_else(|| DEFAULT_CA_VERIFY_LEVEL.to_string());
        render_conf(
            CLIENT_CONF_TEMPLATE,
            minijinja::context! {
                listen_port => self.listen_port,
                hostname => self.server_hostname,
                connect_port => self.ingress_port,
                proxy_host => self.options.proxy_url.clone().unwrap_or_default(),
                proxy_username => self.options.proxy_username.clone().unwrap_or_default(),
                proxy_password => self.options.proxy_password.clone().unwrap_or_default(),
                no_verify_ca => self.options.no_verify_ca,
                ca_verify_level => ca_verify_level,
            },
        )
    }

    /// The secret is provisioned out-of-band; refuse to build a tunnel
    /// around incomplete TLS material.
    async fn load_credentials(&mut self, client: &Client) -> Result<()> {
        let ns = &self.namespaced_name.namespace;
        let api: Api<Secret> = Api::namespaced(client.clone(), ns);
        let secret = match api.get(STUNNEL_SECRET_NAME).await {
            Ok(secret) => secret,
            Err(e) if is_not_found(&e) => {
                return Err(Error::missing_credentials(ns, STUNNEL_SECRET_NAME, "tls.crt"))
            }
            Err(e) => return Err(e.into()),
        };

        let data = secret.data.unwrap_or_default();
        self.crt = data
            .get("tls.crt")
            .map(|b| b.0.clone())
            .ok_or_else(|| Error::missing_credentials(ns, STUNNEL_SECRET_NAME, "tls.crt"))?;
        self.key = data
            .get("tls.key")
            .map(|b| b.0.clone())
            .ok_or_else(|| Error::missing_credentials(ns, STUNNEL_SECRET_NAME, "tls.key"))?;
        Ok(())
    }

    /// The trusted certificate bytes loaded from the copied secret
    pub fn crt(&self) -> &[u8] {
        &self.crt
    }

    /// The private key bytes loaded from the copied secret
    pub fn key(&self) -> &[u8] {
        &self.key
    }
}

#[async_trait]
impl Transport for StunnelClient {
    fn namespaced_name(&self) -> NamespacedName {
        self.namespaced_name.clone()
    }

    fn listen_port(&self) -> i32 {
        self.listen_port
    }

    fn connect_port(&self) -> i32 {
        self.ingress_port
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
        label_for_cleanup::<k8s_openapi::api::core::v1::ConfigMap>(
            client,
            &self.namespaced_name.namespace,
            STUNNEL_CONFIG_NAME,
            key,
            value,
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bare_client(options: TransportOptions) -> StunnelClient {
        StunnelClient {
            namespaced_name: NamespacedName::new("ns0", "src"),
            listen_port: CLIENT_LISTEN_PORT,
            ingress_port: 443,
            server_hostname: "h.example".to_string(),
            crt: Vec::new(),
            key: Vec::new(),
            containers: Vec::new(),
            volumes: Vec::new(),
            options,
        }
    }

    #[test]
    fn config_accepts_loopback_and_dials_the_ingress() {
        let conf = bare_client(TransportOptions::default()).render_config().unwrap();
        assert!(conf.contains("client = yes"));
        assert!(conf.contains("accept = 6443"));
        assert!(conf.contains("connect = h.example:443"));
        assert!(conf.contains("verify = 2"));
        assert!(!conf.contains("protocol = connect"));
    }

    #[test]
    fn verify_line_omitted_when_ca_checks_disabled() {
        let options = TransportOptions {
            no_verify_ca: true,
            ..Default::default()
        };
        let conf = bare_client(options).render_config().unwrap();
        assert!(!conf.contains("verify ="));
    }

    #[test]
    fn custom_verify_level_is_honored() {
        let options = TransportOptions {
            ca_verify_level: Some("3".to_string()),
            ..Default::default()
        };
        let conf = bare_client(options).render_config().unwrap();
        assert!(conf.contains("verify = 3"));
    }

    #[test]
    fn proxy_replaces_the_direct_connect_line() {
        let options = TransportOptions {
            proxy_url: Some("proxy.example:3128".to_string()),
            proxy_username: Some("alice".to_string()),
            proxy_password: Some("hunter2".to_string()),
            ..Default::default()
        };
        let conf = bare_client(options).render_config().unwrap();
        assert!(conf.contains("protocol = connect"));
        assert!(conf.contains("connect = proxy.example:3128"));
        assert!(conf.contains("protocolHost = h.example:6443"));
        assert!(conf.contains("protocolUsername = alice"));
        assert!(conf.contains("protocolPassword = hunter2"));
        assert!(!conf.contains("connect = h.example:443"));
    }

    #[test]
    fn proxy_credentials_are_optional() {
        let options = TransportOptions {
            proxy_url: Some("proxy.example:3128".to_string()),
            ..Default::default()
        };
        let conf = bare_client(options).render_config().unwrap();
        assert!(conf.contains("protocol = connect"));
        assert!(!conf.contains("protocolUsername"));
        assert!(!conf.contains("protocolPassword"));
    }

    #[test]
    fn client_ports_face_loopback_and_ingress() {
        let c = bare_client(TransportOptions::default());
        assert_eq!(c.listen_port(), 6443);
        assert_eq!(c.connect_port(), 443);
        assert_eq!(c.hostname(), "localhost");
    }
}

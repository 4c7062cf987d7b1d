//! Transport abstraction: the optional tunnel between transfer endpoints
//!
//! A transport contributes sidecar containers and volumes to the transfer
//! pods and tells the transfer what to dial. The stunnel variant wraps
//! the rsync protocol in TLS 1.2; the null variant passes the endpoint
//! through untouched.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, Volume};
use kube::Client;

use crate::meta::{NamespacedName, ObjectMetaMutation};
use crate::Result;

pub mod null;
pub mod stunnel;
pub mod tls;

pub use null::NullTransport;
pub use stunnel::{StunnelClient, StunnelServer};

/// Which tunnel implementation a transport is
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransportType {
    /// TLS 1.2 tunnel via an stunnel sidecar
    Stunnel,
    /// Pass-through: the transfer dials the endpoint directly
    Null,
}

/// Knobs shared by transport constructors
#[derive(Clone, Debug, Default)]
pub struct TransportOptions {
    /// Metadata stamped onto the transport's configmaps/secrets
    pub obj_meta: ObjectMetaMutation,

    /// HTTP CONNECT proxy (`host:port`) between client and server
    pub proxy_url: Option<String>,
    /// Username for the proxy, when it authenticates
    pub proxy_username: Option<String>,
    /// Password for the proxy, when it authenticates
    pub proxy_password: Option<String>,

    /// Skip CA verification on the client side
    pub no_verify_ca: bool,
    /// stunnel `verify` level; defaults to "2" when unset
    pub ca_verify_level: Option<String>,
}

/// The tunnel layer between transfer endpoints.
///
/// On the server side `listen_port` faces the endpoint and
/// `connect_port` faces the local transfer daemon. On the client side
/// `listen_port` is the loopback port the transfer dials and
/// `connect_port` is the remote endpoint's ingress port.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identity used for the transport's config/secret objects
    fn namespaced_name(&self) -> NamespacedName;

    /// Port the transport accepts connections on
    fn listen_port(&self) -> i32;

    /// Port the transport relays connections to
    fn connect_port(&self) -> i32;

    /// Sidecar containers transfers append to their pods
    fn containers(&self) -> &[Container];

    /// Volumes the sidecars need mounted
    fn volumes(&self) -> &[Volume];

    /// Options the transport was configured with
    fn options(&self) -> Option<&TransportOptions>;

    /// Which variant this is
    fn transport_type(&self) -> TransportType;

    /// Namespaced name of the secret holding TLS material, when any
    fn credentials(&self) -> Option<NamespacedName>;

    /// What the transfer-level client dials: loopback for stunnel, the
    /// endpoint hostname for null
    fn hostname(&self) -> &str;

    /// Attach the cleanup label to the transport's objects
    async fn mark_for_cleanup(&self, client: &Client, key: &str, value: &str) -> Result<()>;
}

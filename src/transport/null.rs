//! Pass-through transport
//!
//! No sidecars, no volumes, no credentials: the transfer dials the
//! endpoint hostname directly and both ports collapse onto the
//! endpoint's backend port. Used when in-transit encryption is not
//! required (tests, intra-cluster copies).

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Container, Volume};
use kube::Client;

use crate::meta::NamespacedName;
use crate::transport::{Transport, TransportOptions, TransportType};
use crate::Result;

/// The pass-through transport
pub struct NullTransport {
    listen_port: i32,
    connect_port: i32,
    hostname: String,
}

impl NullTransport {
    /// A transport that relays nothing: the transfer talks straight to
    /// `hostname:port`
    pub fn new(hostname: impl Into<String>, port: i32) -> Self {
        Self {
            listen_port: port,
            connect_port: port,
            hostname: hostname.into(),
        }
    }
}

#[async_trait]
impl Transport for NullTransport {
    fn namespaced_name(&self) -> NamespacedName {
        NamespacedName::default()
    }

    fn listen_port(&self) -> i32 {
        self.listen_port
    }

    fn connect_port(&self) -> i32 {
        self.connect_port
    }

    fn containers(&self) -> &[Container] {
        &[]
    }

    fn volumes(&self) -> &[Volume] {
        &[]
    }

    fn options(&self) -> Option<&TransportOptions> {
        None
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Null
    }

    fn credentials(&self) -> Option<NamespacedName> {
        None
    }

    fn hostname(&self) -> &str {
        &self.hostname
    }

    async fn mark_for_cleanup(&self, _client: &Client, _key: &str, _value: &str) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_collapse_onto_the_endpoint_port() {
        let t = NullTransport::new("lb.example", 2222);
        assert_eq!(t.listen_port(), 2222);
        assert_eq!(t.connect_port(), 2222);
        assert_eq!(t.hostname(), "lb.example");
        assert_eq!(t.transport_type(), TransportType::Null);
    }

    #[test]
    fn contributes_no_pod_pieces() {
        let t = NullTransport::new("lb.example", 2222);
        assert!(t.containers().is_empty());
        assert!(t.volumes().is_empty());
        assert!(t.credentials().is_none());
        assert!(t.options().is_none());
    }
}

//! Passthrough-route endpoint
//!
//! Publishes a TLS-passthrough route backed by a ClusterIP service on
//! [`BACKEND_PORT`]. TLS terminates inside the pod (stunnel), so the
//! router only ever sees ciphertext. Routes are an OpenShift API group,
//! reached through a dynamically typed client.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DynamicObject, PostParams};
use kube::Client;
use tracing::debug;

use crate::cleanup::{label_dynamic_for_cleanup, label_for_cleanup, route_api_resource};
use crate::endpoint::Endpoint;
use crate::error::{is_already_exists, is_not_found};
use crate::meta::{NamespacedName, ObjectMetaMutation};
use crate::Result;

/// Port the peer dials for passthrough TLS
pub const INGRESS_PORT: i32 = 443;

/// Port the backing service forwards to inside the namespace
pub const BACKEND_PORT: i32 = 2222;

/// A passthrough route plus its backing service
pub struct RouteEndpoint {
    namespaced_name: NamespacedName,
    hostname: Option<String>,
    meta: ObjectMetaMutation,
}

impl RouteEndpoint {
    /// Materialize the backing service and the passthrough route.
    ///
    /// Both creates are idempotent; existing objects win.
    pub async fn new(
        client: &Client,
        namespaced_name: NamespacedName,
        meta: ObjectMetaMutation,
    ) -> Result<Self> {
        let endpoint = Self {
            namespaced_name,
            hostname: None,
            meta,
        };
        endpoint.create_service(client).await?;
        endpoint.create_route(client).await?;
        Ok(endpoint)
    }

    fn build_service(&self) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some(self.namespaced_name.name.clone()),
                namespace: Some(self.namespaced_name.namespace.clone()),
                labels: Some(self.meta.labels()),
                owner_references: Some(self.meta.owner_references()),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    name: Some(self.namespaced_name.name.clone()),
                    protocol: Some("TCP".to_string()),
                    port: BACKEND_PORT,
                    target_port: Some(IntOrString::Int(BACKEND_PORT)),
                    ..Default::default()
                }]),
                selector: Some(self.meta.labels()),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn build_route(&self) -> DynamicObject {
        let ar = route_api_resource();
        let mut route = DynamicObject::new(&self.namespaced_name.name, &ar)
            .within(&self.namespaced_name.namespace);
        route.metadata.labels = Some(self.meta.labels());
        route.metadata.owner_references = Some(self.meta.owner_references());
        route.data = serde_json::json!({
            "spec": {
                "port": {"targetPort": BACKEND_PORT},
                "tls": {"termination": "passthrough"},
                "to": {"kind": "Service", "name": self.namespaced_name.name},
            }
        });
        route
    }

    async fn create_service(&self, client: &Client) -> Result<()> {
        let api: Api<Service> =
            Api::namespaced(client.clone(), &self.namespaced_name.namespace);
        match api.create(&PostParams::default(), &self.build_service()).await {
            Ok(_) => Ok(()),
            Err(e) if is_already_exists(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_route(&self, client: &Client) -> Result<()> {
        let ar = route_api_resource();
        let api: Api<DynamicObject> =
            Api::namespaced_with(client.clone(), &self.namespaced_name.namespace, &ar);
        match api.create(&PostParams::default(), &self.build_route()).await {
            Ok(_) => Ok(()),
            Err(e) if is_already_exists(&e) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Pull the assigned host out of a fetched route object.
///
/// The router reports admission under `status.ingress`; a host pinned in
/// the spec counts as assigned too.
fn assigned_host(route: &DynamicObject) -> Option<String> {
    let from_status = route
        .data
        .pointer("/status/ingress/0/host")
        .and_then(|v| v.as_str())
        .filter(|h| !h.is_empty());
    let from_spec = route
        .data
        .pointer("/spec/host")
        .and_then(|v| v.as_str())
        .filter(|h| !h.is_empty());
    from_status.or(from_spec).map(str::to_string)
}

#[async_trait]
impl Endpoint for RouteEndpoint {
    fn namespaced_name(&self) -> NamespacedName {
        self.namespaced_name.clone()
    }

    fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    fn ingress_port(&self) -> i32 {
        INGRESS_PORT
    }

    fn backend_port(&self) -> i32 {
        BACKEND_PORT
    }

    async fn is_healthy(&mut self, client: &Client) -> Result<bool> {
        let ar = route_api_resource();
        let api: Api<DynamicObject> =
            Api::namespaced_with(client.clone(), &self.namespaced_name.namespace, &ar);
        let route = match api.get(&self.namespaced_name.name).await {
            Ok(route) => route,
            Err(e) if is_not_found(&e) => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        match assigned_host(&route) {
            Some(host) => {
                // hostname is monotone: first assignment sticks
                if self.hostname.is_none() {
                    debug!(endpoint = %self.namespaced_name, host = %host, "route admitted");
                    self.hostname = Some(host);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_for_cleanup(&self, client: &Client, key: &str, value: &str) -> Result<()> {
        let ar = route_api_resource();
        label_dynamic_for_cleanup(
            client,
            &ar,
            &self.namespaced_name.namespace,
            &self.namespaced_name.name,
            key,
            value,
        )
        .await?;
        label_for_cleanup::<Service>(
            client,
            &self.namespaced_name.namespace,
            &self.namespaced_name.name,
            key,
            value,
        )
        .await
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// A route endpoint whose host has already been assigned
    pub(crate) fn admitted(ns: &str, name: &str, host: &str) -> RouteEndpoint {
        RouteEndpoint {
            namespaced_name: NamespacedName::new(ns, name),
            hostname: Some(host.to_string()),
            meta: ObjectMetaMutation::default(),
        }
    }
}

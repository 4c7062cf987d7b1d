//! Load-balancer endpoint
//!
//! Publishes an L4 service of load-balancer type with a single
//! `ingress_port -> backend_port` forward. Readiness is the cloud
//! provider populating at least one ingress record in the service status.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::debug;

use crate::cleanup::label_for_cleanup;
use crate::endpoint::Endpoint;
use crate::error::{is_already_exists, is_not_found};
use crate::meta::{NamespacedName, ObjectMetaMutation};
use crate::Result;

/// An L4 load-balancer service endpoint
pub struct LoadBalancerEndpoint {
    namespaced_name: NamespacedName,
    hostname: Option<String>,
    ingress_port: i32,
    backend_port: i32,
    meta: ObjectMetaMutation,
}

impl LoadBalancerEndpoint {
    /// Materialize the load-balancer service (idempotent)
    pub async fn new(
        client: &Client,
        namespaced_name: NamespacedName,
        meta: ObjectMetaMutation,
        backend_port: i32,
        ingress_port: i32,
    ) -> Result<Self> {
        let endpoint = Self {
            namespaced_name,
            hostname: None,
            ingress_port,
            backend_port,
            meta,
        };
        endpoint.create_service(client).await?;
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
                type_: Some("LoadBalancer".to_string()),
                ports: Some(vec![ServicePort {
                    name: Some(self.namespaced_name.name.clone()),
                    protocol: Some("TCP".to_string()),
                    port: self.ingress_port,
                    target_port: Some(IntOrString::Int(self.backend_port)),
                    ..Default::default()
                }]),
                selector: Some(self.meta.labels()),
                ..Default::default()
            }),
            ..Default::default()
        }
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
}

/// The externally assigned address from a load-balancer service status.
///
/// Only the first ingress record is consulted; hostname wins over IP.
fn assigned_address(svc: &Service) -> Option<String> {
    let record = svc
        .status
        .as_ref()?
        .load_balancer
        .as_ref()?
        .ingress
        .as_ref()?
        .first()?;
    record
        .hostname
        .clone()
        .filter(|h| !h.is_empty())
        .or_else(|| record.ip.clone().filter(|ip| !ip.is_empty()))
}

#[async_trait]
impl Endpoint for LoadBalancerEndpoint {
    fn namespaced_name(&self) -> NamespacedName {
        self.namespaced_name.clone()
    }

    fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    fn ingress_port(&self) -> i32 {
        self.ingress_port
    }

    fn backend_port(&self) -> i32 {
        self.backend_port
    }

    async fn is_healthy(&mut self, client: &Client) -> Result<bool> {
        let api: Api<Service> =
            Api::namespaced(client.clone(), &self.namespaced_name.namespace);
        let svc = match api.get(&self.namespaced_name.name).await {
            Ok(svc) => svc,
            Err(e) if is_not_found(&e) => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        match assigned_address(&svc) {
            Some(address) => {
                // hostname is monotone: first assignment sticks
                if self.hostname.is_none() {
                    debug!(endpoint = %self.namespaced_name, address = %address, "load balancer provisioned");
                    self.hostname = Some(address);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn mark_for_cleanup(&self, client: &Client, key: &str, value: &str) -> Result<()> {
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

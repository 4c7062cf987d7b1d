//! External-reachability primitives
//!
//! An endpoint publishes the (hostname, port) the peer side dials and
//! reports readiness of the orchestrator object backing it. Two variants
//! exist: a passthrough-TLS route ([`route`]) and an L4 load-balancer
//! service ([`load_balancer`]).

use async_trait::async_trait;
use kube::Client;

use crate::meta::NamespacedName;
use crate::Result;

pub mod load_balancer;
pub mod route;

/// An externally reachable address for the transfer's peer side.
///
/// `ingress_port` is what the peer connects to; `backend_port` is what
/// the in-cluster object forwards to. The hostname starts out unknown
/// and is populated by [`Endpoint::is_healthy`]; once set it never
/// reverts to empty.
#[async_trait]
pub trait Endpoint: Send + Sync {
    /// Stable identity of the endpoint's primary object
    fn namespaced_name(&self) -> NamespacedName;

    /// Externally assigned hostname, once known
    fn hostname(&self) -> Option<&str>;

    /// Port the peer connects to
    fn ingress_port(&self) -> i32;

    /// Port the in-cluster object forwards to
    fn backend_port(&self) -> i32;

    /// Refresh the hostname from external state and report readiness.
    ///
    /// An endpoint is ready iff its exposed address has been populated by
    /// the external system. A missing object means "not ready yet", not
    /// failure.
    async fn is_healthy(&mut self, client: &Client) -> Result<bool>;

    /// Attach the cleanup label to the endpoint's external object(s)
    async fn mark_for_cleanup(&self, client: &Client, key: &str, value: &str) -> Result<()>;
}

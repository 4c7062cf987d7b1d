//! Replication Custom Resource Definitions
//!
//! The rsync-relevant surface of the ReplicationSource and
//! ReplicationDestination CRs. The outer reconciler owns the full schema;
//! the mover only reads the rsync spec blocks and writes the rsync status
//! blocks defined here.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Rsync-specific source parameters: where to send the data
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSourceRsyncSpec {
    /// Remote address to connect to (published by the destination)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Remote port to connect to (published by the destination)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

/// Rsync-specific source status
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSourceRsyncStatus {}

/// Status of a ReplicationSource
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSourceStatus {
    /// Rsync mover status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsync: Option<ReplicationSourceRsyncStatus>,
}

/// Desired state of a replication source
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "volrep.dev",
    version = "v1alpha1",
    kind = "ReplicationSource",
    namespaced,
    status = "ReplicationSourceStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationSourceSpec {
    /// The PVC whose contents will be replicated out
    pub source_pvc: String,

    /// Pause replication without deleting the CR
    #[serde(default)]
    pub paused: bool,

    /// Rsync data-mover parameters; absence means another mover owns this CR
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsync: Option<ReplicationSourceRsyncSpec>,
}

/// Rsync-specific destination parameters
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationDestinationRsyncSpec {
    /// Write incoming data into this pre-existing PVC instead of
    /// provisioning a fresh one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_pvc: Option<String>,
}

/// Rsync-specific destination status: the coordinates the source dials
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationDestinationRsyncStatus {
    /// Externally reachable hostname or IP
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,

    /// Externally reachable port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<i32>,
}

/// Status of a ReplicationDestination
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationDestinationStatus {
    /// Rsync mover status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsync: Option<ReplicationDestinationRsyncStatus>,
}

/// Desired state of a replication destination
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "volrep.dev",
    version = "v1alpha1",
    kind = "ReplicationDestination",
    namespaced,
    status = "ReplicationDestinationStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ReplicationDestinationSpec {
    /// Pause replication without deleting the CR
    #[serde(default)]
    pub paused: bool,

    /// Rsync data-mover parameters; absence means another mover owns this CR
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rsync: Option<ReplicationDestinationRsyncSpec>,
}

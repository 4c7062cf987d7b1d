//! Metadata carried onto synthesized workload objects
//!
//! Every object volrep materializes (pods, configmaps, secrets, services,
//! routes) is stamped with the same labels and owner references so that
//! cascading deletion and the label sweeper can reclaim it. Mutations come
//! in two modes: merge (labels/owner refs folded into what the object
//! already carries) and replace (the mutation's value wins wholesale).

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::api::core::v1::{
    PodSecurityContext, ResourceRequirements, SecurityContext,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

/// A (namespace, name) pair identifying a namespaced object
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NamespacedName {
    /// Object namespace
    pub namespace: String,
    /// Object name
    pub name: String,
}

impl NamespacedName {
    /// Create a namespaced name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for NamespacedName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// How a mutation combines with what an object already carries
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MutationMode {
    /// Fold the mutation's values into the existing ones
    #[default]
    Merge,
    /// The mutation's values win wholesale
    Replace,
}

/// Object-meta mutation: the name, labels, and owner references applied
/// to every object a transfer materializes
#[derive(Clone, Debug, Default)]
pub struct ObjectMetaMutation {
    /// Name for the primary object (endpoint service/route take this name)
    pub name: Option<String>,
    /// Namespace the objects land in
    pub namespace: Option<String>,
    /// Labels stamped onto every object
    pub labels: BTreeMap<String, String>,
    /// Owner references stamped onto every object
    pub owner_references: Vec<OwnerReference>,
    /// Merge or replace
    pub mode: MutationMode,
}

impl ObjectMetaMutation {
    /// A merge-mode mutation carrying the given name, namespace, labels,
    /// and owner references
    pub fn merge(
        name: impl Into<String>,
        namespace: impl Into<String>,
        labels: BTreeMap<String, String>,
        owner_references: Vec<OwnerReference>,
    ) -> Self {
        Self {
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            labels,
            owner_references,
            mode: MutationMode::Merge,
        }
    }

    /// Labels to stamp (empty map when none were set)
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.labels.clone()
    }

    /// Owner references to stamp
    pub fn owner_references(&self) -> Vec<OwnerReference> {
        self.owner_references.clone()
    }

    /// The mutation's object name, when one was set
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

/// Pod-spec mutation applied to synthesized transfer pods.
///
/// Replace-mode mutations overwrite the node selector, pod security
/// context, and node name when present.
#[derive(Clone, Debug, Default)]
pub struct PodSpecMutation {
    /// Node selector to pin the pod with
    pub node_selector: Option<BTreeMap<String, String>>,
    /// Pod-level security context
    pub security_context: Option<PodSecurityContext>,
    /// Schedule directly onto this node
    pub node_name: Option<String>,
    /// Merge or replace
    pub mode: MutationMode,
}

/// Container mutation applied to every container of a transfer pod.
///
/// Replace-mode mutations overwrite the security context and resource
/// requirements when present.
#[derive(Clone, Debug, Default)]
pub struct ContainerMutation {
    /// Container security context
    pub security_context: Option<SecurityContext>,
    /// Resource requests/limits
    pub resources: Option<ResourceRequirements>,
    /// Merge or replace
    pub mode: MutationMode,
}

impl ContainerMutation {
    /// A replace-mode mutation carrying a security context
    pub fn replace_security_context(security_context: SecurityContext) -> Self {
        Self {
            security_context: Some(security_context),
            resources: None,
            mode: MutationMode::Replace,
        }
    }
}

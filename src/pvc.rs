//! PVC references and label-safe naming
//!
//! Transfers refer to volumes through [`PvcRef`], which pairs the claim
//! with a derived identifier that is legal as a label value and as an
//! rsync module name. The derivation is a pure function of the claim's
//! identity, so restarts re-derive the same name.

use k8s_openapi::api::core::v1::PersistentVolumeClaim;

/// Longest legal label value
const MAX_LABEL_LEN: usize = 63;

/// A persistent volume claim plus its label-safe derived name
#[derive(Clone, Debug)]
pub struct PvcRef {
    claim: PersistentVolumeClaim,
    label_safe_name: String,
}

impl PvcRef {
    /// Wrap a claim, deriving its label-safe name
    pub fn new(claim: PersistentVolumeClaim) -> Self {
        let namespace = claim.metadata.namespace.clone().unwrap_or_default();
        let name = claim.metadata.name.clone().unwrap_or_default();
        let label_safe_name = label_safe_name(&namespace, &name);
        Self {
            claim,
            label_safe_name,
        }
    }

    /// The underlying claim
    pub fn claim(&self) -> &PersistentVolumeClaim {
        &self.claim
    }

    /// Claim namespace
    pub fn namespace(&self) -> &str {
        self.claim.metadata.namespace.as_deref().unwrap_or_default()
    }

    /// Claim name
    pub fn name(&self) -> &str {
        self.claim.metadata.name.as_deref().unwrap_or_default()
    }

    /// A name for the PVC usable as a label value and rsync module name
    pub fn label_safe_name(&self) -> &str {
        &self.label_safe_name
    }
}

/// Derive a label-legal identifier from a claim's identity.
///
/// Names that are already legal pass through unchanged. Anything else is
/// sanitized to the label charset and suffixed with a digest of the full
/// `namespace/name` so distinct claims cannot collide.
fn label_safe_name(namespace: &str, name: &str) -> String {
    if is_label_safe(name) {
        return name.to_string();
    }

    let sanitized: String = name
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let suffix = identity_digest(namespace, name);

    // room for '-' + 10 hex digest chars
    let keep = MAX_LABEL_LEN - suffix.len() - 1;
    let stem: String = sanitized.chars().take(keep).collect();
    let stem = stem.trim_matches('-');
    if stem.is_empty() {
        suffix
    } else {
        format!("{stem}-{suffix}")
    }
}

fn is_label_safe(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_LABEL_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        && name.starts_with(|c: char| c.is_ascii_alphanumeric())
        && name.ends_with(|c: char| c.is_ascii_alphanumeric())
}

fn identity_digest(namespace: &str, name: &str) -> String {
    use aws_lc_rs::digest::{digest, SHA256};
    let hash = digest(&SHA256, format!("{namespace}/{name}").as_bytes());
    hash.as_ref()[..5].iter().map(|b| format!("{b:02x}")).collect()
}

/// An unordered set of PVC references grouped by namespace
#[derive(Clone, Debug, Default)]
pub struct PvcList {
    pvcs: Vec<PvcRef>,
}

impl PvcList {
    /// Build a list from claims
    pub fn new(claims: Vec<PersistentVolumeClaim>) -> Self {
        Self {
            pvcs: claims.into_iter().map(PvcRef::new).collect(),
        }
    }

    /// A list holding a single claim
    pub fn singleton(claim: PersistentVolumeClaim) -> Self {
        Self::new(vec![claim])
    }

    /// All members
    pub fn pvcs(&self) -> &[PvcRef] {
        &self.pvcs
    }

    /// Members living in the given namespace
    pub fn in_namespace(&self, namespace: &str) -> PvcList {
        PvcList {
            pvcs: self
                .pvcs
                .iter()
                .filter(|p| p.namespace() == namespace)
                .cloned()
                .collect(),
        }
    }

    /// Distinct namespaces represented in the list, in first-seen order
    pub fn namespaces(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for pvc in &self.pvcs {
            let ns = pvc.namespace().to_string();
            if !seen.contains(&ns) {
                seen.push(ns);
            }
        }
        seen
    }

    /// True when the list holds no members
    pub fn is_empty(&self) -> bool {
        self.pvcs.is_empty()
    }
}

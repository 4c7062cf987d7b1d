//! Integration tests for the public data-path surface
//!
//! Everything here runs without a cluster: option building, CR parsing,
//! mover construction, and the naming rules that tie the pieces
//! together. Cluster-backed flows live with the embedding operator.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, TypedLocalObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use volrep::crd::{ReplicationDestination, ReplicationSource};
use volrep::mover::{MoverBuilder, VolumeHandler};
use volrep::pvc::{PvcList, PvcRef};
use volrep::transfer::rsync::options::{CommandOptions, TransferOptions};
use volrep::Error;
use volrep::{RSYNC_WITH_NULL_ANNOTATION, RSYNC_WITH_STUNNEL_ANNOTATION};

/// A volume handler that never resolves; mover construction must not
/// touch it
struct StubVolumeHandler;

#[async_trait]
impl VolumeHandler for StubVolumeHandler {
    async fn ensure_pvc_from_src(
        &self,
        _source: &PersistentVolumeClaim,
        _name: &str,
        _is_temporary: bool,
    ) -> volrep::Result<Option<PersistentVolumeClaim>> {
        Ok(None)
    }

    async fn ensure_new_pvc(
        &self,
        _name: &str,
    ) -> volrep::Result<Option<PersistentVolumeClaim>> {
        Ok(None)
    }

    async fn ensure_image(
        &self,
        _pvc: &PersistentVolumeClaim,
    ) -> volrep::Result<Option<TypedLocalObjectReference>> {
        Ok(None)
    }
}

fn handler() -> Arc<dyn VolumeHandler> {
    Arc::new(StubVolumeHandler)
}

fn source_cr(annotation: &str) -> ReplicationSource {
    let mut annotations = BTreeMap::new();
    annotations.insert(annotation.to_string(), String::new());
    serde_json::from_value(serde_json::json!({
        "apiVersion": "volrep.dev/v1alpha1",
        "kind": "ReplicationSource",
        "metadata": {
            "name": "repl",
            "namespace": "ns0",
            "uid": "u1",
            "annotations": annotations,
        },
        "spec": {
            "sourcePvc": "src",
            "rsync": {"address": "h.example", "port": 443},
        },
    }))
    .unwrap()
}

#[test]
fn annotated_source_cr_yields_a_mover() {
    let mover = MoverBuilder::from_source(handler(), &source_cr(RSYNC_WITH_STUNNEL_ANNOTATION));
    assert!(mover.is_some());
    assert_eq!(mover.unwrap().name(), "rsync");

    let mover = MoverBuilder::from_source(handler(), &source_cr(RSYNC_WITH_NULL_ANNOTATION));
    assert!(mover.is_some());
}

#[test]
fn unannotated_cr_is_declined() {
    let mut cr = source_cr(RSYNC_WITH_STUNNEL_ANNOTATION);
    cr.metadata.annotations = None;
    assert!(MoverBuilder::from_source(handler(), &cr).is_none());
}

#[test]
fn destination_cr_parses_without_a_pvc() {
    let destination: ReplicationDestination = serde_json::from_value(serde_json::json!({
        "apiVersion": "volrep.dev/v1alpha1",
        "kind": "ReplicationDestination",
        "metadata": {"name": "repl", "namespace": "ns1", "uid": "u1"},
        "spec": {"rsync": {}},
    }))
    .unwrap();
    assert!(destination.spec.rsync.unwrap().destination_pvc.is_none());
}

#[test]
fn default_profile_produces_a_stable_argv() {
    let options = TransferOptions::default_options()
        .delete_destination(true)
        .hard_links(true)
        .partial(true);
    let (argv, errs) = options.command.as_rsync_arguments();
    assert!(errs.is_empty());
    assert_eq!(argv[0], "--recursive");
    assert!(argv.contains(&"--delete".to_string()));
    assert!(argv.contains(&"--hard-links".to_string()));
    assert!(argv.contains(&"--partial".to_string()));
    assert!(argv.contains(&"--log-file=/dev/stdout".to_string()));
}

#[test]
fn rejected_flags_surface_as_one_aggregate() {
    let options = CommandOptions {
        recursive: true,
        extras: vec!["--RM rf /".to_string(), "--valid-flag".to_string()],
        bw_limit: Some(-5),
        ..Default::default()
    };
    let (argv, errs) = options.as_rsync_arguments();

    assert!(argv.contains(&"--recursive".to_string()));
    assert!(argv.contains(&"--valid-flag".to_string()));
    assert!(!argv.iter().any(|a| a.contains("RM")));

    let aggregate = Error::aggregate(errs).unwrap_err();
    assert_eq!(aggregate.len(), 2);
    assert!(!aggregate.is_retryable());
}

#[test]
fn pvc_names_become_rsync_modules() {
    let claim = PersistentVolumeClaim {
        metadata: ObjectMeta {
            namespace: Some("ns1".to_string()),
            name: Some("data".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    let pvc = PvcRef::new(claim.clone());
    assert_eq!(pvc.label_safe_name(), "data");

    let list = PvcList::singleton(claim);
    assert_eq!(list.namespaces(), vec!["ns1".to_string()]);
    assert_eq!(list.in_namespace("elsewhere").pvcs().len(), 0);
}

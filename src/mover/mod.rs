//! Per-iteration replication state machine
//!
//! The outer reconciler invokes [`Mover::synchronize`] once per event.
//! Each call idempotently re-materializes the chain temp volume ->
//! endpoint -> transport -> workload, polls readiness/completion, and on
//! the destination publishes the coordinates the source side dials. Any
//! error is a signal to retry: the next call re-discovers everything
//! that already exists instead of recreating it.

use std::collections::BTreeMap;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{
    Capabilities, PersistentVolumeClaim, Secret, SecurityContext, TypedLocalObjectReference,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::Api;
use kube::{Client, Resource, ResourceExt};
use tracing::{info, instrument, warn};

use crate::cleanup::{cleanup_objects, CLEANUP_LABEL_KEY};
use crate::crd::{
    ReplicationDestination, ReplicationDestinationRsyncStatus, ReplicationSource,
    ReplicationSourceRsyncSpec,
};
use crate::endpoint::route;
use crate::error::{is_not_found, Error};
use crate::meta::{ContainerMutation, ObjectMetaMutation};
use crate::pvc::PvcList;
use crate::transfer::rsync::options::TransferOptions;
use crate::transfer::rsync::{RsyncClient, RsyncServer, RSYNC_SECRET_NAME};
use crate::transfer::{Client as _, Server as _};
use crate::{Result, PART_OF_LABEL_VALUE, RSYNC_WITH_NULL_ANNOTATION, RSYNC_WITH_STUNNEL_ANNOTATION};

#[cfg_attr(test, allow(missing_docs))]
mod volume;

pub use volume::VolumeHandler;

#[cfg(test)]
pub use volume::MockVolumeHandler;

/// Which half of a replication pair this mover drives
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReplicationDirection {
    /// Push data out of this namespace
    Source,
    /// Receive data into this namespace
    Destination,
}

/// Which data path the CR's annotation selected
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum DataPath {
    Stunnel,
    Null,
}

/// Outcome of one `synchronize()` or `cleanup()` call
#[derive(Clone, Debug, PartialEq)]
pub enum MoverResult {
    /// Keep calling; the data path is still converging
    InProgress,
    /// This iteration is done
    Complete,
    /// Destination finished and snapshotted the received data
    CompleteWithImage(TypedLocalObjectReference),
}

/// Identity of the replication CR owning this iteration's objects
#[derive(Clone, Debug)]
pub struct OwnerInfo {
    /// CR name
    pub name: String,
    /// CR namespace
    pub namespace: String,
    /// CR UID; doubles as the cleanup label value
    pub uid: String,
    /// CR apiVersion for owner references
    pub api_version: String,
    /// CR kind for owner references
    pub kind: String,
}

impl OwnerInfo {
    fn from_resource<K>(resource: &K) -> Self
    where
        K: Resource<DynamicType = ()>,
    {
        Self {
            name: resource.name_any(),
            namespace: resource.namespace().unwrap_or_default(),
            uid: resource.uid().unwrap_or_default(),
            api_version: K::api_version(&()).to_string(),
            kind: K::kind(&()).to_string(),
        }
    }

    fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            ..Default::default()
        }
    }
}

/// The per-iteration state machine for one side of a replication
pub struct Mover {
    owner: OwnerInfo,
    volume_handler: Arc<dyn VolumeHandler>,
    direction: ReplicationDirection,
    paused: bool,
    main_pvc_name: Option<String>,
    data_path: DataPath,

    // source side only
    source_spec: Option<ReplicationSourceRsyncSpec>,

    // destination side only
    destination_status: Option<ReplicationDestinationRsyncStatus>,
}

/// Builds movers from replication CRs, declining CRs owned by other movers
pub struct MoverBuilder;

impl MoverBuilder {
    /// A source-side mover, or `None` when the CR is not rsync-annotated
    pub fn from_source(
        volume_handler: Arc<dyn VolumeHandler>,
        source: &ReplicationSource,
    ) -> Option<Mover> {
        let rsync = source.spec.rsync.clone()?;
        let data_path = selected_data_path(source.annotations())?;

        Some(Mover {
            owner: OwnerInfo::from_resource(source),
            volume_handler,
            direction: ReplicationDirection::Source,
            paused: source.spec.paused,
            main_pvc_name: Some(source.spec.source_pvc.clone()),
            data_path,
            source_spec: Some(rsync),
            destination_status: None,
        })
    }

    /// A destination-side mover, or `None` when the CR is not
    /// rsync-annotated
    pub fn from_destination(
        volume_handler: Arc<dyn VolumeHandler>,
        destination: &ReplicationDestination,
    ) -> Option<Mover> {
        let rsync = destination.spec.rsync.clone()?;
        let data_path = selected_data_path(destination.annotations())?;

        Some(Mover {
            owner: OwnerInfo::from_resource(destination),
            volume_handler,
            direction: ReplicationDirection::Destination,
            paused: destination.spec.paused,
            main_pvc_name: rsync.destination_pvc,
            data_path,
            source_spec: None,
            destination_status: None,
        })
    }
}

fn selected_data_path(annotations: &BTreeMap<String, String>) -> Option<DataPath> {
    if annotations.contains_key(RSYNC_WITH_STUNNEL_ANNOTATION) {
        Some(DataPath::Stunnel)
    } else if annotations.contains_key(RSYNC_WITH_NULL_ANNOTATION) {
        Some(DataPath::Null)
    } else {
        None
    }
}

impl Mover {
    /// Name of this data mover
    pub fn name(&self) -> &'static str {
        "rsync"
    }

    /// The coordinates published for the source to dial, once known
    pub fn destination_status(&self) -> Option<&ReplicationDestinationRsyncStatus> {
        self.destination_status.as_ref()
    }

    /// Drive this side of the replication one step forward.
    ///
    /// Every materialization is create-if-absent; a crash between any two
    /// steps leaves a state the next call resumes from. Errors mean
    /// "in progress, retry".
    #[instrument(skip_all, fields(owner = %self.owner.name, direction = ?self.direction))]
    pub async fn synchronize(&mut self, client: &Client) -> Result<MoverResult> {
        if self.paused {
            return Ok(MoverResult::InProgress);
        }

        let data_pvc = match self.direction {
            ReplicationDirection::Source => self.ensure_source_pvc(client).await?,
            ReplicationDirection::Destination => self.ensure_destination_pvc(client).await?,
        };
        let Some(data_pvc) = data_pvc else {
            return Ok(MoverResult::InProgress);
        };

        match self.direction {
            ReplicationDirection::Destination => self.reconcile_destination(client, &data_pvc).await,
            ReplicationDirection::Source => self.reconcile_source(client, &data_pvc).await,
        }
    }

    /// Reclaim every object this owner's iterations have marked
    #[instrument(skip_all, fields(owner = %self.owner.name))]
    pub async fn cleanup(&self, client: &Client) -> Result<MoverResult> {
        cleanup_objects(client, &self.owner.namespace, &self.owner.uid).await?;
        Ok(MoverResult::Complete)
    }

    async fn ensure_source_pvc(&self, client: &Client) -> Result<Option<PersistentVolumeClaim>> {
        let name = self.main_pvc_name.clone().ok_or_else(|| {
            Error::validation_for_field("sourcePvc", "replication source requires a PVC name")
        })?;
        let api: Api<PersistentVolumeClaim> =
            Api::namespaced(client.clone(), &self.owner.namespace);
        let source = api.get(&name).await?;

        let data_name = format!("volrep-{}-src", self.owner.name);
        self.volume_handler
            .ensure_pvc_from_src(&source, &data_name, true)
            .await
    }

    async fn ensure_destination_pvc(
        &mut self,
        client: &Client,
    ) -> Result<Option<PersistentVolumeClaim>> {
        match &self.main_pvc_name {
            None => {
                let data_name = format!("volrep-{}-dest", self.owner.name);
                self.main_pvc_name = Some(data_name.clone());
                self.volume_handler.ensure_new_pvc(&data_name).await
            }
            Some(name) => {
                let api: Api<PersistentVolumeClaim> =
                    Api::namespaced(client.clone(), &self.owner.namespace);
                Ok(Some(api.get(name).await?))
            }
        }
    }

    async fn reconcile_destination(
        &mut self,
        client: &Client,
        data_pvc: &PersistentVolumeClaim,
    ) -> Result<MoverResult> {
        let options = self.destination_transfer_options(client, data_pvc).await?;
        let pvc_list = PvcList::singleton(data_pvc.clone());

        let server = match self.data_path {
            DataPath::Stunnel => RsyncServer::with_stunnel(client, pvc_list, options).await?,
            DataPath::Null => RsyncServer::with_null(client, pvc_list, options).await?,
        };

        let healthy = server.is_healthy(client).await?;
        let mut completed = false;
        if !healthy {
            completed = server.completed(client).await?;
            if !completed {
                warn!(owner = %self.owner.name, "rsync server is not healthy");
                return Err(Error::internal("mover", "rsync server is not healthy"));
            }
        }

        // the source needs these coordinates before completion happens
        self.destination_status = Some(ReplicationDestinationRsyncStatus {
            address: server.endpoint().hostname().map(str::to_string),
            port: Some(server.endpoint().ingress_port()),
        });

        if !completed {
            return Ok(MoverResult::InProgress);
        }

        server
            .mark_for_cleanup(client, CLEANUP_LABEL_KEY, &self.owner.uid)
            .await?;

        info!(owner = %self.owner.name, "rsync transfer complete, saving snapshot");
        let image = self.volume_handler.ensure_image(data_pvc).await?;
        let Some(image) = image else {
            return Ok(MoverResult::InProgress);
        };
        Ok(MoverResult::CompleteWithImage(image))
    }

    async fn reconcile_source(
        &mut self,
        client: &Client,
        data_pvc: &PersistentVolumeClaim,
    ) -> Result<MoverResult> {
        let spec = self.source_spec.clone().ok_or_else(|| {
            Error::validation("replication source CR carries no rsync parameters")
        })?;
        let address = spec.address.clone().ok_or_else(|| {
            Error::validation_for_field(
                "rsync.address",
                "replication source requires the destination address",
            )
        })?;

        let options = self.source_transfer_options(client, data_pvc).await?;
        let pvc_list = PvcList::singleton(data_pvc.clone());

        let transfer = match self.data_path {
            DataPath::Stunnel => {
                RsyncClient::with_stunnel(client, address, route::INGRESS_PORT, pvc_list, options)
                    .await?
            }
            DataPath::Null => {
                let port = spec.port.ok_or_else(|| {
                    Error::validation_for_field(
                        "rsync.port",
                        "replication source requires the destination port",
                    )
                })?;
                RsyncClient::with_null(client, address, port, pvc_list, options).await?
            }
        };

        if !transfer.is_completed(client).await? {
            return Ok(MoverResult::InProgress);
        }

        transfer
            .mark_for_cleanup(client, CLEANUP_LABEL_KEY, &self.owner.uid)
            .await?;
        Ok(MoverResult::Complete)
    }

    async fn destination_transfer_options(
        &self,
        client: &Client,
        data_pvc: &PersistentVolumeClaim,
    ) -> Result<TransferOptions> {
        let mut options = self
            .base_transfer_options()
            .destination_meta(self.meta_mutation(data_pvc))
            .destination_container_mutation(transfer_container_mutation());

        // adopt credentials from a previous iteration so the daemon and
        // its secret stay in agreement; otherwise the server generates
        if let Some((username, password)) = self.rsync_credentials(client).await? {
            options = options.username(username).password(password);
        }
        Ok(options)
    }

    async fn source_transfer_options(
        &self,
        client: &Client,
        data_pvc: &PersistentVolumeClaim,
    ) -> Result<TransferOptions> {
        // the destination's credentials secret is copied into this
        // namespace out-of-band; until it lands we cannot authenticate
        let (username, password) =
            self.rsync_credentials(client).await?.ok_or_else(|| {
                Error::missing_credentials(&self.owner.namespace, RSYNC_SECRET_NAME, "credentials")
            })?;

        Ok(self
            .base_transfer_options()
            .username(username)
            .password(password)
            .source_meta(self.meta_mutation(data_pvc))
            .source_container_mutation(transfer_container_mutation()))
    }

    fn base_transfer_options(&self) -> TransferOptions {
        TransferOptions::default_options()
            .delete_destination(true)
            .hard_links(true)
            .partial(true)
    }

    async fn rsync_credentials(&self, client: &Client) -> Result<Option<(String, String)>> {
        let api: Api<Secret> = Api::namespaced(client.clone(), &self.owner.namespace);
        let secret = match api.get(RSYNC_SECRET_NAME).await {
            Ok(secret) => secret,
            Err(e) if is_not_found(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let data = secret.data.unwrap_or_default();
        let raw = data.get("credentials").ok_or_else(|| {
            Error::missing_credentials(&self.owner.namespace, RSYNC_SECRET_NAME, "credentials")
        })?;
        let creds = String::from_utf8(raw.0.clone()).map_err(|_| {
            Error::internal("mover", "rsync credentials secret is not valid utf-8")
        })?;
        parse_credentials(&creds).map(Some)
    }

    fn service_selector(&self) -> BTreeMap<String, String> {
        let dir = match self.direction {
            ReplicationDirection::Source => "src",
            ReplicationDirection::Destination => "dst",
        };
        [
            (
                "app.kubernetes.io/name".to_string(),
                format!("volrep-{dir}-{}", self.owner.name),
            ),
            (
                "app.kubernetes.io/component".to_string(),
                "rsync-data-mover".to_string(),
            ),
            (
                "app.kubernetes.io/part-of".to_string(),
                PART_OF_LABEL_VALUE.to_string(),
            ),
        ]
        .into()
    }

    fn meta_mutation(&self, data_pvc: &PersistentVolumeClaim) -> ObjectMetaMutation {
        ObjectMetaMutation::merge(
            data_pvc.metadata.name.clone().unwrap_or_default(),
            data_pvc
                .metadata
                .namespace
                .clone()
                .unwrap_or_else(|| self.owner.namespace.clone()),
            self.service_selector(),
            vec![self.owner.owner_reference()],
        )
    }
}

fn parse_credentials(creds: &str) -> Result<(String, String)> {
    creds
        .split_once(':')
        .map(|(user, pass)| (user.to_string(), pass.to_string()))
        .ok_or_else(|| {
            Error::internal("mover", "rsync credentials secret is not user:password formed")
        })
}

/// Security posture for the rsync containers: root (rsync preserves
/// ownership) but otherwise locked down
fn transfer_container_mutation() -> ContainerMutation {
    ContainerMutation::replace_security_context(SecurityContext {
        privileged: Some(false),
        run_as_user: Some(0),
        read_only_root_filesystem: Some(true),
        capabilities: Some(Capabilities {
            drop: Some(vec!["MKNOD".to_string(), "SETPCAP".to_string()]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{
        ReplicationDestinationRsyncSpec, ReplicationDestinationSpec, ReplicationSourceSpec,
    };
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn mock_handler() -> Arc<dyn VolumeHandler> {
        Arc::new(MockVolumeHandler::new())
    }

    fn source_cr(annotation: Option<&str>) -> ReplicationSource {
        let mut annotations = BTreeMap::new();
        if let Some(a) = annotation {
            annotations.insert(a.to_string(), String::new());
        }
        ReplicationSource {
            metadata: ObjectMeta {
                name: Some("repl".to_string()),
                namespace: Some("ns0".to_string()),
                uid: Some("u1".to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: ReplicationSourceSpec {
                source_pvc: "src".to_string(),
                paused: false,
                rsync: Some(ReplicationSourceRsyncSpec {
                    address: Some("h.example".to_string()),
                    port: Some(443),
                }),
            },
            status: None,
        }
    }

    fn destination_cr(annotation: Option<&str>) -> ReplicationDestination {
        let mut annotations = BTreeMap::new();
        if let Some(a) = annotation {
            annotations.insert(a.to_string(), String::new());
        }
        ReplicationDestination {
            metadata: ObjectMeta {
                name: Some("repl".to_string()),
                namespace: Some("ns1".to_string()),
                uid: Some("u1".to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: ReplicationDestinationSpec {
                paused: false,
                rsync: Some(ReplicationDestinationRsyncSpec {
                    destination_pvc: None,
                }),
            },
            status: None,
        }
    }

    #[test]
    fn builder_selects_the_annotated_data_path() {
        let mover = MoverBuilder::from_source(
            mock_handler(),
            &source_cr(Some(RSYNC_WITH_STUNNEL_ANNOTATION)),
        )
        .unwrap();
        assert_eq!(mover.data_path, DataPath::Stunnel);
        assert_eq!(mover.direction, ReplicationDirection::Source);
        assert_eq!(mover.main_pvc_name.as_deref(), Some("src"));

        let mover = MoverBuilder::from_destination(
            mock_handler(),
            &destination_cr(Some(RSYNC_WITH_NULL_ANNOTATION)),
        )
        .unwrap();
        assert_eq!(mover.data_path, DataPath::Null);
        assert!(mover.main_pvc_name.is_none());
    }

    #[test]
    fn builder_declines_unannotated_crs() {
        assert!(MoverBuilder::from_source(mock_handler(), &source_cr(None)).is_none());
        assert!(MoverBuilder::from_destination(mock_handler(), &destination_cr(None)).is_none());
    }

    #[test]
    fn builder_declines_crs_without_rsync_spec() {
        let mut cr = source_cr(Some(RSYNC_WITH_STUNNEL_ANNOTATION));
        cr.spec.rsync = None;
        assert!(MoverBuilder::from_source(mock_handler(), &cr).is_none());
    }

    #[test]
    fn owner_info_carries_cr_identity() {
        let mover = MoverBuilder::from_destination(
            mock_handler(),
            &destination_cr(Some(RSYNC_WITH_STUNNEL_ANNOTATION)),
        )
        .unwrap();
        assert_eq!(mover.owner.name, "repl");
        assert_eq!(mover.owner.namespace, "ns1");
        assert_eq!(mover.owner.uid, "u1");
        assert_eq!(mover.owner.kind, "ReplicationDestination");
        assert_eq!(mover.owner.api_version, "volrep.dev/v1alpha1");

        let owner_ref = mover.owner.owner_reference();
        assert_eq!(owner_ref.uid, "u1");
        assert_eq!(owner_ref.kind, "ReplicationDestination");
    }

    #[test]
    fn selector_labels_encode_direction() {
        let mover = MoverBuilder::from_source(
            mock_handler(),
            &source_cr(Some(RSYNC_WITH_STUNNEL_ANNOTATION)),
        )
        .unwrap();
        let labels = mover.service_selector();
        assert_eq!(labels["app.kubernetes.io/name"], "volrep-src-repl");
        assert_eq!(labels["app.kubernetes.io/part-of"], "volrep");

        let mover = MoverBuilder::from_destination(
            mock_handler(),
            &destination_cr(Some(RSYNC_WITH_STUNNEL_ANNOTATION)),
        )
        .unwrap();
        assert_eq!(
            mover.service_selector()["app.kubernetes.io/name"],
            "volrep-dst-repl"
        );
    }

    #[test]
    fn credentials_parse_as_user_colon_password() {
        let (user, pass) = parse_credentials("root:sekrit").unwrap();
        assert_eq!(user, "root");
        assert_eq!(pass, "sekrit");

        // passwords may themselves contain colons
        let (_, pass) = parse_credentials("root:se:kr:it").unwrap();
        assert_eq!(pass, "se:kr:it");

        assert!(parse_credentials("no-separator").is_err());
    }

    #[test]
    fn container_posture_is_locked_down_root() {
        let mutation = transfer_container_mutation();
        let sc = mutation.security_context.unwrap();
        assert_eq!(sc.privileged, Some(false));
        assert_eq!(sc.run_as_user, Some(0));
        assert_eq!(sc.read_only_root_filesystem, Some(true));
        assert_eq!(
            sc.capabilities.unwrap().drop.unwrap(),
            vec!["MKNOD".to_string(), "SETPCAP".to_string()]
        );
    }

    #[test]
    fn meta_mutation_names_objects_after_the_data_pvc() {
        let mover = MoverBuilder::from_destination(
            mock_handler(),
            &destination_cr(Some(RSYNC_WITH_STUNNEL_ANNOTATION)),
        )
        .unwrap();
        let pvc = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some("volrep-repl-dest".to_string()),
                namespace: Some("ns1".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let meta = mover.meta_mutation(&pvc);
        assert_eq!(meta.name(), Some("volrep-repl-dest"));
        assert_eq!(meta.owner_references()[0].uid, "u1");
        assert_eq!(
            meta.labels()["app.kubernetes.io/component"],
            "rsync-data-mover"
        );
    }
}

//! Data-path construction for asynchronous volume replication.
//!
//! Each replication iteration builds a short-lived, authenticated rsync
//! channel between two namespaces: an endpoint publishes an externally
//! reachable address, a transport optionally wraps the channel in TLS
//! (stunnel), and a transfer runs the rsync daemon/client pods on top.
//! The [`mover`] state machine drives one side of a replication from
//! "nothing exists" to "data copied and resources marked reclaimable";
//! the [`cleanup`] sweeper reclaims everything by label afterwards.
//!
//! The outer controller loop, volume snapshotting, and the rsync/stunnel
//! binaries themselves are external collaborators.

#![deny(missing_docs)]

pub mod cleanup;
pub mod crd;
pub mod endpoint;
pub mod error;
pub mod meta;
pub mod mover;
pub mod pvc;
pub mod telemetry;
pub mod transfer;
pub mod transport;

pub use error::Error;
pub use meta::NamespacedName;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Label applied to every object volrep materializes
pub const PART_OF_LABEL_VALUE: &str = "volrep";

/// Annotation selecting the TLS-tunneled (stunnel) data path
pub const RSYNC_WITH_STUNNEL_ANNOTATION: &str = "volrep.dev/mover-rsync-with-stunnel";

/// Annotation selecting the pass-through (null transport) data path
pub const RSYNC_WITH_NULL_ANNOTATION: &str = "volrep.dev/mover-rsync-with-null";

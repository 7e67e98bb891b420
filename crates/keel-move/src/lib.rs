//! Relocation of Cluster API object graphs between management clusters
//!
//! Moves the objects describing one or more workload clusters from a source
//! management cluster to a target one, using ownership-aware wave ordering and
//! UID translation so neither side ever observes an inconsistent graph.
//!
//! ## Architecture
//!
//! ```text
//! Source cluster                         Target cluster
//! ─────────────────                      ──────────────────
//! 1. List movable kinds (per namespace,
//!    cluster-name label selector)
//! 2. Fetch credential Secrets by name
//! 3. Wire owner + soft-reference edges
//! 4. Validate (cycles, unresolved refs)
//! 5. Compute waves (Kahn)
//! 6. Pause every non-global object
//! 7. For each wave (in order):
//!    ├─ Re-read object (paused copy)
//!    ├─ Strip server-assigned fields
//!    ├─ Rewrite ownerRefs/soft refs ─────►  Create object
//!    │                                      (409 → read back existing UID)
//!    ◄──────────── target UID ───────────  Record in translation table
//! 8. Delete source objects, reverse wave order
//!    ├─ Add delete-for-move annotation
//!    ├─ Remove finalizers
//!    └─ Delete (global objects are kept)
//! 9. Unpause ───────────────────────────►  Clear pause marker on copies
//! ```
//!
//! Any failure aborts the run, attempts to unpause whatever was paused on the
//! source, and reports the stage reached plus every identity already migrated.
//! Target-side creations are never rolled back; a re-run resumes because
//! creates that hit "already exists" reconcile the existing object's UID.

mod accessor;
mod bounded;
mod builder;
mod config;
mod coordinator;
mod error;
mod graph;
mod kube_accessor;
mod pause;
mod registry;
mod relocate;
mod sequence;
mod translation;
mod validate;

pub use accessor::{AccessorError, DeadlineAccessor, ResourceAccessor};
pub use builder::{GraphBuilder, NamespaceScope};
pub use config::MoveConfig;
pub use coordinator::{run_move, MoveCoordinator, MoveOptions, MovePhase, MoveReport};
pub use error::{GraphIssue, MoveError, NodeFailure, RelocationOp};
pub use graph::{GraphNode, ObjectGraph, ObjectIdentity, SoftEdge};
pub use kube_accessor::KubeAccessor;
pub use pause::{pause_nodes, unpause_nodes, PauseReport};
pub use registry::{
    discover_movable_kinds, KindDiscovery, MovableKind, MovableKindRegistry, SoftRefRule,
    SoftReference,
};
pub use relocate::{strip_transient_fields, Relocator};
pub use sequence::{MovePlan, Wave};
pub use translation::TranslationTable;
pub use validate::{validate, ValidationReport};

/// Annotation that stops Cluster API controllers from reconciling an object.
pub const PAUSED_ANNOTATION: &str = "cluster.x-k8s.io/paused";

/// Annotation telling provider controllers that a deletion is part of a move,
/// so they must not tear down the underlying infrastructure.
pub const DELETE_FOR_MOVE_ANNOTATION: &str = "clusterctl.cluster.x-k8s.io/delete-for-move";

/// Suffixes of the Secrets Cluster API creates for each cluster
/// (`<cluster>-kubeconfig`, `<cluster>-ca`, ...).
pub const CLUSTER_SECRET_SUFFIXES: &[&str] = &["-kubeconfig", "-ca", "-etcd", "-sa", "-proxy"];
